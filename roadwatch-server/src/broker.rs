//! In-process realization of the broker contract.
//!
//! Three primitives, named by `roadwatch_core::contract`:
//!
//! - **topics**: non-durable pub/sub on [`tokio::sync::broadcast`]. Each
//!   subscriber gets a bounded buffer; a subscriber that lags loses its
//!   oldest undelivered records (newest wins), never the publisher.
//! - **streams**: append-only bounded rings with an integer cursor per
//!   consumer group.
//! - **cache**: string-keyed last-writer-wins values with optional TTL,
//!   expired lazily on read.
//!
//! The broker owns all in-flight records; components hold only cloned
//! handles and never reference each other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use roadwatch_core::contract::{stream, topic};

/// Per-subscriber topic buffer. A subscriber further behind than this
/// starts losing its oldest queued records.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("No such stream '{0}'")]
    NoSuchStream(String),
    #[error("Topic '{0}' refused the record")]
    PublishFailed(String),
}

struct StreamShard {
    entries: VecDeque<(u64, Value)>,
    maxlen: usize,
    next_index: u64,
    cursors: HashMap<String, u64>,
}

impl StreamShard {
    fn new(maxlen: usize) -> Self {
        StreamShard {
            entries: VecDeque::new(),
            maxlen,
            next_index: 0,
            cursors: HashMap::new(),
        }
    }

    fn append(&mut self, record: Value) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.entries.push_back((index, record));
        while self.entries.len() > self.maxlen {
            self.entries.pop_front();
        }
        index
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Counter snapshot for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerCounters {
    pub publish_failures: u64,
    pub unknown_schema_dropped: u64,
}

struct BrokerInner {
    topics: RwLock<HashMap<String, broadcast::Sender<Value>>>,
    streams: Mutex<HashMap<String, StreamShard>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    last_publish: Mutex<HashMap<String, DateTime<Utc>>>,
    publish_failures: AtomicU64,
    unknown_schema_dropped: AtomicU64,
}

/// Cheaply clonable broker handle; every component gets its own clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Create a broker with the contract's fixed topics and streams
    /// registered.
    pub fn new() -> Self {
        let mut topics = HashMap::new();
        for name in topic::ALL {
            let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
            topics.insert(name.to_string(), tx);
        }

        let mut streams = HashMap::new();
        streams.insert(
            stream::RADAR_DATA.to_string(),
            StreamShard::new(stream::RADAR_DATA_MAXLEN),
        );
        streams.insert(
            stream::CONSOLIDATED_TRAFFIC_DATA.to_string(),
            StreamShard::new(stream::CONSOLIDATED_TRAFFIC_DATA_MAXLEN),
        );

        Broker {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(topics),
                streams: Mutex::new(streams),
                cache: Mutex::new(HashMap::new()),
                last_publish: Mutex::new(HashMap::new()),
                publish_failures: AtomicU64::new(0),
                unknown_schema_dropped: AtomicU64::new(0),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        if let Some(tx) = self.inner.topics.read().unwrap().get(topic) {
            return tx.clone();
        }
        self.inner
            .topics
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .clone()
    }

    /// Publish a record. Returns the number of subscribers it reached;
    /// zero subscribers is not an error.
    pub fn publish(&self, topic: &str, record: Value) -> Result<usize, BrokerError> {
        let tx = self.sender(topic);
        self.inner
            .last_publish
            .lock()
            .unwrap()
            .insert(topic.to_string(), Utc::now());
        Ok(tx.send(record).unwrap_or(0))
    }

    /// Subscribe to a topic, creating it on first use. The receiver's
    /// buffer is [`SUBSCRIBER_BUFFER`]; lagging surfaces as
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).subscribe()
    }

    /// Record a failed publish attempt. The producer proceeds; the
    /// failure only shows up in counters and logs.
    pub fn count_publish_failure(&self, topic: &str) {
        self.inner.publish_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("broker: publish to '{}' failed", topic);
    }

    /// Record a record dropped for carrying an unknown schema.
    pub fn count_unknown_schema(&self, topic: &str, schema: &str) {
        self.inner
            .unknown_schema_dropped
            .fetch_add(1, Ordering::Relaxed);
        log::debug!("broker: dropped unknown schema '{}' on '{}'", schema, topic);
    }

    pub fn counters(&self) -> BrokerCounters {
        BrokerCounters {
            publish_failures: self.inner.publish_failures.load(Ordering::Relaxed),
            unknown_schema_dropped: self.inner.unknown_schema_dropped.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Append to a bounded stream, returning the record's index.
    pub fn stream_append(&self, name: &str, record: Value) -> Result<u64, BrokerError> {
        let mut streams = self.inner.streams.lock().unwrap();
        let shard = streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::NoSuchStream(name.to_string()))?;
        Ok(shard.append(record))
    }

    /// Latest record on a stream, if any.
    pub fn stream_latest(&self, name: &str) -> Option<Value> {
        let streams = self.inner.streams.lock().unwrap();
        streams
            .get(name)
            .and_then(|s| s.entries.back().map(|(_, v)| v.clone()))
    }

    /// Up to `limit` newest records, newest first.
    pub fn stream_recent(&self, name: &str, limit: usize) -> Vec<Value> {
        let streams = self.inner.streams.lock().unwrap();
        match streams.get(name) {
            Some(s) => s
                .entries
                .iter()
                .rev()
                .take(limit)
                .map(|(_, v)| v.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Read up to `max` records for a consumer group, advancing its
    /// cursor. A cursor that fell off the ring's tail jumps forward to
    /// the oldest retained record.
    pub fn stream_read(
        &self,
        name: &str,
        group: &str,
        max: usize,
    ) -> Result<Vec<(u64, Value)>, BrokerError> {
        let mut streams = self.inner.streams.lock().unwrap();
        let shard = streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::NoSuchStream(name.to_string()))?;

        let cursor = shard.cursors.get(group).copied().unwrap_or(0);
        let records: Vec<(u64, Value)> = shard
            .entries
            .iter()
            .filter(|(i, _)| *i >= cursor)
            .take(max)
            .cloned()
            .collect();

        if let Some((last, _)) = records.last() {
            shard.cursors.insert(group.to_string(), last + 1);
        } else if cursor < shard.next_index.saturating_sub(shard.entries.len() as u64) {
            // Fell off the tail with nothing readable; resynchronize.
            let oldest = shard.entries.front().map(|(i, _)| *i).unwrap_or(shard.next_index);
            shard.cursors.insert(group.to_string(), oldest);
        }
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------

    /// Last-writer-wins cache write with optional TTL.
    pub fn cache_set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Utc::now() + ttl),
            },
        );
    }

    /// Read a cache key; expired entries read as absent and are removed.
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        let mut cache = self.inner.cache.lock().unwrap();
        match cache.get(key) {
            Some(entry) => {
                if entry
                    .expires_at
                    .map(|at| at <= Utc::now())
                    .unwrap_or(false)
                {
                    cache.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Seconds since the last publish on a topic, if it ever published.
    pub fn last_event_age_s(&self, topic: &str, now: DateTime<Utc>) -> Option<f64> {
        let last = self.inner.last_publish.lock().unwrap();
        last.get(topic)
            .map(|at| (now - *at).num_milliseconds() as f64 / 1000.0)
    }
}
