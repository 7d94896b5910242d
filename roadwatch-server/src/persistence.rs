//! Persistence: the batched SQLite writer, the retention scan and the
//! read-side queries behind the gateway.
//!
//! The writer is the sole durable owner of consolidated events. It
//! consumes `traffic_events`, buffers, and flushes a batch when the
//! buffer reaches `batch_max`, when the oldest buffered event ages past
//! `batch_max_age`, or on shutdown. Each flush is one transaction using
//! an idempotent upsert on the `event_id` primary key, so an at-least-
//! once topic becomes exactly-once rows.
//!
//! The gateway reads through a separate read-only pool; the two sides
//! share nothing but the database file.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout, Instant};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use uuid::Uuid;

use roadwatch_core::contract::{self, topic, DatabaseNotice, DatabaseNoticeKind, WireRecord};
use roadwatch_core::model::{
    AlertLevel, CameraDetection, ConsolidatedEvent, Direction, RadarSample, WeatherSnapshot,
    WeatherSource,
};

use crate::broker::Broker;
use crate::config::PersistenceConfig;
use crate::health::{component, HealthRegistry, HealthState};
use crate::Session;

/// Sustained flush failure beyond this marks the writer degraded.
const DEGRADED_AFTER: Duration = Duration::from_secs(30);
/// Shutdown drain budget for the final flush.
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(5);
/// How long the writer keeps listening during shutdown for events the
/// consolidator is still draining.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(2500);
/// Idle sleep when the buffer is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),
    #[error("Cannot decode stored row: {0}")]
    Decode(String),
    /// A primary-key collision whose payload differs from the stored
    /// row. A replay is normal; this is corruption, and fatal.
    #[error("Conflicting payload for existing event {event_id}")]
    Conflict { event_id: Uuid },
}

// =============================================================================
// Store
// =============================================================================

/// Handle on the `traffic_events` table. Cloning shares the pool.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS traffic_events (
    event_id              TEXT PRIMARY KEY,
    correlation_id        TEXT NOT NULL,
    triggered_at          TEXT NOT NULL,
    consolidated_at       TEXT NOT NULL,
    radar_observed_at     TEXT NOT NULL,
    speed_mph             REAL NOT NULL,
    magnitude             REAL,
    direction             TEXT NOT NULL,
    alert_level           TEXT NOT NULL,
    vehicle_type          TEXT,
    camera_confidence     REAL,
    camera_observed_at    TEXT,
    camera_bbox           TEXT,
    camera_image_ref      TEXT,
    local_observed_at     TEXT,
    local_temperature_c   REAL,
    local_humidity_pct    REAL,
    local_wind_mps        REAL,
    local_visibility_m    REAL,
    airport_observed_at   TEXT,
    airport_temperature_c REAL,
    airport_wind_mps      REAL,
    airport_visibility_m  REAL,
    airport_conditions    TEXT
);
CREATE INDEX IF NOT EXISTS idx_traffic_events_consolidated_at
    ON traffic_events (consolidated_at);
CREATE INDEX IF NOT EXISTS idx_traffic_events_vehicle_type
    ON traffic_events (vehicle_type);
";

const INSERT_SQL: &str = "
INSERT INTO traffic_events (
    event_id, correlation_id, triggered_at, consolidated_at,
    radar_observed_at, speed_mph, magnitude, direction, alert_level,
    vehicle_type, camera_confidence, camera_observed_at, camera_bbox,
    camera_image_ref,
    local_observed_at, local_temperature_c, local_humidity_pct,
    local_wind_mps, local_visibility_m,
    airport_observed_at, airport_temperature_c, airport_wind_mps,
    airport_visibility_m, airport_conditions
) VALUES (
    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
)
ON CONFLICT (event_id) DO NOTHING
";

const SELECT_COLUMNS: &str = "
SELECT event_id, correlation_id, triggered_at, consolidated_at,
       radar_observed_at, speed_mph, magnitude, direction, alert_level,
       vehicle_type, camera_confidence, camera_observed_at, camera_bbox,
       camera_image_ref,
       local_observed_at, local_temperature_c, local_humidity_pct,
       local_wind_mps, local_visibility_m,
       airport_observed_at, airport_temperature_c, airport_wind_mps,
       airport_visibility_m, airport_conditions
FROM traffic_events
";

impl EventStore {
    /// Open (creating if missing) and migrate the store. This is the
    /// writer's pool; the gateway uses [`EventStore::connect_read_only`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // An in-memory database exists per connection: keep a single
        // connection and skip WAL, which only applies to files.
        let memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let max_connections = if memory { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = EventStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Read-only pool for the gateway. The schema must already exist;
    /// the connection inherits the file's journal mode.
    pub async fn connect_read_only(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(EventStore { pool })
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a batch in one transaction. Replaying an identical event
    /// is absorbed by the primary key and the first row stays
    /// byte-identical; a key collision with a *different* payload is
    /// [`StoreError::Conflict`], which callers treat as fatal.
    /// Returns the number of rows actually inserted.
    pub async fn insert_batch(&self, events: &[ConsolidatedEvent]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for event in events {
            let camera = event.camera.as_ref();
            let local = event.weather_local.as_ref();
            let airport = event.weather_airport.as_ref();
            let done = sqlx::query(INSERT_SQL)
                .bind(event.event_id.to_string())
                .bind(event.correlation_id.to_string())
                .bind(encode_ts(&event.triggered_at))
                .bind(encode_ts(&event.consolidated_at))
                .bind(encode_ts(&event.radar.observed_at))
                .bind(event.radar.speed_mph)
                .bind(event.radar.magnitude)
                .bind(event.radar.direction.to_string())
                .bind(event.radar.alert_level.as_str())
                .bind(camera.map(|c| c.vehicle_type.as_str()))
                .bind(camera.map(|c| c.confidence))
                .bind(camera.map(|c| encode_ts(&c.observed_at)))
                .bind(camera.and_then(|c| c.bbox).map(|b| {
                    serde_json::to_string(&b).unwrap_or_default()
                }))
                .bind(camera.and_then(|c| c.image_ref.as_deref()))
                .bind(local.map(|w| encode_ts(&w.observed_at)))
                .bind(local.map(|w| w.temperature_c))
                .bind(local.and_then(|w| w.humidity_pct))
                .bind(local.and_then(|w| w.wind_mps))
                .bind(local.and_then(|w| w.visibility_m))
                .bind(airport.map(|w| encode_ts(&w.observed_at)))
                .bind(airport.map(|w| w.temperature_c))
                .bind(airport.and_then(|w| w.wind_mps))
                .bind(airport.and_then(|w| w.visibility_m))
                .bind(airport.and_then(|w| w.conditions.as_deref()))
                .execute(&mut *tx)
                .await?;

            if done.rows_affected() == 0 {
                // The key already exists; a replay must match the stored
                // row exactly, anything else is a conflicting payload.
                let sql = format!("{} WHERE event_id = ?", SELECT_COLUMNS);
                let row = sqlx::query(&sql)
                    .bind(event.event_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                if row_to_event(&row)? != *event {
                    return Err(StoreError::Conflict {
                        event_id: event.event_id,
                    });
                }
            } else {
                inserted += done.rows_affected();
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Newest events first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ConsolidatedEvent>, StoreError> {
        let sql = format!("{} ORDER BY consolidated_at DESC LIMIT ?", SELECT_COLUMNS);
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Chronological slice; `end` is exclusive.
    pub async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ConsolidatedEvent>, StoreError> {
        let sql = format!(
            "{} WHERE consolidated_at >= ? AND consolidated_at < ?
             ORDER BY consolidated_at ASC LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(encode_ts(&start))
            .bind(encode_ts(&end))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// `(speed, vehicle_type)` rows for the stats endpoint. `None`
    /// cutoff means all rows.
    pub async fn speed_rows_since(
        &self,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<(f64, Option<String>)>, StoreError> {
        let rows = match cutoff {
            Some(cutoff) => {
                sqlx::query(
                    "SELECT speed_mph, vehicle_type FROM traffic_events
                     WHERE consolidated_at >= ?",
                )
                .bind(encode_ts(&cutoff))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT speed_mph, vehicle_type FROM traffic_events")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<f64, _>("speed_mph")?,
                    row.try_get::<Option<String>, _>("vehicle_type")?,
                ))
            })
            .collect()
    }

    /// Delete up to `batch` rows consolidated before `cutoff`. Batched
    /// through a rowid subselect to keep each delete's lock short.
    pub async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM traffic_events WHERE rowid IN (
                 SELECT rowid FROM traffic_events
                 WHERE consolidated_at < ? LIMIT ?
             )",
        )
        .bind(encode_ts(&cutoff))
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM traffic_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

fn encode_ts(at: &DateTime<Utc>) -> String {
    // Fixed-width nanoseconds keep the TEXT column lexicographically
    // ordered and the round trip exact.
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp '{}': {}", s, e)))
}

fn decode_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Decode(format!("bad uuid '{}': {}", s, e)))
}

fn row_to_event(row: &SqliteRow) -> Result<ConsolidatedEvent, StoreError> {
    let direction: String = row.try_get("direction")?;
    let alert_level: String = row.try_get("alert_level")?;
    let radar = RadarSample {
        correlation_id: decode_uuid(&row.try_get::<String, _>("correlation_id")?)?,
        observed_at: decode_ts(&row.try_get::<String, _>("radar_observed_at")?)?,
        speed_mph: row.try_get("speed_mph")?,
        magnitude: row.try_get("magnitude")?,
        direction: Direction::from_str(&direction)
            .map_err(|_| StoreError::Decode(format!("bad direction '{}'", direction)))?,
        alert_level: AlertLevel::from_str(&alert_level)
            .map_err(|_| StoreError::Decode(format!("bad alert level '{}'", alert_level)))?,
    };

    let camera = match row.try_get::<Option<String>, _>("camera_observed_at")? {
        Some(observed_at) => Some(CameraDetection {
            observed_at: decode_ts(&observed_at)?,
            vehicle_type: row
                .try_get::<Option<String>, _>("vehicle_type")?
                .ok_or_else(|| StoreError::Decode("camera row without vehicle_type".into()))?,
            confidence: row
                .try_get::<Option<f64>, _>("camera_confidence")?
                .ok_or_else(|| StoreError::Decode("camera row without confidence".into()))?,
            bbox: row
                .try_get::<Option<String>, _>("camera_bbox")?
                .map(|b| {
                    serde_json::from_str(&b)
                        .map_err(|e| StoreError::Decode(format!("bad bbox '{}': {}", b, e)))
                })
                .transpose()?,
            image_ref: row.try_get("camera_image_ref")?,
        }),
        None => None,
    };

    let weather_local = match row.try_get::<Option<String>, _>("local_observed_at")? {
        Some(observed_at) => Some(WeatherSnapshot {
            source: WeatherSource::Local,
            observed_at: decode_ts(&observed_at)?,
            temperature_c: row
                .try_get::<Option<f64>, _>("local_temperature_c")?
                .ok_or_else(|| StoreError::Decode("local weather without temperature".into()))?,
            humidity_pct: row.try_get("local_humidity_pct")?,
            wind_mps: row.try_get("local_wind_mps")?,
            visibility_m: row.try_get("local_visibility_m")?,
            conditions: None,
        }),
        None => None,
    };

    let weather_airport = match row.try_get::<Option<String>, _>("airport_observed_at")? {
        Some(observed_at) => Some(WeatherSnapshot {
            source: WeatherSource::Airport,
            observed_at: decode_ts(&observed_at)?,
            temperature_c: row
                .try_get::<Option<f64>, _>("airport_temperature_c")?
                .ok_or_else(|| StoreError::Decode("airport weather without temperature".into()))?,
            humidity_pct: None,
            wind_mps: row.try_get("airport_wind_mps")?,
            visibility_m: row.try_get("airport_visibility_m")?,
            conditions: row.try_get("airport_conditions")?,
        }),
        None => None,
    };

    Ok(ConsolidatedEvent {
        event_id: decode_uuid(&row.try_get::<String, _>("event_id")?)?,
        correlation_id: radar.correlation_id,
        triggered_at: decode_ts(&row.try_get::<String, _>("triggered_at")?)?,
        consolidated_at: decode_ts(&row.try_get::<String, _>("consolidated_at")?)?,
        radar,
        camera,
        weather_local,
        weather_airport,
    })
}

// =============================================================================
// Writer
// =============================================================================

pub struct PersistenceWriter {
    broker: Broker,
    health: HealthRegistry,
    cfg: PersistenceConfig,
    store: EventStore,
    buffer: VecDeque<(Instant, ConsolidatedEvent)>,
    overflow_dropped: u64,
}

impl PersistenceWriter {
    pub fn new(session: &Session, store: EventStore) -> Self {
        PersistenceWriter {
            broker: session.broker(),
            health: session.health(),
            cfg: session.config().persistence,
            store,
            buffer: VecDeque::new(),
            overflow_dropped: 0,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), StoreError> {
        let mut rx = self.broker.subscribe(topic::TRAFFIC_EVENTS);
        log::info!(
            "writer: starting (batch {} / {} ms, retention {} days)",
            self.cfg.batch_max,
            self.cfg.batch_max_age_ms,
            self.cfg.retention_days
        );
        self.health
            .set(component::PERSISTENCE_WRITER, HealthState::Healthy);

        // Retention runs beside the writer on the same store.
        let retention = RetentionTask {
            store: self.store.clone(),
            broker: self.broker.clone(),
            cfg: self.cfg.clone(),
        };
        subsys.start(SubsystemBuilder::new("Retention", |s| retention.run(s)));

        loop {
            let flush_at = self
                .buffer
                .front()
                .map(|(at, _)| *at + Duration::from_millis(self.cfg.batch_max_age_ms));

            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    self.drain_pending(&mut rx).await;
                    self.final_flush().await;
                    return Ok(());
                }
                record = rx.recv() => match record {
                    Ok(value) => {
                        self.ingest(value);
                        if self.buffer.len() >= self.cfg.batch_max
                            && self.flush_with_retry(&subsys).await?
                        {
                            self.final_flush().await;
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("writer: lost {} events to subscriber lag", n);
                    }
                    Err(RecvError::Closed) => {
                        self.final_flush().await;
                        return Ok(());
                    }
                },
                _ = flush_timer(flush_at) => {
                    if self.flush_with_retry(&subsys).await? {
                        self.final_flush().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decode and buffer one record, enforcing the hard cap by dropping
    /// the oldest buffered events.
    fn ingest(&mut self, value: Value) {
        match contract::decode(&value) {
            Ok(Some(WireRecord::ConsolidatedEvent(event))) => {
                self.buffer.push_back((Instant::now(), event));
                let cap = self.cfg.buffer_cap();
                while self.buffer.len() > cap {
                    if let Some((_, dropped)) = self.buffer.pop_front() {
                        self.overflow_dropped += 1;
                        log::warn!(
                            "{}: buffer over capacity, dropped event {} ({} total)",
                            dropped.correlation_id,
                            dropped.event_id,
                            self.overflow_dropped
                        );
                    }
                    self.health
                        .set(component::PERSISTENCE_WRITER, HealthState::Unhealthy);
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                let schema = value.get("schema").and_then(Value::as_str).unwrap_or("?");
                self.broker.count_unknown_schema(topic::TRAFFIC_EVENTS, schema);
            }
            Err(e) => log::debug!("writer: dropped malformed record: {}", e),
        }
    }

    /// Flush one batch, retrying with capped backoff until it lands.
    /// Returns true when a shutdown request interrupted the retry loop;
    /// a conflicting-payload collision propagates as fatal.
    async fn flush_with_retry(&mut self, subsys: &SubsystemHandle) -> Result<bool, StoreError> {
        let mut backoff = Duration::from_millis(self.cfg.retry_initial_ms);
        let backoff_cap = Duration::from_millis(self.cfg.retry_max_ms);
        let failing_since = Instant::now();

        loop {
            if self.try_flush_one_batch().await? {
                return Ok(false);
            }
            if failing_since.elapsed() >= DEGRADED_AFTER {
                self.health
                    .set(component::PERSISTENCE_WRITER, HealthState::Degraded);
            }
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => return Ok(true),
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    /// One transaction over the first `batch_max` buffered events.
    /// Flushes never span batches: the (batch_max + 1)-th event waits
    /// for the next one. `Ok(false)` is a transient failure the caller
    /// retries; `Err` is a conflicting payload, which no retry can fix.
    async fn try_flush_one_batch(&mut self) -> Result<bool, StoreError> {
        if self.buffer.is_empty() {
            return Ok(true);
        }
        let take = self.buffer.len().min(self.cfg.batch_max);
        let batch: Vec<ConsolidatedEvent> =
            self.buffer.iter().take(take).map(|(_, e)| e.clone()).collect();

        let tx_timeout = Duration::from_secs(self.cfg.tx_timeout_s);
        match timeout(tx_timeout, self.store.insert_batch(&batch)).await {
            Ok(Ok(inserted)) => {
                self.buffer.drain(..take);
                for event in &batch {
                    log::debug!("{}: persisted event {}", event.correlation_id, event.event_id);
                }
                self.health
                    .set(component::PERSISTENCE_WRITER, HealthState::Healthy);
                self.publish_notice(DatabaseNoticeKind::BatchFlushed, inserted);
                Ok(true)
            }
            Ok(Err(e @ StoreError::Conflict { .. })) => {
                log::error!("writer: {}", e);
                self.health
                    .set(component::PERSISTENCE_WRITER, HealthState::Unhealthy);
                Err(e)
            }
            Ok(Err(e)) => {
                log::error!("writer: batch flush of {} events failed: {}", take, e);
                Ok(false)
            }
            Err(_) => {
                log::error!(
                    "writer: batch flush timed out after {}s",
                    self.cfg.tx_timeout_s
                );
                Ok(false)
            }
        }
    }

    /// Keep consuming the topic for a short window after shutdown is
    /// requested, so events the consolidator emits while draining still
    /// make it into the final flush.
    async fn drain_pending(&mut self, rx: &mut tokio::sync::broadcast::Receiver<Value>) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Ok(value)) => self.ingest(value),
                Ok(Err(RecvError::Lagged(n))) => {
                    log::warn!("writer: lost {} events to subscriber lag", n);
                }
                Ok(Err(RecvError::Closed)) | Err(_) => return,
            }
        }
    }

    /// Shutdown flush: single attempt per batch within a fixed budget.
    async fn final_flush(&mut self) {
        let deadline = Instant::now() + FINAL_FLUSH_DEADLINE;
        while !self.buffer.is_empty() {
            if Instant::now() >= deadline {
                break;
            }
            match self.try_flush_one_batch().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::error!("writer: final flush aborted: {}", e);
                    break;
                }
            }
        }
        if self.buffer.is_empty() {
            log::info!("writer: shutdown, all buffered events flushed");
        } else {
            log::error!(
                "writer: shutdown with {} unflushed events",
                self.buffer.len()
            );
        }
    }

    fn publish_notice(&self, kind: DatabaseNoticeKind, count: u64) {
        let notice = DatabaseNotice {
            kind,
            count,
            at: Utc::now(),
        };
        match contract::encode_database_notice(&notice) {
            Ok(value) => {
                if self.broker.publish(topic::DATABASE_EVENTS, value).is_err() {
                    self.broker.count_publish_failure(topic::DATABASE_EVENTS);
                }
            }
            Err(e) => log::error!("writer: cannot encode database notice: {}", e),
        }
    }
}

async fn flush_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => sleep(IDLE_SLEEP).await,
    }
}

// =============================================================================
// Retention
// =============================================================================

struct RetentionTask {
    store: EventStore,
    broker: Broker,
    cfg: PersistenceConfig,
}

impl RetentionTask {
    async fn run(self, subsys: SubsystemHandle) -> Result<(), StoreError> {
        let interval = Duration::from_secs(self.cfg.retention_scan_interval_s);
        log::info!(
            "retention: scanning every {}s, horizon {} days",
            self.cfg.retention_scan_interval_s,
            self.cfg.retention_days
        );
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => return Ok(()),
                _ = sleep(interval) => self.scan().await,
            }
        }
    }

    async fn scan(&self) {
        let cutoff = Utc::now() - self.cfg.retention();
        let mut total = 0u64;
        loop {
            match self.store.delete_older_than(cutoff, self.cfg.delete_batch).await {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < self.cfg.delete_batch as u64 {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("retention: delete failed: {}", e);
                    break;
                }
            }
        }
        if total > 0 {
            log::info!("retention: deleted {} events older than {}", total, cutoff);
            let notice = DatabaseNotice {
                kind: DatabaseNoticeKind::RetentionPass,
                count: total,
                at: Utc::now(),
            };
            if let Ok(value) = contract::encode_database_notice(&notice) {
                let _ = self.broker.publish(topic::DATABASE_EVENTS, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Duration as ChronoDuration;

    async fn memory_store() -> EventStore {
        EventStore::connect("sqlite::memory:").await.unwrap()
    }

    fn make_event(speed_mph: f64, consolidated_at: DateTime<Utc>) -> ConsolidatedEvent {
        let triggered_at = consolidated_at - ChronoDuration::milliseconds(300);
        // One correlation id flows from the radar sample into the event.
        let correlation_id = Uuid::now_v7();
        ConsolidatedEvent {
            event_id: Uuid::now_v7(),
            correlation_id,
            triggered_at,
            consolidated_at,
            radar: RadarSample {
                correlation_id,
                observed_at: triggered_at,
                speed_mph,
                magnitude: Some(182.5),
                direction: Direction::from_speed(speed_mph, 0.2),
                alert_level: AlertLevel::Normal,
            },
            camera: Some(CameraDetection {
                observed_at: triggered_at + ChronoDuration::milliseconds(250),
                vehicle_type: "car".to_string(),
                confidence: 0.91,
                bbox: Some([10, 20, 110, 220]),
                image_ref: Some("cap/000123.jpg".to_string()),
            }),
            weather_local: Some(WeatherSnapshot {
                source: WeatherSource::Local,
                observed_at: triggered_at - ChronoDuration::seconds(10),
                temperature_c: 18.0,
                humidity_pct: Some(55.0),
                wind_mps: None,
                visibility_m: None,
                conditions: None,
            }),
            weather_airport: None,
        }
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = memory_store().await;
        let event = make_event(22.5, Utc::now());
        store.insert_batch(std::slice::from_ref(&event)).await.unwrap();

        let read = store.recent(10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], event);
    }

    #[tokio::test]
    async fn test_round_trip_with_nulls() {
        let store = memory_store().await;
        let mut event = make_event(-8.0, Utc::now());
        event.camera = None;
        event.weather_local = None;
        event.weather_airport = None;
        store.insert_batch(std::slice::from_ref(&event)).await.unwrap();

        let read = store.recent(10).await.unwrap();
        assert_eq!(read[0], event);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = memory_store().await;
        let event = make_event(22.5, Utc::now());

        let first = store.insert_batch(std::slice::from_ref(&event)).await.unwrap();
        assert_eq!(first, 1);
        for _ in 0..3 {
            let again = store.insert_batch(std::slice::from_ref(&event)).await.unwrap();
            assert_eq!(again, 0);
        }

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.recent(10).await.unwrap()[0], event);
    }

    #[tokio::test]
    async fn test_conflicting_payload_is_fatal() {
        let store = memory_store().await;
        let event = make_event(22.5, Utc::now());
        store.insert_batch(std::slice::from_ref(&event)).await.unwrap();

        // Same id, different payload: not a replay, an error the writer
        // escalates to process shutdown.
        let mut conflicting = event.clone();
        conflicting.radar.speed_mph = 99.0;
        let err = store
            .insert_batch(std::slice::from_ref(&conflicting))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { event_id } if event_id == event.event_id));

        // The stored row is untouched.
        assert_eq!(store.recent(10).await.unwrap()[0].radar.speed_mph, 22.5);
    }

    #[tokio::test]
    async fn test_recent_newest_first() {
        let store = memory_store().await;
        let base = Utc::now();
        let events: Vec<ConsolidatedEvent> = (0..5)
            .map(|i| make_event(10.0 + i as f64, base + ChronoDuration::seconds(i)))
            .collect();
        store.insert_batch(&events).await.unwrap();

        let read = store.recent(3).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].radar.speed_mph, 14.0);
        assert_eq!(read[2].radar.speed_mph, 12.0);
    }

    #[tokio::test]
    async fn test_range_end_exclusive() {
        let store = memory_store().await;
        let base = Utc::now();
        let first = make_event(10.0, base);
        let second = make_event(20.0, base + ChronoDuration::seconds(10));
        store
            .insert_batch(&[first.clone(), second.clone()])
            .await
            .unwrap();

        let read = store
            .range(base, second.consolidated_at, 100)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], first);

        // Nudging the end past the second event includes it, in
        // chronological order.
        let read = store
            .range(
                base,
                second.consolidated_at + ChronoDuration::nanoseconds(1),
                100,
            )
            .await
            .unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], first);
    }

    // Retention boundary: only rows older than the horizon go.
    #[tokio::test]
    async fn test_retention_deletes_past_horizon() {
        let store = memory_store().await;
        let now = Utc::now();
        let old = make_event(10.0, now - ChronoDuration::days(91));
        let young = make_event(20.0, now - ChronoDuration::days(89));
        store.insert_batch(&[old, young.clone()]).await.unwrap();

        let cutoff = now - ChronoDuration::days(90);
        let deleted = store.delete_older_than(cutoff, 1000).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.recent(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0], young);
    }

    #[tokio::test]
    async fn test_retention_respects_batch_size() {
        let store = memory_store().await;
        let now = Utc::now();
        let events: Vec<ConsolidatedEvent> = (0..5)
            .map(|i| make_event(10.0, now - ChronoDuration::days(100 + i)))
            .collect();
        store.insert_batch(&events).await.unwrap();

        let cutoff = now - ChronoDuration::days(90);
        assert_eq!(store.delete_older_than(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.delete_older_than(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.delete_older_than(cutoff, 2).await.unwrap(), 1);
        assert_eq!(store.delete_older_than(cutoff, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_speed_rows_for_stats() {
        let store = memory_store().await;
        let now = Utc::now();
        let mut no_camera = make_event(-30.0, now);
        no_camera.camera = None;
        store
            .insert_batch(&[make_event(22.5, now), no_camera])
            .await
            .unwrap();

        let rows = store.speed_rows_since(None).await.unwrap();
        assert_eq!(rows.len(), 2);

        let stats = roadwatch_core::stats::summarize(rows);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.by_type.get("car"), Some(&1));
        assert!((stats.avg_speed_mph.unwrap() - 26.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_read_only_pool_sees_writer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("events.db").display());

        let writer_store = EventStore::connect(&url).await.unwrap();
        let event = make_event(22.5, Utc::now());
        writer_store
            .insert_batch(std::slice::from_ref(&event))
            .await
            .unwrap();

        let read_store = EventStore::connect_read_only(&url).await.unwrap();
        let read = read_store.recent(10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], event);

        // The gateway's pool cannot write.
        assert!(read_store.insert_batch(&[make_event(1.0, Utc::now())]).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_buffer_cap_drops_oldest() {
        let session = Session::new(Config::default());
        let store = memory_store().await;
        let mut writer = PersistenceWriter::new(&session, store);
        writer.cfg.batch_max = 2; // cap = 16

        let base = Utc::now();
        for i in 0..20 {
            let event = make_event(i as f64, base + ChronoDuration::seconds(i));
            let value = contract::encode_consolidated_event(&event).unwrap();
            writer.ingest(value);
        }

        assert_eq!(writer.buffer.len(), writer.cfg.buffer_cap());
        assert_eq!(writer.overflow_dropped, 4);
        // The oldest were dropped, the newest survived.
        assert_eq!(writer.buffer.back().unwrap().1.radar.speed_mph, 19.0);
        assert_eq!(writer.buffer.front().unwrap().1.radar.speed_mph, 4.0);
    }

    #[tokio::test]
    async fn test_writer_flushes_batch() {
        let session = Session::new(Config::default());
        let store = memory_store().await;
        let mut writer = PersistenceWriter::new(&session, store.clone());

        let base = Utc::now();
        for i in 0..3 {
            let event = make_event(i as f64, base + ChronoDuration::seconds(i));
            writer.ingest(contract::encode_consolidated_event(&event).unwrap());
        }
        assert!(writer.try_flush_one_batch().await.unwrap());
        assert!(writer.buffer.is_empty());
        assert_eq!(store.count().await.unwrap(), 3);
    }
}
