//! WebSocket fan-out for consolidated events.
//!
//! The broadcaster subscribes to `traffic_events`, serializes each event
//! once, and pushes the shared string into every connected client's
//! bounded queue. A slow client loses its oldest queued messages first;
//! one that keeps falling behind is kicked with close code 1011. The
//! gateway's `/ws/events` handler drives the socket side through
//! [`ClientQueue`]; per-client delivery preserves broker order, and no
//! ordering is promised across clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio_graceful_shutdown::SubsystemHandle;

use roadwatch_core::contract::topic;

use crate::broker::{Broker, BrokerError};
use crate::config::BroadcastConfig;
use crate::health::{component, HealthRegistry, HealthState};
use crate::Session;

/// What a client's send loop sees next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// A serialized event to deliver.
    Message(Arc<str>),
    /// The client fell too far behind; close with 1011.
    Kick,
    /// Graceful shutdown; close with 1000.
    Closed,
}

#[derive(Default)]
struct ClientQueueInner {
    queue: std::collections::VecDeque<Arc<str>>,
    /// Messages dropped on this client for being slow.
    dropped: u64,
    kicked: bool,
    closed: bool,
}

/// One connected client's bounded outbox.
pub struct ClientQueue {
    inner: Mutex<ClientQueueInner>,
    notify: Notify,
}

impl ClientQueue {
    fn new() -> Self {
        ClientQueue {
            inner: Mutex::new(ClientQueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue under the slow-client policy: drop-oldest past
    /// `threshold` queued messages, kick after `kick` cumulative drops.
    fn push(&self, message: Arc<str>, threshold: usize, kick: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.kicked || inner.closed {
            return;
        }
        inner.queue.push_back(message);
        while inner.queue.len() > threshold {
            inner.queue.pop_front();
            inner.dropped += 1;
        }
        if inner.dropped >= kick {
            inner.kicked = true;
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    /// Messages dropped on this client so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Wait for the next item. Kick and close win over queued backlog;
    /// a kicked client's backlog is already stale by definition.
    pub async fn next(&self) -> QueueItem {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.kicked {
                    return QueueItem::Kick;
                }
                if inner.closed {
                    return QueueItem::Closed;
                }
                if let Some(message) = inner.queue.pop_front() {
                    return QueueItem::Message(message);
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Client registry shared between the broadcaster service and the
/// gateway's WebSocket handlers.
#[derive(Clone)]
pub struct BroadcasterHandle {
    cfg: BroadcastConfig,
    clients: Arc<RwLock<HashMap<u64, Arc<ClientQueue>>>>,
    next_id: Arc<AtomicU64>,
}

impl BroadcasterHandle {
    fn new(cfg: BroadcastConfig) -> Self {
        BroadcasterHandle {
            cfg,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a newly connected client.
    pub fn register(&self) -> (u64, Arc<ClientQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ClientQueue::new());
        self.clients.write().unwrap().insert(id, queue.clone());
        log::debug!("broadcast: client {} connected", id);
        (id, queue)
    }

    pub fn unregister(&self, id: u64) {
        if let Some(queue) = self.clients.write().unwrap().remove(&id) {
            log::debug!(
                "broadcast: client {} disconnected ({} dropped)",
                id,
                queue.dropped()
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Serialize once, fan out to every client.
    fn send_to_all(&self, value: &Value) {
        let message: Arc<str> = Arc::from(value.to_string());
        let clients = self.clients.read().unwrap();
        for queue in clients.values() {
            queue.push(
                message.clone(),
                self.cfg.slow_client_threshold,
                self.cfg.slow_client_kick,
            );
        }
    }

    fn close_all(&self) {
        for queue in self.clients.read().unwrap().values() {
            queue.close();
        }
    }
}

pub struct Broadcaster {
    broker: Broker,
    health: HealthRegistry,
    handle: BroadcasterHandle,
}

impl Broadcaster {
    pub fn new(session: &Session) -> Self {
        Broadcaster {
            broker: session.broker(),
            health: session.health(),
            handle: BroadcasterHandle::new(session.config().broadcast),
        }
    }

    /// The registry handle for the gateway.
    pub fn handle(&self) -> BroadcasterHandle {
        self.handle.clone()
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), BrokerError> {
        let mut rx = self.broker.subscribe(topic::TRAFFIC_EVENTS);
        log::info!("broadcast: starting");
        self.health
            .set(component::BROADCASTER, HealthState::Healthy);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    log::info!(
                        "broadcast: shutdown, closing {} clients",
                        self.handle.client_count()
                    );
                    self.handle.close_all();
                    return Ok(());
                }
                record = rx.recv() => match record {
                    Ok(value) => self.handle.send_to_all(&value),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("broadcast: lost {} events to lag", n);
                    }
                    Err(RecvError::Closed) => {
                        self.handle.close_all();
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(threshold: usize, kick: u64) -> BroadcasterHandle {
        BroadcasterHandle::new(BroadcastConfig {
            slow_client_threshold: threshold,
            slow_client_kick: kick,
        })
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let handle = handle(64, 256);
        let (_, queue) = handle.register();

        for i in 0..5 {
            handle.send_to_all(&json!({"i": i}));
        }
        for i in 0..5 {
            match queue.next().await {
                QueueItem::Message(m) => assert!(m.contains(&format!("\"i\":{}", i))),
                other => panic!("Expected message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_client_drops_oldest() {
        let handle = handle(3, 100);
        let (_, queue) = handle.register();

        for i in 0..5 {
            handle.send_to_all(&json!({"i": i}));
        }
        // The two oldest were dropped; delivery resumes at i=2 and stays
        // a subsequence, in order, of what was emitted.
        assert_eq!(queue.dropped(), 2);
        match queue.next().await {
            QueueItem::Message(m) => assert!(m.contains("\"i\":2")),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persistent_laggard_is_kicked() {
        let handle = handle(2, 4);
        let (_, queue) = handle.register();

        for i in 0..10 {
            handle.send_to_all(&json!({"i": i}));
        }
        assert_eq!(queue.next().await, QueueItem::Kick);
    }

    #[tokio::test]
    async fn test_close_all_on_shutdown() {
        let handle = handle(64, 256);
        let (_, queue) = handle.register();
        handle.close_all();
        assert_eq!(queue.next().await, QueueItem::Closed);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let handle = handle(64, 256);
        let (id, _queue) = handle.register();
        assert_eq!(handle.client_count(), 1);
        handle.unregister(id);
        assert_eq!(handle.client_count(), 0);
    }
}
