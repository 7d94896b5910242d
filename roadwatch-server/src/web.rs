//! Read-only REST + WebSocket gateway.
//!
//! The gateway never publishes into the broker and never references
//! another component. It is constructed from the capability interfaces it
//! actually needs — [`ReadEvents`] (relational history), [`ReadLatestRadar`]
//! and [`ReadWeather`] (broker-backed "latest" reads), [`HealthReport`] —
//! plus the broadcaster's client registry for `/ws/events`. Errors map to
//! HTTP codes in one translation layer: 400 for malformed queries, 503
//! while the persistence writer is unhealthy, 500 for storage faults.

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_graceful_shutdown::SubsystemHandle;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use roadwatch_core::contract::{self, cache_key, stream, topic, WireRecord};
use roadwatch_core::model::{ConsolidatedEvent, RadarSample, WeatherSnapshot};
use roadwatch_core::stats::{self, SpeedStats};

use crate::broadcaster::{BroadcasterHandle, QueueItem};
use crate::broker::Broker;
use crate::health::{component, HealthRegistry, HealthState};
use crate::persistence::{EventStore, StoreError};
use crate::Session;

const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

const HEALTH_URI: &str = "/api/health";
const EVENTS_RECENT_URI: &str = "/api/events/recent";
const EVENTS_URI: &str = "/api/events";
const EVENTS_STATS_URI: &str = "/api/events/stats";
const RADAR_LATEST_URI: &str = "/api/radar/latest";
const WEATHER_LATEST_URI: &str = "/api/weather/latest";
const WS_EVENTS_URI: &str = "/ws/events";

const LIMIT_DEFAULT: u32 = 100;
const LIMIT_MAX: u32 = 1000;

// =============================================================================
// Capability interfaces
// =============================================================================

/// Historical queries against the relational store.
#[async_trait]
pub trait ReadEvents: Send + Sync {
    async fn recent(&self, limit: u32) -> Result<Vec<ConsolidatedEvent>, StoreError>;
    async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ConsolidatedEvent>, StoreError>;
    async fn stats(&self, cutoff: Option<DateTime<Utc>>) -> Result<SpeedStats, StoreError>;
}

#[async_trait]
impl ReadEvents for EventStore {
    async fn recent(&self, limit: u32) -> Result<Vec<ConsolidatedEvent>, StoreError> {
        EventStore::recent(self, limit).await
    }

    async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ConsolidatedEvent>, StoreError> {
        EventStore::range(self, start, end, limit).await
    }

    async fn stats(&self, cutoff: Option<DateTime<Utc>>) -> Result<SpeedStats, StoreError> {
        Ok(stats::summarize(self.speed_rows_since(cutoff).await?))
    }
}

/// Latest radar sample, straight off the bounded stream.
pub trait ReadLatestRadar: Send + Sync {
    fn latest_radar(&self) -> Option<RadarSample>;
}

/// Latest weather snapshots from the cache keys.
pub trait ReadWeather: Send + Sync {
    fn latest_weather(&self) -> (Option<WeatherSnapshot>, Option<WeatherSnapshot>);
}

/// Broker-backed "latest" reads.
pub struct BrokerReads {
    broker: Broker,
}

impl BrokerReads {
    pub fn new(broker: Broker) -> Self {
        BrokerReads { broker }
    }

    fn decode_weather(&self, key: &str) -> Option<WeatherSnapshot> {
        match contract::decode(&self.broker.cache_get(key)?) {
            Ok(Some(WireRecord::WeatherSnapshot(snapshot))) => Some(snapshot),
            _ => None,
        }
    }
}

impl ReadLatestRadar for BrokerReads {
    fn latest_radar(&self) -> Option<RadarSample> {
        match contract::decode(&self.broker.stream_latest(stream::RADAR_DATA)?) {
            Ok(Some(WireRecord::RadarSample(sample))) => Some(sample),
            _ => None,
        }
    }
}

impl ReadWeather for BrokerReads {
    fn latest_weather(&self) -> (Option<WeatherSnapshot>, Option<WeatherSnapshot>) {
        (
            self.decode_weather(cache_key::WEATHER_LOCAL_LATEST),
            self.decode_weather(cache_key::WEATHER_AIRPORT_LATEST),
        )
    }
}

/// Supervisor-level health view.
pub trait HealthReport: Send + Sync {
    fn report(&self) -> HealthResponse;
    /// Gates the events endpoints with 503.
    fn writer_unhealthy(&self) -> bool;
}

/// The default health reporter: registry states joined with per-topic
/// last-event ages and process uptime.
pub struct SessionHealth {
    health: HealthRegistry,
    broker: Broker,
    started_at: DateTime<Utc>,
}

impl SessionHealth {
    pub fn new(session: &Session) -> Self {
        SessionHealth {
            health: session.health(),
            broker: session.broker(),
            started_at: session.started_at(),
        }
    }

    /// The topic whose last-event age tells this component's story.
    fn topic_for(name: &str) -> Option<&'static str> {
        match name {
            component::RADAR_READER => Some(topic::RADAR_DETECTIONS),
            component::WEATHER_CACHE => Some(topic::WEATHER_UPDATES),
            component::CONSOLIDATOR => Some(topic::TRAFFIC_EVENTS),
            component::PERSISTENCE_WRITER => Some(topic::DATABASE_EVENTS),
            _ => None,
        }
    }
}

impl HealthReport for SessionHealth {
    fn report(&self) -> HealthResponse {
        let now = Utc::now();
        let components = self
            .health
            .snapshot()
            .into_iter()
            .map(|(name, c)| {
                let last_event_age_s = Self::topic_for(name)
                    .and_then(|t| self.broker.last_event_age_s(t, now));
                (
                    name.to_string(),
                    ComponentStatus {
                        state: c.state,
                        last_event_age_s,
                    },
                )
            })
            .collect();
        HealthResponse {
            status: self.health.overall(),
            components,
            uptime_s: (now - self.started_at).num_milliseconds() as f64 / 1000.0,
        }
    }

    fn writer_unhealthy(&self) -> bool {
        self.health.is_unhealthy(component::PERSISTENCE_WRITER)
    }
}

// =============================================================================
// Error translation
// =============================================================================

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
    #[error("Invalid query: {0}")]
    BadRequest(String),
    #[error("Service temporarily unavailable")]
    Unavailable,
    #[error("Storage failure")]
    Store(#[from] StoreError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            GatewayError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "service unavailable").into_response()
            }
            GatewayError::Store(e) => {
                log::error!("gateway: storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
            }
            GatewayError::Io(e) => {
                log::error!("gateway: I/O failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Clone)]
pub struct Web {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    events: Arc<dyn ReadEvents>,
    radar: Arc<dyn ReadLatestRadar>,
    weather: Arc<dyn ReadWeather>,
    health: Arc<dyn HealthReport>,
    registry: HealthRegistry,
    broadcaster: BroadcasterHandle,
}

impl Web {
    pub fn new(
        session: &Session,
        events: Arc<dyn ReadEvents>,
        radar: Arc<dyn ReadLatestRadar>,
        weather: Arc<dyn ReadWeather>,
        health: Arc<dyn HealthReport>,
        broadcaster: BroadcasterHandle,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Web {
            port: session.config().http_port,
            shutdown_tx,
            events,
            radar,
            weather,
            health,
            registry: session.health(),
            broadcaster,
        }
    }

    fn router(self) -> Router {
        Router::new()
            .route(HEALTH_URI, get(get_health))
            .route(EVENTS_RECENT_URI, get(get_events_recent))
            .route(EVENTS_URI, get(get_events_range))
            .route(EVENTS_STATS_URI, get(get_events_stats))
            .route(RADAR_LATEST_URI, get(get_radar_latest))
            .route(WEATHER_LATEST_URI, get(get_weather_latest))
            .route(WS_EVENTS_URI, get(ws_events))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(HANDLER_TIMEOUT)),
            )
            .with_state(self)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), GatewayError> {
        let port = self.port;
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone();
        let registry = self.registry.clone();
        let app = self.router();

        log::info!("gateway: listening on port {}", port);
        registry.set(component::GATEWAY, HealthState::Healthy);

        let mut server = pin!(axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                _ = shutdown_rx.recv().await;
            })
            .into_future());

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = &mut server => {
                return r.map_err(GatewayError::Io);
            }
        }
        server.await.map_err(GatewayError::Io)
    }
}

// =============================================================================
// REST handlers
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthState,
    pub components: BTreeMap<String, ComponentStatus>,
    pub uptime_s: f64,
}

#[derive(Serialize)]
pub struct ComponentStatus {
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_age_s: Option<f64>,
}

async fn get_health(State(state): State<Web>) -> Json<HealthResponse> {
    Json(state.health.report())
}

fn parse_limit(limit: Option<u32>) -> Result<u32, GatewayError> {
    match limit {
        None => Ok(LIMIT_DEFAULT),
        Some(n) if (1..=LIMIT_MAX).contains(&n) => Ok(n),
        Some(n) => Err(GatewayError::BadRequest(format!(
            "limit must be within 1..={}, got {}",
            LIMIT_MAX, n
        ))),
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| GatewayError::BadRequest(format!("{}: bad RFC 3339 timestamp: {}", field, e)))
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

async fn get_events_recent(
    State(state): State<Web>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<ConsolidatedEvent>>, GatewayError> {
    let limit = parse_limit(query.limit)?;
    if state.health.writer_unhealthy() {
        return Err(GatewayError::Unavailable);
    }
    Ok(Json(state.events.recent(limit).await?))
}

#[derive(Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
    limit: Option<u32>,
}

async fn get_events_range(
    State(state): State<Web>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ConsolidatedEvent>>, GatewayError> {
    let limit = parse_limit(query.limit)?;
    let start = parse_timestamp("start", &query.start)?;
    let end = parse_timestamp("end", &query.end)?;
    if end <= start {
        return Err(GatewayError::BadRequest(
            "end must be after start".to_string(),
        ));
    }
    if state.health.writer_unhealthy() {
        return Err(GatewayError::Unavailable);
    }
    Ok(Json(state.events.range(start, end, limit).await?))
}

#[derive(Deserialize)]
struct StatsQuery {
    window: Option<String>,
}

async fn get_events_stats(
    State(state): State<Web>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<SpeedStats>, GatewayError> {
    // A zero or absent window means "everything persisted".
    let cutoff = match query.window.as_deref() {
        None => None,
        Some(window) => {
            let duration = stats::parse_iso8601_duration(window)
                .map_err(|e| GatewayError::BadRequest(format!("window: {}", e)))?;
            if duration.is_zero() {
                None
            } else {
                Some(Utc::now() - duration)
            }
        }
    };
    if state.health.writer_unhealthy() {
        return Err(GatewayError::Unavailable);
    }
    Ok(Json(state.events.stats(cutoff).await?))
}

async fn get_radar_latest(State(state): State<Web>) -> Response {
    match state.radar.latest_radar() {
        Some(sample) => Json(sample).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Serialize)]
struct WeatherLatest {
    local: Option<WeatherSnapshot>,
    airport: Option<WeatherSnapshot>,
}

async fn get_weather_latest(State(state): State<Web>) -> Json<WeatherLatest> {
    let (local, airport) = state.weather.latest_weather();
    Json(WeatherLatest { local, airport })
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_events(State(state): State<Web>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: Web, mut socket: WebSocket) {
    let (id, queue) = state.broadcaster.register();

    let hello = serde_json::json!({"schema": "hello", "v": 1}).to_string();
    if socket.send(Message::Text(hello.into())).await.is_err() {
        state.broadcaster.unregister(id);
        return;
    }

    loop {
        tokio::select! {
            item = queue.next() => match item {
                QueueItem::Message(message) => {
                    if socket
                        .send(Message::Text(message.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                QueueItem::Kick => {
                    log::info!("broadcast: kicking slow client {}", id);
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: "too far behind".into(),
                        })))
                        .await;
                    break;
                }
                QueueItem::Closed => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "server shutdown".into(),
                        })))
                        .await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                // Client-to-server payloads are ignored by contract.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    state.broadcaster.unregister(id);
}
