//! # Roadwatch Server
//!
//! Edge traffic-monitoring server with REST API and WebSocket support.
//!
//! This crate wires the pure fusion logic from [`roadwatch_core`] into a
//! running system on a single-board computer:
//! - Reads the Doppler radar over a serial port
//! - Fuses radar triggers with camera detections and weather snapshots
//! - Persists consolidated events to SQLite with a retention policy
//! - Streams events live over WebSocket
//! - Serves read-only REST endpoints for history, stats and health
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      roadwatch-server                        │
//! │                                                              │
//! │  serial ──▶ radar reader ──▶┐                                │
//! │  (external camera) ────────▶│  Broker                       │
//! │  (external weather) ──▶ weather cache ──▶ topics / streams  │
//! │                             │  / cache keys                 │
//! │                             ▼                                │
//! │                       consolidator                           │
//! │                             │ traffic_events                 │
//! │               ┌─────────────┴─────────────┐                  │
//! │               ▼                           ▼                  │
//! │       persistence writer            broadcaster              │
//! │          (SQLite)                  (WebSocket)               │
//! │               ▲                           ▲                  │
//! │               └───────── gateway ─────────┘                  │
//! │                    (axum, read-only)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All inter-component coupling goes through the [`broker::Broker`]; no
//! component holds a reference to another. The gateway is constructed
//! from explicit capability interfaces, so the dependency graph stays
//! acyclic.
//!
//! ## Key Components
//!
//! - [`Session`] - Main application state container
//! - [`broker::Broker`] - In-process topics, streams and cache
//! - [`radar::RadarReader`] - Serial frame reader
//! - [`consolidator::Consolidator`] - Trigger-to-event fusion service
//! - [`persistence::PersistenceWriter`] - Batched SQLite writer
//! - [`broadcaster::Broadcaster`] - WebSocket fan-out
//! - [`web::Web`] - REST + WebSocket gateway
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use roadwatch_server::{supervisor, Cli, Session};
//! use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["roadwatch-server", "-p", "8080"]);
//!     let config = args.into_config().unwrap();
//!
//!     Toplevel::new(move |s| async move {
//!         let session = Session::new(config);
//!         s.start(SubsystemBuilder::new("Supervisor", move |subsys| {
//!             supervisor::run(session, subsys)
//!         }));
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```

extern crate tokio;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::mpsc;

use roadwatch_core::model::WeatherSnapshot;

pub mod broadcaster;
pub mod broker;
pub mod config;
pub mod consolidator;
pub mod health;
pub mod persistence;
pub mod radar;
pub mod supervisor;
pub mod weather;
pub mod web;

use broker::Broker;
use config::{Config, ConfigError};
use health::HealthRegistry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the weather snapshot injection channel.
const WEATHER_FEED_CAPACITY: usize = 16;

#[derive(Parser, Clone, Debug)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Port for the REST + WebSocket gateway
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Radar serial device
    #[arg(short, long)]
    pub device: Option<String>,

    /// SQLite database path or URL
    #[arg(long)]
    pub database: Option<String>,

    /// Drop triggers that expire without a camera match instead of
    /// emitting them with a null camera
    #[arg(long, default_value_t = false)]
    pub camera_strict: bool,
}

impl Cli {
    /// Overlay the CLI's deployment-specific flags onto the default
    /// configuration and validate the result.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        config.http_port = self.port;
        if let Some(device) = self.device {
            config.radar.device = device;
        }
        if let Some(database) = self.database {
            config.persistence.database_url = database;
        }
        config.consolidator.camera_strict_mode = self.camera_strict;
        config.validate()?;
        Ok(config)
    }
}

pub struct SessionInner {
    pub config: Config,
    pub broker: Broker,
    pub health: HealthRegistry,
    pub started_at: DateTime<Utc>,
    weather_tx: mpsc::Sender<WeatherSnapshot>,
    weather_rx: Option<mpsc::Receiver<WeatherSnapshot>>,
}

/// Main application state container. Cloning shares the inner state;
/// components receive a clone and pull the handles they need.
#[derive(Clone)]
pub struct Session {
    pub inner: Arc<RwLock<SessionInner>>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let (weather_tx, weather_rx) = mpsc::channel(WEATHER_FEED_CAPACITY);
        Session {
            inner: Arc::new(RwLock::new(SessionInner {
                config,
                broker: Broker::new(),
                health: HealthRegistry::new(),
                started_at: Utc::now(),
                weather_tx,
                weather_rx: Some(weather_rx),
            })),
        }
    }

    pub fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, SessionInner>, PoisonError<RwLockReadGuard<'_, SessionInner>>>
    {
        self.inner.read()
    }

    pub fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, SessionInner>, PoisonError<RwLockWriteGuard<'_, SessionInner>>>
    {
        self.inner.write()
    }

    pub fn config(&self) -> Config {
        self.read().unwrap().config.clone()
    }

    pub fn broker(&self) -> Broker {
        self.read().unwrap().broker.clone()
    }

    pub fn health(&self) -> HealthRegistry {
        self.read().unwrap().health.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.read().unwrap().started_at
    }

    /// Injection point for the external weather readers (local GPIO
    /// sensor, airport METAR fetcher). They hold a sender; the weather
    /// cache service consumes the other end.
    pub fn weather_feed(&self) -> mpsc::Sender<WeatherSnapshot> {
        self.read().unwrap().weather_tx.clone()
    }

    /// Taken exactly once, by the weather cache service.
    pub(crate) fn take_weather_rx(&self) -> Option<mpsc::Receiver<WeatherSnapshot>> {
        self.write().unwrap().weather_rx.take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {{ }}")
    }
}
