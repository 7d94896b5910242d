//! # Roadwatch Core
//!
//! Platform-independent fusion logic for the Roadwatch traffic monitor.
//!
//! This crate contains the data model, wire contract and consolidation
//! state machine with **zero I/O dependencies**. Everything that touches a
//! serial port, a socket or a database lives in `roadwatch-server`; this
//! crate is pure logic driven by explicit clocks, which is what makes the
//! consolidation pipeline unit-testable down to the millisecond.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  roadwatch-core (platform-independent, no tokio/async deps)  │
//! │  ├── model/         (radar, camera, weather, event records)  │
//! │  ├── contract/      (broker names + schema-tagged envelopes) │
//! │  ├── frame/         (UART line framing and parsing)          │
//! │  ├── consolidation/ (trigger state machine)                  │
//! │  └── stats/         (speed statistics for the gateway)       │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  roadwatch-server       │
//!                 │  (tokio, axum, sqlx)    │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`model`] - Sensor samples and the consolidated traffic event
//! - [`contract`] - Broker topic/stream/cache names and JSON envelopes
//! - [`frame`] - Radar UART frame accumulator and parser
//! - [`consolidation`] - Trigger lifecycle: correlation window, dedup,
//!   early match, strict/lenient expiry
//! - [`stats`] - count/avg/p95/by-type summaries and the ISO-8601
//!   duration parser used by the stats endpoint
//!
//! ## Example: Parsing a Radar Frame
//!
//! ```rust
//! use roadwatch_core::frame;
//!
//! let raw = frame::parse_frame("speed=+22.5,mag=180").unwrap();
//! assert_eq!(raw.speed_mph, Some(22.5));
//! assert_eq!(raw.magnitude, Some(180.0));
//! ```
//!
//! ## Example: Driving the Consolidation Engine
//!
//! ```rust,no_run
//! use roadwatch_core::consolidation::{ConsolidationConfig, ConsolidationEngine};
//! use chrono::Utc;
//!
//! let mut engine = ConsolidationEngine::new(ConsolidationConfig::default());
//! // feed samples / detections, then:
//! let now = Utc::now();
//! for resolution in engine.resolve_due(now) {
//!     // attach weather, mint an event id, publish
//! }
//! ```

pub mod consolidation;
pub mod contract;
pub mod error;
pub mod frame;
pub mod model;
pub mod stats;

// Re-export commonly used types
pub use consolidation::{ConsolidationConfig, ConsolidationEngine, RadarOutcome, TriggerState};
pub use contract::WireRecord;
pub use error::{ContractError, ParseError};
pub use model::{
    AlertLevel, CameraDetection, ConsolidatedEvent, Direction, EventIdGenerator, RadarSample,
    WeatherSnapshot, WeatherSource,
};
