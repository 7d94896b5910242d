//! Core data model for the traffic event pipeline.
//!
//! These are the records that flow through the broker: raw radar samples,
//! camera classifications, weather snapshots and the consolidated event
//! that ties one radar trigger to everything the pipeline knew at that
//! moment. All timestamps are UTC wall time and serialize as RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::{timestamp::context::ContextV7, Timestamp, Uuid};

// =============================================================================
// Radar
// =============================================================================

/// Direction of travel, derived from the sign of the radar speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Approaching,
    Receding,
    Stationary,
    Unknown,
}

impl Direction {
    /// Derive a direction from a signed speed. `epsilon` is the stationary
    /// band in mph: anything within `[-epsilon, +epsilon]` reads as
    /// stationary.
    pub fn from_speed(speed_mph: f64, epsilon: f64) -> Self {
        if speed_mph > epsilon {
            Direction::Approaching
        } else if speed_mph < -epsilon {
            Direction::Receding
        } else {
            Direction::Stationary
        }
    }

    /// Sign of travel: +1 approaching, -1 receding, 0 otherwise.
    /// Two triggers merge in dedup only when their signs match.
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Approaching => 1,
            Direction::Receding => -1,
            Direction::Stationary | Direction::Unknown => 0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Approaching => write!(f, "approaching"),
            Direction::Receding => write!(f, "receding"),
            Direction::Stationary => write!(f, "stationary"),
            Direction::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approaching" => Ok(Direction::Approaching),
            "receding" => Ok(Direction::Receding),
            "stationary" => Ok(Direction::Stationary),
            "unknown" => Ok(Direction::Unknown),
            _ => Err(()),
        }
    }
}

/// Alert level reported by the radar firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    #[default]
    Normal,
    LowAlert,
    HighAlert,
}

impl AlertLevel {
    /// Parse the wire spelling used in UART frames.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(AlertLevel::Normal),
            "low_alert" => Some(AlertLevel::LowAlert),
            "high_alert" => Some(AlertLevel::HighAlert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::LowAlert => "low_alert",
            AlertLevel::HighAlert => "high_alert",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertLevel::from_wire(s).ok_or(())
    }
}

/// One radar observation as published on `radar_detections`.
///
/// The correlation id is minted by the radar reader and travels unchanged
/// through the whole pipeline into the consolidated event and the
/// persistence writer's log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadarSample {
    pub correlation_id: Uuid,
    pub observed_at: DateTime<Utc>,
    /// Signed by direction; alert-only frames carry 0.0.
    pub speed_mph: f64,
    /// Signal strength, when the radar reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    pub direction: Direction,
    pub alert_level: AlertLevel,
}

// =============================================================================
// Camera
// =============================================================================

/// One classification event produced by the external AI camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDetection {
    pub observed_at: DateTime<Utc>,
    /// Free-form string from the camera's closed label set ("car",
    /// "truck", ...). The pipeline does not interpret it.
    pub vehicle_type: String,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    /// Pixel bounding box `[x, y, w, h]`, when the camera reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[i64; 4]>,
    /// Opaque reference to the captured image, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

// =============================================================================
// Weather
// =============================================================================

/// Which feed a weather snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherSource {
    Local,
    Airport,
}

impl std::fmt::Display for WeatherSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeatherSource::Local => write!(f, "local"),
            WeatherSource::Airport => write!(f, "airport"),
        }
    }
}

/// Latest-known reading for one weather source. Internal units are SI:
/// degrees Celsius, meters per second, meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub source: WeatherSource,
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    /// Local sensor only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_mps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_m: Option<f64>,
    /// Airport METAR only ("clear", "rain", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
}

// =============================================================================
// Consolidated event
// =============================================================================

/// The unit of persistence and broadcast: one radar trigger joined with
/// the best camera detection in its correlation window and the freshest
/// weather snapshots.
///
/// Invariants: `radar` is never absent, `consolidated_at >= triggered_at`,
/// and `event_id` sort order matches `consolidated_at` order for events
/// minted by a single consolidator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedEvent {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub triggered_at: DateTime<Utc>,
    pub consolidated_at: DateTime<Utc>,
    pub radar: RadarSample,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_local: Option<WeatherSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_airport: Option<WeatherSnapshot>,
}

// =============================================================================
// Event id minting
// =============================================================================

/// Mints time-sortable UUIDv7 event ids.
///
/// The v7 context carries a counter so that two ids minted within the same
/// millisecond still compare in mint order. Scoped to one consolidator;
/// ordering across writers is not promised.
pub struct EventIdGenerator {
    ctx: ContextV7,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        EventIdGenerator {
            ctx: ContextV7::new(),
        }
    }

    /// Mint an id for an event consolidated at `at`.
    pub fn next(&self, at: DateTime<Utc>) -> Uuid {
        let ts = Timestamp::from_unix(
            &self.ctx,
            at.timestamp().max(0) as u64,
            at.timestamp_subsec_nanos(),
        );
        Uuid::new_v7(ts)
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_direction_from_speed() {
        assert_eq!(Direction::from_speed(22.5, 0.2), Direction::Approaching);
        assert_eq!(Direction::from_speed(-15.0, 0.2), Direction::Receding);
        assert_eq!(Direction::from_speed(0.1, 0.2), Direction::Stationary);
        assert_eq!(Direction::from_speed(-0.2, 0.2), Direction::Stationary);
        // Exactly epsilon is inside the stationary band
        assert_eq!(Direction::from_speed(0.2, 0.2), Direction::Stationary);
    }

    #[test]
    fn test_alert_level_wire_spellings() {
        assert_eq!(AlertLevel::from_wire("normal"), Some(AlertLevel::Normal));
        assert_eq!(AlertLevel::from_wire("low_alert"), Some(AlertLevel::LowAlert));
        assert_eq!(AlertLevel::from_wire("high_alert"), Some(AlertLevel::HighAlert));
        assert_eq!(AlertLevel::from_wire("panic"), None);
    }

    #[test]
    fn test_event_ids_sort_with_time() {
        let gen = EventIdGenerator::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::milliseconds(5);
        let a = gen.next(t0);
        let b = gen.next(t1);
        assert!(a < b);
    }

    #[test]
    fn test_event_ids_monotonic_within_same_instant() {
        let gen = EventIdGenerator::new();
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut prev = gen.next(t);
        for _ in 0..100 {
            let next = gen.next(t);
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = ConsolidatedEvent {
            event_id: Uuid::now_v7(),
            correlation_id: Uuid::now_v7(),
            triggered_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            consolidated_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 2).unwrap(),
            radar: RadarSample {
                correlation_id: Uuid::now_v7(),
                observed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
                speed_mph: 22.5,
                magnitude: Some(180.0),
                direction: Direction::Approaching,
                alert_level: AlertLevel::Normal,
            },
            camera: Some(CameraDetection {
                observed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap(),
                vehicle_type: "car".to_string(),
                confidence: 0.91,
                bbox: Some([10, 20, 110, 220]),
                image_ref: None,
            }),
            weather_local: None,
            weather_airport: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: ConsolidatedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
