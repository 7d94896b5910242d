//! Broker contract: the fixed names and wire shapes every component
//! agrees on.
//!
//! All inter-component coupling goes through the broker, so this module is
//! the only thing two components ever share. Records on the wire are JSON
//! objects carrying a `schema` tag and an integer `v`; consumers ignore
//! unknown extra fields and drop unknown schemas with a counter, never an
//! error back to the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ContractError;
use crate::model::{CameraDetection, ConsolidatedEvent, RadarSample, WeatherSnapshot};

/// Wire format version carried in every envelope.
pub const WIRE_VERSION: u32 = 1;

pub const SCHEMA_RADAR_SAMPLE: &str = "radar.sample.v1";
pub const SCHEMA_CAMERA_DETECTION: &str = "camera.detection.v1";
pub const SCHEMA_WEATHER_SNAPSHOT: &str = "weather.snapshot.v1";
pub const SCHEMA_CONSOLIDATED_EVENT: &str = "event.consolidated.v1";
pub const SCHEMA_DATABASE_NOTICE: &str = "database.notice.v1";

/// Pub/sub topics (non-durable, best-effort, multi-subscriber).
pub mod topic {
    /// Consolidated events, the pipeline's output.
    pub const TRAFFIC_EVENTS: &str = "traffic_events";
    /// Raw radar samples from the serial reader.
    pub const RADAR_DETECTIONS: &str = "radar_detections";
    /// Classifications published by the external AI camera.
    pub const CAMERA_DETECTIONS: &str = "camera_detections";
    /// Persistence writer notices (batch flushes, retention passes).
    pub const DATABASE_EVENTS: &str = "database_events";
    /// Emitted whenever a weather cache key is written.
    pub const WEATHER_UPDATES: &str = "weather_updates";

    pub const ALL: &[&str] = &[
        TRAFFIC_EVENTS,
        RADAR_DETECTIONS,
        CAMERA_DETECTIONS,
        DATABASE_EVENTS,
        WEATHER_UPDATES,
    ];
}

/// Append-only bounded streams with per-consumer-group cursors.
pub mod stream {
    pub const RADAR_DATA: &str = "radar_data";
    pub const RADAR_DATA_MAXLEN: usize = 1000;

    pub const CONSOLIDATED_TRAFFIC_DATA: &str = "consolidated_traffic_data";
    pub const CONSOLIDATED_TRAFFIC_DATA_MAXLEN: usize = 100;
}

/// Last-writer-wins cache keys.
pub mod cache_key {
    use uuid::Uuid;

    pub const WEATHER_LOCAL_LATEST: &str = "weather:local:latest";
    pub const WEATHER_AIRPORT_LATEST: &str = "weather:airport:latest";

    /// Per-event consolidation key, kept for the consolidator's retention
    /// window (one hour).
    pub fn consolidation(event_id: &Uuid) -> String {
        format!("consolidation:{}", event_id)
    }
}

/// Notice published on `database_events` by the persistence writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseNotice {
    pub kind: DatabaseNoticeKind,
    /// Rows written or deleted.
    pub count: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseNoticeKind {
    BatchFlushed,
    RetentionPass,
}

/// A decoded broker record.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRecord {
    RadarSample(RadarSample),
    CameraDetection(CameraDetection),
    WeatherSnapshot(WeatherSnapshot),
    ConsolidatedEvent(ConsolidatedEvent),
    DatabaseNotice(DatabaseNotice),
}

fn envelope<T: Serialize>(schema: &str, record: &T) -> Result<Value, ContractError> {
    let mut value = serde_json::to_value(record).map_err(|source| ContractError::Malformed {
        schema: schema.to_string(),
        source,
    })?;
    let obj = value.as_object_mut().ok_or(ContractError::NotAnObject)?;
    obj.insert("schema".to_string(), Value::String(schema.to_string()));
    obj.insert("v".to_string(), Value::from(WIRE_VERSION));
    Ok(value)
}

pub fn encode_radar_sample(sample: &RadarSample) -> Result<Value, ContractError> {
    envelope(SCHEMA_RADAR_SAMPLE, sample)
}

pub fn encode_camera_detection(det: &CameraDetection) -> Result<Value, ContractError> {
    envelope(SCHEMA_CAMERA_DETECTION, det)
}

pub fn encode_weather_snapshot(snap: &WeatherSnapshot) -> Result<Value, ContractError> {
    envelope(SCHEMA_WEATHER_SNAPSHOT, snap)
}

pub fn encode_consolidated_event(event: &ConsolidatedEvent) -> Result<Value, ContractError> {
    envelope(SCHEMA_CONSOLIDATED_EVENT, event)
}

pub fn encode_database_notice(notice: &DatabaseNotice) -> Result<Value, ContractError> {
    envelope(SCHEMA_DATABASE_NOTICE, notice)
}

fn payload<T: for<'de> Deserialize<'de>>(schema: &str, value: &Value) -> Result<T, ContractError> {
    serde_json::from_value(value.clone()).map_err(|source| ContractError::Malformed {
        schema: schema.to_string(),
        source,
    })
}

/// Decode a broker record.
///
/// Returns `Ok(None)` for an unknown schema: the caller drops the record
/// and bumps its counter. A missing `schema`/`v` tag or a payload that does
/// not match its claimed schema is a [`ContractError`].
pub fn decode(value: &Value) -> Result<Option<WireRecord>, ContractError> {
    let schema = value
        .get("schema")
        .and_then(Value::as_str)
        .ok_or(ContractError::MissingField("schema"))?;
    if value.get("v").and_then(Value::as_u64).is_none() {
        return Err(ContractError::MissingField("v"));
    }

    let record = match schema {
        SCHEMA_RADAR_SAMPLE => WireRecord::RadarSample(payload(schema, value)?),
        SCHEMA_CAMERA_DETECTION => WireRecord::CameraDetection(payload(schema, value)?),
        SCHEMA_WEATHER_SNAPSHOT => WireRecord::WeatherSnapshot(payload(schema, value)?),
        SCHEMA_CONSOLIDATED_EVENT => WireRecord::ConsolidatedEvent(payload(schema, value)?),
        SCHEMA_DATABASE_NOTICE => WireRecord::DatabaseNotice(payload(schema, value)?),
        _ => return Ok(None),
    };
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertLevel, Direction, WeatherSource};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn sample() -> RadarSample {
        RadarSample {
            correlation_id: Uuid::now_v7(),
            observed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            speed_mph: -15.0,
            magnitude: None,
            direction: Direction::Receding,
            alert_level: AlertLevel::Normal,
        }
    }

    #[test]
    fn test_radar_envelope_round_trip() {
        let sample = sample();
        let value = encode_radar_sample(&sample).unwrap();
        assert_eq!(value["schema"], SCHEMA_RADAR_SAMPLE);
        assert_eq!(value["v"], WIRE_VERSION);

        match decode(&value).unwrap() {
            Some(WireRecord::RadarSample(back)) => assert_eq!(back, sample),
            other => panic!("Expected radar sample, got {:?}", other),
        }
    }

    #[test]
    fn test_weather_envelope_round_trip() {
        let snap = WeatherSnapshot {
            source: WeatherSource::Airport,
            observed_at: Utc.with_ymd_and_hms(2025, 6, 1, 11, 50, 0).unwrap(),
            temperature_c: 17.5,
            humidity_pct: None,
            wind_mps: Some(3.1),
            visibility_m: Some(10_000.0),
            conditions: Some("clear".to_string()),
        };
        let value = encode_weather_snapshot(&snap).unwrap();
        match decode(&value).unwrap() {
            Some(WireRecord::WeatherSnapshot(back)) => assert_eq!(back, snap),
            other => panic!("Expected weather snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_schema_is_dropped_not_an_error() {
        let value = serde_json::json!({"schema": "lidar.sweep.v3", "v": 1, "points": []});
        assert!(decode(&value).unwrap().is_none());
    }

    #[test]
    fn test_missing_schema_tag_is_an_error() {
        let value = serde_json::json!({"v": 1, "speed_mph": 12.0});
        assert!(decode(&value).is_err());
    }

    #[test]
    fn test_unknown_extra_fields_are_ignored() {
        let mut value = encode_radar_sample(&sample()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("firmware_rev".to_string(), Value::from("2.4.1"));
        assert!(matches!(
            decode(&value).unwrap(),
            Some(WireRecord::RadarSample(_))
        ));
    }

    #[test]
    fn test_consolidation_cache_key() {
        let id = Uuid::nil();
        assert_eq!(
            cache_key::consolidation(&id),
            "consolidation:00000000-0000-0000-0000-000000000000"
        );
    }
}
