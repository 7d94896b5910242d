//! Validated runtime configuration.
//!
//! Configuration *loading* is out of scope here: whoever embeds the server
//! (the CLI in `main.rs`, a test, a future supervisor daemon) builds a
//! [`Config`], calls [`Config::validate`] once, and hands it to
//! [`crate::Session::new`]. After startup the config is immutable.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use roadwatch_core::consolidation::ConsolidationConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid config field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level configuration. Serde defaults give the deployed roadside
/// profile; every duration-like field is a plain integer so the struct
/// stays trivially serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port for the REST + WebSocket gateway.
    pub http_port: u16,
    pub radar: RadarConfig,
    pub consolidator: ConsolidatorConfig,
    pub persistence: PersistenceConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_port: 8080,
            radar: RadarConfig::default(),
            consolidator: ConsolidatorConfig::default(),
            persistence: PersistenceConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Config {
    /// Validate once at startup. Any failure here is fatal: the process
    /// logs and exits non-zero rather than running misconfigured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.radar.validate()?;
        self.consolidator.validate()?;
        self.persistence.validate()?;
        self.broadcast.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadarConfig {
    /// Serial device path.
    pub device: String,
    pub baud_rate: u32,
    /// Stationary band for direction derivation, in mph.
    pub epsilon_mph: f64,
    /// Per-read timeout; repeated timeouts reopen the device.
    pub read_timeout_ms: u64,
    /// Consecutive timeouts tolerated before the device is reopened.
    pub timeouts_before_reopen: u32,
    /// Reconnect backoff bounds.
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Sustained failure beyond this marks the reader degraded.
    pub degraded_after_s: u64,
}

impl Default for RadarConfig {
    fn default() -> Self {
        RadarConfig {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: 19_200,
            epsilon_mph: 0.2,
            read_timeout_ms: 1_000,
            timeouts_before_reopen: 30,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 30_000,
            degraded_after_s: 60,
        }
    }
}

impl RadarConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(invalid("radar.device", "must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("radar.baud_rate", "must be positive"));
        }
        if !(self.epsilon_mph >= 0.0) {
            return Err(invalid("radar.epsilon_mph", "must be >= 0"));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(invalid(
                "radar.reconnect_max_ms",
                "backoff bounds must satisfy 0 < initial <= max",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidatorConfig {
    pub min_trigger_speed_mph: f64,
    pub window_pre_ms: u64,
    pub window_post_ms: u64,
    pub early_match_confidence: f64,
    pub camera_strict_mode: bool,
    pub dedup_window_ms: u64,
    pub weather_max_age_local_s: u64,
    pub weather_max_age_airport_s: u64,
    /// Events held in memory while the broker is unavailable.
    pub spill_capacity: usize,
    /// TTL on the per-event consolidation cache key.
    pub consolidation_cache_ttl_s: u64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        ConsolidatorConfig {
            min_trigger_speed_mph: 2.0,
            window_pre_ms: 500,
            window_post_ms: 2_000,
            early_match_confidence: 0.85,
            camera_strict_mode: false,
            dedup_window_ms: 800,
            weather_max_age_local_s: 120,
            weather_max_age_airport_s: 900,
            spill_capacity: 256,
            consolidation_cache_ttl_s: 3_600,
        }
    }
}

impl ConsolidatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_trigger_speed_mph > 0.0) {
            return Err(invalid(
                "consolidator.min_trigger_speed_mph",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.early_match_confidence) {
            return Err(invalid(
                "consolidator.early_match_confidence",
                "must be within [0, 1]",
            ));
        }
        if self.window_post_ms == 0 {
            return Err(invalid("consolidator.window_post_ms", "must be positive"));
        }
        if self.spill_capacity == 0 {
            return Err(invalid("consolidator.spill_capacity", "must be positive"));
        }
        Ok(())
    }

    /// Project into the engine's config.
    pub fn engine_config(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            min_trigger_speed_mph: self.min_trigger_speed_mph,
            window_pre: Duration::milliseconds(self.window_pre_ms as i64),
            window_post: Duration::milliseconds(self.window_post_ms as i64),
            early_match_confidence: self.early_match_confidence,
            camera_strict_mode: self.camera_strict_mode,
            dedup_window: Duration::milliseconds(self.dedup_window_ms as i64),
            camera_buffer_slack: Duration::seconds(1),
        }
    }

    pub fn weather_max_age_local(&self) -> Duration {
        Duration::seconds(self.weather_max_age_local_s as i64)
    }

    pub fn weather_max_age_airport(&self) -> Duration {
        Duration::seconds(self.weather_max_age_airport_s as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    /// SQLite database path or `sqlite:` URL.
    pub database_url: String,
    pub batch_max: usize,
    pub batch_max_age_ms: u64,
    /// Flush retry backoff bounds.
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub tx_timeout_s: u64,
    pub retention_days: i64,
    pub retention_scan_interval_s: u64,
    pub delete_batch: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            database_url: "sqlite://roadwatch.db".to_string(),
            batch_max: 100,
            batch_max_age_ms: 5_000,
            retry_initial_ms: 100,
            retry_max_ms: 10_000,
            tx_timeout_s: 10,
            retention_days: 90,
            retention_scan_interval_s: 3_600,
            delete_batch: 1_000,
        }
    }
}

impl PersistenceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(invalid("persistence.database_url", "must not be empty"));
        }
        if self.batch_max == 0 {
            return Err(invalid("persistence.batch_max", "must be positive"));
        }
        if self.retention_days <= 0 {
            return Err(invalid("persistence.retention_days", "must be positive"));
        }
        if self.delete_batch == 0 {
            return Err(invalid("persistence.delete_batch", "must be positive"));
        }
        if self.retry_initial_ms == 0 || self.retry_max_ms < self.retry_initial_ms {
            return Err(invalid(
                "persistence.retry_max_ms",
                "backoff bounds must satisfy 0 < initial <= max",
            ));
        }
        Ok(())
    }

    /// Buffered events beyond this are dropped oldest-first.
    pub fn buffer_cap(&self) -> usize {
        self.batch_max * 8
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BroadcastConfig {
    /// Queue depth at which a slow client starts losing its oldest
    /// undelivered messages.
    pub slow_client_threshold: usize,
    /// Cumulative drops at which a slow client is disconnected.
    pub slow_client_kick: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            slow_client_threshold: 64,
            slow_client_kick: 256,
        }
    }
}

impl BroadcastConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.slow_client_threshold == 0 {
            return Err(invalid(
                "broadcast.slow_client_threshold",
                "must be positive",
            ));
        }
        if self.slow_client_kick == 0 {
            return Err(invalid("broadcast.slow_client_kick", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_bad_confidence_rejected() {
        let mut config = Config::default();
        config.consolidator.early_match_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = Config::default();
        config.radar.reconnect_max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_projection() {
        let cfg = ConsolidatorConfig::default();
        let engine = cfg.engine_config();
        assert_eq!(engine.window_pre, Duration::milliseconds(500));
        assert_eq!(engine.window_post, Duration::milliseconds(2000));
        assert_eq!(engine.min_trigger_speed_mph, 2.0);
    }
}
