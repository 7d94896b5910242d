//! Consolidator service: the loop around the core consolidation engine.
//!
//! Single instance, single-threaded. Drains the radar and camera topics
//! into the engine, sleeps until the earliest pending deadline, and on
//! every resolution attaches fresh weather, mints a time-sortable event
//! id and publishes the consolidated event three ways: onto the bounded
//! stream, the `traffic_events` topic and its per-event cache key.
//!
//! A failed topic publish is retried once after 100 ms and then spilled
//! to a bounded in-memory buffer that flushes in order as soon as
//! publishing recovers.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_graceful_shutdown::SubsystemHandle;

use roadwatch_core::consolidation::{
    fresh_weather, ConsolidationEngine, RadarOutcome, Resolution,
};
use roadwatch_core::contract::{self, cache_key, stream, topic, WireRecord};
use roadwatch_core::model::{ConsolidatedEvent, EventIdGenerator, WeatherSnapshot};

use crate::broker::{Broker, BrokerError};
use crate::config::ConsolidatorConfig;
use crate::health::{component, HealthRegistry, HealthState};
use crate::Session;

/// Idle sleep when nothing is pending.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);
/// Pause before the single publish retry.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Shutdown drain budget.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct Consolidator {
    broker: Broker,
    health: HealthRegistry,
    cfg: ConsolidatorConfig,
    engine: ConsolidationEngine,
    ids: EventIdGenerator,
    /// Events the broker refused, waiting for it to recover.
    spill: VecDeque<Value>,
    spill_dropped: u64,
}

impl Consolidator {
    pub fn new(session: &Session) -> Self {
        let cfg = session.config().consolidator;
        Consolidator {
            broker: session.broker(),
            health: session.health(),
            engine: ConsolidationEngine::new(cfg.engine_config()),
            cfg,
            ids: EventIdGenerator::new(),
            spill: VecDeque::new(),
            spill_dropped: 0,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), BrokerError> {
        let mut radar_rx = self.broker.subscribe(topic::RADAR_DETECTIONS);
        let mut camera_rx = self.broker.subscribe(topic::CAMERA_DETECTIONS);
        log::info!(
            "consolidator: starting (window -{}ms/+{}ms, trigger >= {} mph, strict={})",
            self.cfg.window_pre_ms,
            self.cfg.window_post_ms,
            self.cfg.min_trigger_speed_mph,
            self.cfg.camera_strict_mode
        );
        self.health
            .set(component::CONSOLIDATOR, HealthState::Healthy);

        loop {
            let now = Utc::now();
            self.engine.evict_cameras(now);
            for resolution in self.engine.resolve_due(now) {
                self.emit(resolution).await;
            }
            self.flush_spill();

            let sleep_for = match self.engine.next_deadline() {
                Some(deadline) => (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                None => IDLE_SLEEP,
            };

            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    self.drain().await;
                    return Ok(());
                }
                record = radar_rx.recv() => match record {
                    Ok(value) => self.on_radar(value),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("consolidator: lost {} radar records to lag", n);
                    }
                    Err(RecvError::Closed) => {
                        log::error!("consolidator: radar topic closed");
                        return Ok(());
                    }
                },
                record = camera_rx.recv() => match record {
                    Ok(value) => self.on_camera(value),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("consolidator: lost {} camera records to lag", n);
                    }
                    Err(RecvError::Closed) => {
                        log::error!("consolidator: camera topic closed");
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    fn on_radar(&mut self, value: Value) {
        match contract::decode(&value) {
            Ok(Some(WireRecord::RadarSample(sample))) => {
                let correlation_id = sample.correlation_id;
                match self.engine.offer_radar(sample) {
                    RadarOutcome::Opened => {
                        log::debug!("{}: trigger opened", correlation_id)
                    }
                    RadarOutcome::Merged => {
                        log::debug!("{}: merged into earlier trigger", correlation_id)
                    }
                    RadarOutcome::Ignored => {}
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                let schema = value.get("schema").and_then(Value::as_str).unwrap_or("?");
                self.broker
                    .count_unknown_schema(topic::RADAR_DETECTIONS, schema);
            }
            Err(e) => log::debug!("consolidator: dropped malformed radar record: {}", e),
        }
    }

    fn on_camera(&mut self, value: Value) {
        match contract::decode(&value) {
            Ok(Some(WireRecord::CameraDetection(det))) => {
                log::trace!(
                    "consolidator: camera {} conf={:.2} at {}",
                    det.vehicle_type,
                    det.confidence,
                    det.observed_at
                );
                self.engine.offer_camera(det);
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                let schema = value.get("schema").and_then(Value::as_str).unwrap_or("?");
                self.broker
                    .count_unknown_schema(topic::CAMERA_DETECTIONS, schema);
            }
            Err(e) => log::debug!("consolidator: dropped malformed camera record: {}", e),
        }
    }

    /// Turn a resolution into a consolidated event and publish it.
    async fn emit(&mut self, resolution: Resolution) {
        let now = Utc::now();
        let Resolution {
            radar,
            triggered_at,
            camera,
        } = resolution;

        let event = ConsolidatedEvent {
            event_id: self.ids.next(now),
            correlation_id: radar.correlation_id,
            triggered_at,
            consolidated_at: now,
            weather_local: self.cached_weather(
                cache_key::WEATHER_LOCAL_LATEST,
                self.cfg.weather_max_age_local(),
            ),
            weather_airport: self.cached_weather(
                cache_key::WEATHER_AIRPORT_LATEST,
                self.cfg.weather_max_age_airport(),
            ),
            radar,
            camera,
        };

        log::info!(
            "{}: event {} speed={} mph {} camera={}",
            event.correlation_id,
            event.event_id,
            event.radar.speed_mph,
            event.radar.direction,
            event
                .camera
                .as_ref()
                .map(|c| c.vehicle_type.as_str())
                .unwrap_or("none"),
        );

        let value = match contract::encode_consolidated_event(&event) {
            Ok(value) => value,
            Err(e) => {
                log::error!("{}: cannot encode event: {}", event.correlation_id, e);
                return;
            }
        };

        if let Err(e) = self
            .broker
            .stream_append(stream::CONSOLIDATED_TRAFFIC_DATA, value.clone())
        {
            log::error!("{}: stream append failed: {}", event.correlation_id, e);
        }
        self.broker.cache_set(
            &cache_key::consolidation(&event.event_id),
            value.clone(),
            Some(chrono::Duration::seconds(
                self.cfg.consolidation_cache_ttl_s as i64,
            )),
        );

        if self.try_publish(value.clone()) {
            self.flush_spill();
            return;
        }
        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
        if !self.try_publish(value.clone()) {
            self.push_spill(value);
        }
    }

    fn try_publish(&self, value: Value) -> bool {
        match self.broker.publish(topic::TRAFFIC_EVENTS, value) {
            Ok(_) => true,
            Err(_) => {
                self.broker.count_publish_failure(topic::TRAFFIC_EVENTS);
                false
            }
        }
    }

    /// Hold an unpublishable event, dropping the oldest held event once
    /// the spill buffer is full.
    fn push_spill(&mut self, value: Value) {
        while self.spill.len() >= self.cfg.spill_capacity {
            self.spill.pop_front();
            self.spill_dropped += 1;
            log::warn!(
                "consolidator: spill buffer full, dropped oldest ({} total)",
                self.spill_dropped
            );
        }
        self.spill.push_back(value);
        self.health
            .set(component::CONSOLIDATOR, HealthState::Degraded);
    }

    /// Re-publish spilled events in order until one fails again.
    fn flush_spill(&mut self) {
        while let Some(value) = self.spill.front() {
            if self.try_publish(value.clone()) {
                self.spill.pop_front();
            } else {
                return;
            }
        }
        if self.spill.is_empty() {
            self.health
                .set(component::CONSOLIDATOR, HealthState::Healthy);
        }
    }

    fn cached_weather(
        &self,
        key: &str,
        max_age: chrono::Duration,
    ) -> Option<WeatherSnapshot> {
        let value = self.broker.cache_get(key)?;
        match contract::decode(&value) {
            Ok(Some(WireRecord::WeatherSnapshot(snapshot))) => {
                fresh_weather(Some(snapshot), max_age, Utc::now())
            }
            Ok(_) => None,
            Err(e) => {
                log::debug!("consolidator: malformed snapshot under '{}': {}", key, e);
                None
            }
        }
    }

    /// Shutdown drain: no new inputs are accepted; pending triggers are
    /// allowed to reach their real deadlines within the drain budget,
    /// then whatever is left is force-expired.
    async fn drain(&mut self) {
        let drain_until = tokio::time::Instant::now() + DRAIN_DEADLINE;
        loop {
            let now = Utc::now();
            for resolution in self.engine.resolve_due(now) {
                self.emit(resolution).await;
            }
            let Some(deadline) = self.engine.next_deadline() else {
                break;
            };
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if tokio::time::Instant::now() + wait >= drain_until {
                for resolution in self.engine.drain() {
                    self.emit(resolution).await;
                }
                break;
            }
            tokio::time::sleep(wait).await;
        }
        self.flush_spill();
        let counters = self.engine.counters();
        log::info!(
            "consolidator: shutdown ({} resolved, {} dedup-merged, {} strict-dropped)",
            counters.events_resolved,
            counters.dropped_dedup,
            counters.dropped_strict
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::{Duration as ChronoDuration, Utc};
    use roadwatch_core::model::{
        AlertLevel, CameraDetection, Direction, RadarSample, WeatherSource,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn consolidator() -> Consolidator {
        Consolidator::new(&Session::new(Config::default()))
    }

    fn radar_value(speed_mph: f64) -> Value {
        let sample = RadarSample {
            correlation_id: Uuid::now_v7(),
            observed_at: Utc::now(),
            speed_mph,
            magnitude: None,
            direction: Direction::from_speed(speed_mph, 0.2),
            alert_level: AlertLevel::Normal,
        };
        contract::encode_radar_sample(&sample).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_to_event_with_camera() {
        let mut c = consolidator();
        let mut events_rx = c.broker.subscribe(topic::TRAFFIC_EVENTS);

        c.on_radar(radar_value(22.5));
        c.on_camera(
            contract::encode_camera_detection(&CameraDetection {
                observed_at: Utc::now(),
                vehicle_type: "car".to_string(),
                confidence: 0.91,
                bbox: None,
                image_ref: None,
            })
            .unwrap(),
        );

        // Confident in-window camera: due immediately.
        for resolution in c.engine.resolve_due(Utc::now()) {
            c.emit(resolution).await;
        }

        let value = events_rx.recv().await.unwrap();
        let event = match contract::decode(&value).unwrap() {
            Some(WireRecord::ConsolidatedEvent(event)) => event,
            other => panic!("Expected consolidated event, got {:?}", other),
        };
        assert_eq!(event.radar.speed_mph, 22.5);
        assert_eq!(event.camera.as_ref().unwrap().vehicle_type, "car");
        assert!(event.consolidated_at >= event.triggered_at);

        // Triple publication: stream and cache key carry the same record.
        assert!(c
            .broker
            .stream_latest(stream::CONSOLIDATED_TRAFFIC_DATA)
            .is_some());
        assert!(c
            .broker
            .cache_get(&cache_key::consolidation(&event.event_id))
            .is_some());
    }

    #[tokio::test]
    async fn test_weather_attachment_respects_freshness() {
        let mut c = consolidator();

        // Fresh local, stale airport.
        let fresh = roadwatch_core::model::WeatherSnapshot {
            source: WeatherSource::Local,
            observed_at: Utc::now() - ChronoDuration::seconds(30),
            temperature_c: 18.0,
            humidity_pct: Some(55.0),
            wind_mps: None,
            visibility_m: None,
            conditions: None,
        };
        let stale = roadwatch_core::model::WeatherSnapshot {
            source: WeatherSource::Airport,
            observed_at: Utc::now() - ChronoDuration::minutes(20),
            temperature_c: 17.5,
            humidity_pct: None,
            wind_mps: Some(3.1),
            visibility_m: None,
            conditions: Some("clear".to_string()),
        };
        c.broker.cache_set(
            cache_key::WEATHER_LOCAL_LATEST,
            contract::encode_weather_snapshot(&fresh).unwrap(),
            None,
        );
        c.broker.cache_set(
            cache_key::WEATHER_AIRPORT_LATEST,
            contract::encode_weather_snapshot(&stale).unwrap(),
            None,
        );

        let mut events_rx = c.broker.subscribe(topic::TRAFFIC_EVENTS);
        c.on_radar(radar_value(-15.0));
        for resolution in c.engine.drain() {
            c.emit(resolution).await;
        }

        let value = events_rx.recv().await.unwrap();
        let event = match contract::decode(&value).unwrap() {
            Some(WireRecord::ConsolidatedEvent(event)) => event,
            other => panic!("Expected consolidated event, got {:?}", other),
        };
        assert!(event.weather_local.is_some());
        assert!(event.weather_airport.is_none(), "stale snapshot must not attach");
    }

    #[tokio::test]
    async fn test_event_ids_monotonic_across_emits() {
        let mut c = consolidator();
        let mut events_rx = c.broker.subscribe(topic::TRAFFIC_EVENTS);

        for speed in [10.0, -12.0] {
            c.on_radar(radar_value(speed));
        }
        for resolution in c.engine.drain() {
            c.emit(resolution).await;
        }

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        let (a, b) = match (
            contract::decode(&first).unwrap(),
            contract::decode(&second).unwrap(),
        ) {
            (
                Some(WireRecord::ConsolidatedEvent(a)),
                Some(WireRecord::ConsolidatedEvent(b)),
            ) => (a, b),
            other => panic!("Expected two events, got {:?}", other),
        };
        assert!(a.event_id < b.event_id);
        assert!(a.consolidated_at <= b.consolidated_at);
    }

    #[tokio::test]
    async fn test_unknown_schema_counted() {
        let mut c = consolidator();
        c.on_radar(json!({"schema": "lidar.sweep.v3", "v": 1}));
        assert_eq!(c.broker.counters().unknown_schema_dropped, 1);
        assert_eq!(c.engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_spill_buffer_drops_oldest() {
        let mut c = consolidator();
        c.cfg.spill_capacity = 4;
        for i in 0..6 {
            c.push_spill(json!({"schema": "event.consolidated.v1", "v": 1, "i": i}));
        }
        assert_eq!(c.spill.len(), 4);
        assert_eq!(c.spill_dropped, 2);
        assert_eq!(c.spill.front().unwrap()["i"], 2);

        // Publishing works in-process, so a flush empties the buffer in
        // order and restores health.
        c.flush_spill();
        assert!(c.spill.is_empty());
    }
}
