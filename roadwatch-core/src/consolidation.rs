//! Consolidation state machine: one radar trigger in, one resolution out.
//!
//! This is a pure state machine with no I/O and no internal clock; the
//! service loop in `roadwatch-server` feeds it samples, detections and
//! explicit `now` values and publishes what falls out. That split keeps
//! the hardest logic in the pipeline testable to the millisecond.
//!
//! Per-trigger lifecycle:
//!
//! ```text
//!            radar trigger
//!                 │
//!                 ▼
//!              ┌──────┐  camera ≥ early_match_confidence,
//!              │ OPEN │  or deadline with any match
//!              └──┬───┘──────────────────────────┐
//!   deadline,     │                              ▼
//!   no match      │                         ┌─────────┐
//!                 ▼                         │ MATCHED │
//!            ┌─────────┐                    └────┬────┘
//!            │ EXPIRED │                         │ immediate
//!            └──┬───┬──┘                         ▼
//!        strict │   │ lenient               ┌──────────┐
//!               ▼   └──────────────────────▶│ RESOLVED │
//!          ┌─────────┐                      └──────────┘
//!          │ DROPPED │ (also: dedup merge)
//!          └─────────┘
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::model::{CameraDetection, Direction, RadarSample, WeatherSnapshot};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning knobs for the consolidation engine. The server builds this from
/// its validated config; defaults match the deployed roadside profile.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Triggers require `|speed| >= min_trigger_speed_mph`.
    pub min_trigger_speed_mph: f64,
    /// Correlation window opens this long before the trigger.
    pub window_pre: Duration,
    /// Correlation window closes this long after the trigger.
    pub window_post: Duration,
    /// A camera match at or above this confidence resolves the trigger
    /// before its deadline.
    pub early_match_confidence: f64,
    /// When set, triggers that expire without a camera match are dropped
    /// instead of emitted with `camera = null`.
    pub camera_strict_mode: bool,
    /// Same-direction triggers within this interval merge into one.
    pub dedup_window: Duration,
    /// Extra slack kept on the camera buffer beyond `window_pre`.
    pub camera_buffer_slack: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        ConsolidationConfig {
            min_trigger_speed_mph: 2.0,
            window_pre: Duration::milliseconds(500),
            window_post: Duration::milliseconds(2000),
            early_match_confidence: 0.85,
            camera_strict_mode: false,
            dedup_window: Duration::milliseconds(800),
            camera_buffer_slack: Duration::seconds(1),
        }
    }
}

// =============================================================================
// Trigger lifecycle
// =============================================================================

/// Lifecycle state of a pending trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Waiting for a camera match or the deadline.
    Open,
    /// A camera detection satisfied the window; resolves immediately.
    Matched,
    /// Deadline passed with no match.
    Expired,
    /// Terminal: strict-mode expiry or dedup merge.
    Dropped,
    /// Terminal: handed to the publisher.
    Resolved,
}

/// A trigger awaiting its camera window.
#[derive(Debug, Clone)]
pub struct PendingTrigger {
    /// Radar sample with the rolling max speed applied across dedup merges.
    pub radar: RadarSample,
    pub triggered_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: TriggerState,
}

/// What [`ConsolidationEngine::offer_radar`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarOutcome {
    /// Sub-threshold, stationary or alert-only; consumed silently.
    Ignored,
    /// A new pending trigger was opened.
    Opened,
    /// Merged into an earlier same-direction trigger (dedup).
    Merged,
}

/// A trigger that finished its window and is ready to publish.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub radar: RadarSample,
    pub triggered_at: DateTime<Utc>,
    pub camera: Option<CameraDetection>,
}

/// Counters exposed for health reporting and the pipeline's loss
/// accounting: every trigger either resolves or shows up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationCounters {
    pub triggers_opened: u64,
    pub events_resolved: u64,
    pub dropped_strict: u64,
    pub dropped_dedup: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// The consolidator's working state: pending triggers plus a time-ordered
/// sliding buffer of recent camera detections.
pub struct ConsolidationEngine {
    cfg: ConsolidationConfig,
    pending: Vec<PendingTrigger>,
    cameras: VecDeque<CameraDetection>,
    counters: ConsolidationCounters,
}

impl ConsolidationEngine {
    pub fn new(cfg: ConsolidationConfig) -> Self {
        ConsolidationEngine {
            cfg,
            pending: Vec::new(),
            cameras: VecDeque::new(),
            counters: ConsolidationCounters::default(),
        }
    }

    /// Feed one radar sample through the trigger policy.
    pub fn offer_radar(&mut self, sample: RadarSample) -> RadarOutcome {
        if !is_trigger(&sample, self.cfg.min_trigger_speed_mph) {
            return RadarOutcome::Ignored;
        }

        // Dedup: a same-direction trigger within the window absorbs this
        // one, keeping the first sample's correlation id and trigger time
        // but the maximum speed seen.
        let sign = sample.direction.sign();
        if let Some(existing) = self.pending.iter_mut().find(|p| {
            p.radar.direction.sign() == sign
                && (sample.observed_at - p.triggered_at).abs() <= self.cfg.dedup_window
        }) {
            if sample.speed_mph.abs() > existing.radar.speed_mph.abs() {
                existing.radar.speed_mph = sample.speed_mph;
            }
            self.counters.dropped_dedup += 1;
            return RadarOutcome::Merged;
        }

        let triggered_at = sample.observed_at;
        self.pending.push(PendingTrigger {
            radar: sample,
            triggered_at,
            deadline: triggered_at + self.cfg.window_post,
            state: TriggerState::Open,
        });
        self.counters.triggers_opened += 1;
        RadarOutcome::Opened
    }

    /// Buffer a camera detection. Arrival order does not matter; matching
    /// scans the whole buffer, so late detections still land inside any
    /// window that covers them.
    pub fn offer_camera(&mut self, det: CameraDetection) {
        self.cameras.push_back(det);
    }

    /// Evict camera detections that can no longer fall inside any current
    /// or future trigger's window.
    pub fn evict_cameras(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.cfg.window_pre - self.cfg.camera_buffer_slack;
        self.cameras.retain(|c| c.observed_at >= horizon);
    }

    /// The earliest pending deadline, for the service loop's sleep.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn counters(&self) -> ConsolidationCounters {
        self.counters
    }

    /// Resolve every trigger that is due: past its deadline, or holding an
    /// in-window camera match confident enough for early resolution.
    /// Returns resolutions in trigger-arrival order.
    pub fn resolve_due(&mut self, now: DateTime<Utc>) -> Vec<Resolution> {
        // Classify first: OPEN -> MATCHED on an early match or a deadline
        // with any in-window camera, OPEN -> EXPIRED on a bare deadline.
        for trigger in &mut self.pending {
            if trigger.state != TriggerState::Open {
                continue;
            }
            let best = best_camera(
                &self.cameras,
                trigger.triggered_at,
                self.cfg.window_pre,
                self.cfg.window_post,
            );
            let early = best
                .map(|c| c.confidence >= self.cfg.early_match_confidence)
                .unwrap_or(false);
            let due = now >= trigger.deadline;

            if early || (due && best.is_some()) {
                trigger.state = TriggerState::Matched;
            } else if due {
                trigger.state = TriggerState::Expired;
            }
        }

        // Then retire everything that left OPEN.
        let mut resolutions = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            match self.pending[index].state {
                TriggerState::Open => index += 1,
                TriggerState::Matched => {
                    let trigger = self.pending.remove(index);
                    let camera = best_camera(
                        &self.cameras,
                        trigger.triggered_at,
                        self.cfg.window_pre,
                        self.cfg.window_post,
                    )
                    .cloned();
                    self.counters.events_resolved += 1;
                    resolutions.push(Resolution {
                        radar: trigger.radar,
                        triggered_at: trigger.triggered_at,
                        camera,
                    });
                }
                TriggerState::Expired if self.cfg.camera_strict_mode => {
                    self.pending.remove(index);
                    self.counters.dropped_strict += 1;
                }
                TriggerState::Expired => {
                    let trigger = self.pending.remove(index);
                    self.counters.events_resolved += 1;
                    resolutions.push(Resolution {
                        radar: trigger.radar,
                        triggered_at: trigger.triggered_at,
                        camera: None,
                    });
                }
                // Terminal states never stay in the pending set.
                TriggerState::Dropped | TriggerState::Resolved => {
                    self.pending.remove(index);
                }
            }
        }

        resolutions
    }

    /// Force-expire everything still pending, honoring strict mode. Used
    /// by the service's shutdown drain once the grace period runs out.
    pub fn drain(&mut self) -> Vec<Resolution> {
        let far_future = DateTime::<Utc>::MAX_UTC;
        self.resolve_due(far_future)
    }
}

/// Best camera match for a trigger at `t_trig`: highest confidence inside
/// the closed window `[t_trig - pre, t_trig + post]`, ties broken by
/// proximity to the trigger.
fn best_camera<'a>(
    cameras: &'a VecDeque<CameraDetection>,
    t_trig: DateTime<Utc>,
    pre: Duration,
    post: Duration,
) -> Option<&'a CameraDetection> {
    let lo = t_trig - pre;
    let hi = t_trig + post;
    cameras
        .iter()
        .filter(|c| c.observed_at >= lo && c.observed_at <= hi)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let da = (a.observed_at - t_trig).abs();
                    let db = (b.observed_at - t_trig).abs();
                    db.cmp(&da) // smaller distance wins under max_by
                })
        })
}

// =============================================================================
// Weather attachment policy
// =============================================================================

/// Attach a weather snapshot only while it is fresh; stale or absent
/// snapshots attach as `None`.
pub fn fresh_weather(
    snapshot: Option<WeatherSnapshot>,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Option<WeatherSnapshot> {
    snapshot.filter(|s| now - s.observed_at <= max_age)
}

/// Trigger policy on its own, used by tests and the reader's debug logs.
pub fn is_trigger(sample: &RadarSample, min_trigger_speed_mph: f64) -> bool {
    sample.direction != Direction::Stationary
        && sample.direction != Direction::Unknown
        && sample.speed_mph.abs() >= min_trigger_speed_mph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertLevel, WeatherSource};
    use chrono::TimeZone;
    use uuid::Uuid;

    /// Test timeline origin; offsets below are in milliseconds.
    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn sample(ms: i64, speed_mph: f64) -> RadarSample {
        RadarSample {
            correlation_id: Uuid::now_v7(),
            observed_at: t(ms),
            speed_mph,
            magnitude: Some(180.0),
            direction: Direction::from_speed(speed_mph, 0.2),
            alert_level: AlertLevel::Normal,
        }
    }

    fn detection(ms: i64, vehicle_type: &str, confidence: f64) -> CameraDetection {
        CameraDetection {
            observed_at: t(ms),
            vehicle_type: vehicle_type.to_string(),
            confidence,
            bbox: Some([10, 20, 110, 220]),
            image_ref: None,
        }
    }

    fn new_engine() -> ConsolidationEngine {
        ConsolidationEngine::new(ConsolidationConfig::default())
    }

    // S1: confident camera inside the window resolves before the deadline.
    #[test]
    fn test_happy_path_early_match() {
        let mut engine = new_engine();
        let radar = sample(1000, 22.5);
        let correlation_id = radar.correlation_id;

        assert_eq!(engine.offer_radar(radar), RadarOutcome::Opened);
        assert!(engine.resolve_due(t(1100)).is_empty());

        engine.offer_camera(detection(1300, "car", 0.91));
        let resolutions = engine.resolve_due(t(1300));
        assert_eq!(resolutions.len(), 1);

        let r = &resolutions[0];
        assert_eq!(r.radar.correlation_id, correlation_id);
        assert_eq!(r.radar.speed_mph, 22.5);
        assert_eq!(r.radar.direction, Direction::Approaching);
        assert_eq!(r.triggered_at, t(1000));
        let camera = r.camera.as_ref().unwrap();
        assert_eq!(camera.vehicle_type, "car");
        assert_eq!(camera.confidence, 0.91);
        assert_eq!(engine.pending_len(), 0);
    }

    // S2: no camera and strict mode off emits camera = null at deadline.
    #[test]
    fn test_no_camera_lenient() {
        let mut engine = new_engine();
        engine.offer_radar(sample(2000, -15.0));

        assert!(engine.resolve_due(t(3999)).is_empty());
        let resolutions = engine.resolve_due(t(4000));
        assert_eq!(resolutions.len(), 1);
        assert!(resolutions[0].camera.is_none());
        assert_eq!(resolutions[0].radar.direction, Direction::Receding);
        assert_eq!(resolutions[0].triggered_at, t(2000));
    }

    // S3: same expiry under strict mode drops the trigger.
    #[test]
    fn test_no_camera_strict_drops() {
        let mut engine = ConsolidationEngine::new(ConsolidationConfig {
            camera_strict_mode: true,
            ..ConsolidationConfig::default()
        });
        engine.offer_radar(sample(2000, -15.0));

        let resolutions = engine.resolve_due(t(4000));
        assert!(resolutions.is_empty());
        assert_eq!(engine.counters().dropped_strict, 1);
        assert_eq!(engine.pending_len(), 0);
    }

    // S4: same-direction trigger inside the dedup window merges with a
    // rolling max speed under the first trigger's identity.
    #[test]
    fn test_dedup_merges_rolling_max() {
        let mut engine = new_engine();
        let first = sample(5000, 10.0);
        let correlation_id = first.correlation_id;

        assert_eq!(engine.offer_radar(first), RadarOutcome::Opened);
        assert_eq!(engine.offer_radar(sample(5300, 14.0)), RadarOutcome::Merged);
        assert_eq!(engine.counters().dropped_dedup, 1);
        assert_eq!(engine.pending_len(), 1);

        engine.offer_camera(detection(6000, "truck", 0.77));
        // 0.77 is below the early-match bar, so nothing resolves until the
        // first trigger's deadline at 7.0.
        assert!(engine.resolve_due(t(6500)).is_empty());

        let resolutions = engine.resolve_due(t(7000));
        assert_eq!(resolutions.len(), 1);
        let r = &resolutions[0];
        assert_eq!(r.radar.speed_mph, 14.0);
        assert_eq!(r.radar.correlation_id, correlation_id);
        assert_eq!(r.triggered_at, t(5000));
        assert_eq!(r.camera.as_ref().unwrap().vehicle_type, "truck");
    }

    #[test]
    fn test_opposite_directions_do_not_merge() {
        let mut engine = new_engine();
        assert_eq!(engine.offer_radar(sample(5000, 10.0)), RadarOutcome::Opened);
        assert_eq!(
            engine.offer_radar(sample(5300, -14.0)),
            RadarOutcome::Opened
        );
        assert_eq!(engine.pending_len(), 2);
        assert_eq!(engine.counters().dropped_dedup, 0);
    }

    #[test]
    fn test_sub_threshold_and_stationary_ignored() {
        let mut engine = new_engine();
        assert_eq!(engine.offer_radar(sample(100, 1.9)), RadarOutcome::Ignored);
        assert_eq!(engine.offer_radar(sample(200, 0.1)), RadarOutcome::Ignored);
        assert_eq!(engine.offer_radar(sample(300, -1.5)), RadarOutcome::Ignored);
        assert_eq!(engine.pending_len(), 0);
    }

    // Boundary: a sample at exactly the threshold is a trigger (>=).
    #[test]
    fn test_trigger_threshold_is_inclusive() {
        let mut engine = new_engine();
        assert_eq!(engine.offer_radar(sample(100, 2.0)), RadarOutcome::Opened);
        assert_eq!(engine.offer_radar(sample(5000, -2.0)), RadarOutcome::Opened);
    }

    // Boundary: the correlation window is closed at both ends.
    #[test]
    fn test_window_edges_are_inclusive() {
        let mut engine = new_engine();
        engine.offer_radar(sample(10_000, 20.0));
        // Exactly t_trig - W_pre.
        engine.offer_camera(detection(9_500, "car", 0.5));
        let resolutions = engine.resolve_due(t(12_000));
        assert!(resolutions[0].camera.is_some());

        let mut engine = new_engine();
        engine.offer_radar(sample(10_000, 20.0));
        // Exactly t_trig + W_post.
        engine.offer_camera(detection(12_000, "car", 0.5));
        let resolutions = engine.resolve_due(t(12_000));
        assert!(resolutions[0].camera.is_some());

        let mut engine = new_engine();
        engine.offer_radar(sample(10_000, 20.0));
        // One millisecond past the window.
        engine.offer_camera(detection(12_001, "car", 0.5));
        let resolutions = engine.resolve_due(t(12_001));
        assert!(resolutions[0].camera.is_none());
    }

    #[test]
    fn test_best_camera_prefers_confidence_then_proximity() {
        let mut engine = new_engine();
        engine.offer_radar(sample(1000, 20.0));
        engine.offer_camera(detection(1100, "car", 0.60));
        engine.offer_camera(detection(2500, "truck", 0.80));
        let resolutions = engine.resolve_due(t(3000));
        assert_eq!(resolutions[0].camera.as_ref().unwrap().vehicle_type, "truck");

        let mut engine = new_engine();
        engine.offer_radar(sample(1000, 20.0));
        // Equal confidence: the one closer to the trigger wins.
        engine.offer_camera(detection(2600, "van", 0.80));
        engine.offer_camera(detection(1200, "car", 0.80));
        let resolutions = engine.resolve_due(t(3000));
        assert_eq!(resolutions[0].camera.as_ref().unwrap().vehicle_type, "car");
    }

    #[test]
    fn test_camera_before_trigger_matches() {
        let mut engine = new_engine();
        // Detection lands first, trigger follows within W_pre.
        engine.offer_camera(detection(900, "car", 0.95));
        engine.offer_radar(sample(1000, 20.0));
        let resolutions = engine.resolve_due(t(1001));
        assert_eq!(resolutions.len(), 1);
        assert!(resolutions[0].camera.is_some());
    }

    #[test]
    fn test_camera_eviction_keeps_window_reachable() {
        let mut engine = new_engine();
        engine.offer_camera(detection(0, "car", 0.9));
        engine.offer_camera(detection(5000, "truck", 0.9));
        // Horizon at 6s: now - W_pre (0.5s) - slack (1s) = 4.5s.
        engine.evict_cameras(t(6000));
        assert_eq!(engine.cameras.len(), 1);
        assert_eq!(engine.cameras[0].vehicle_type, "truck");
    }

    #[test]
    fn test_next_deadline_tracks_earliest_pending() {
        let mut engine = new_engine();
        assert!(engine.next_deadline().is_none());
        engine.offer_radar(sample(4000, 12.0));
        engine.offer_radar(sample(1000, -12.0));
        assert_eq!(engine.next_deadline(), Some(t(3000)));
    }

    #[test]
    fn test_drain_flushes_pending() {
        let mut engine = new_engine();
        engine.offer_radar(sample(1000, 12.0));
        engine.offer_radar(sample(8000, -12.0));
        let resolutions = engine.drain();
        assert_eq!(resolutions.len(), 2);
        assert_eq!(engine.pending_len(), 0);
    }

    // S5: staleness policy attaches only fresh snapshots.
    #[test]
    fn test_weather_freshness() {
        let airport = WeatherSnapshot {
            source: WeatherSource::Airport,
            observed_at: t(0),
            temperature_c: 17.5,
            humidity_pct: None,
            wind_mps: Some(3.1),
            visibility_m: None,
            conditions: Some("clear".to_string()),
        };
        let max_age = Duration::minutes(15);

        // 20 minutes old: stale.
        assert!(fresh_weather(Some(airport.clone()), max_age, t(20 * 60 * 1000)).is_none());
        // 10 minutes old: fresh.
        assert!(fresh_weather(Some(airport.clone()), max_age, t(10 * 60 * 1000)).is_some());
        // Exactly at the cutoff: still fresh.
        assert!(fresh_weather(Some(airport), max_age, t(15 * 60 * 1000)).is_some());
        assert!(fresh_weather(None, max_age, t(0)).is_none());
    }

    // Pipeline accounting: every trigger resolves or is counted.
    #[test]
    fn test_no_trigger_loss() {
        let mut engine = ConsolidationEngine::new(ConsolidationConfig {
            camera_strict_mode: true,
            ..ConsolidationConfig::default()
        });
        engine.offer_radar(sample(1000, 10.0)); // resolves via camera
        engine.offer_radar(sample(1200, 12.0)); // dedup merged
        engine.offer_radar(sample(5000, -9.0)); // strict expiry

        engine.offer_camera(detection(1400, "car", 0.9));
        let resolved = engine.resolve_due(t(10_000));

        let c = engine.counters();
        assert_eq!(resolved.len() as u64, c.events_resolved);
        assert_eq!(
            c.triggers_opened + c.dropped_dedup,
            3,
            "every offered trigger is accounted for"
        );
        assert_eq!(c.events_resolved + c.dropped_strict, c.triggers_opened);
    }
}
