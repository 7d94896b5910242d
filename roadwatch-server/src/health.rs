//! Component health registry.
//!
//! Every long-running service self-reports its state here; the gateway's
//! `/api/health` reads the registry, and the events endpoints refuse with
//! 503 while the persistence writer is unhealthy. Cross-component failures
//! are never signalled directly; they show up as staleness on the broker
//! and state changes in this registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Self-reported state of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Component names as reported on `/api/health`.
pub mod component {
    pub const RADAR_READER: &str = "radar_reader";
    pub const WEATHER_CACHE: &str = "weather_cache";
    pub const CONSOLIDATOR: &str = "consolidator";
    pub const PERSISTENCE_WRITER: &str = "persistence_writer";
    pub const BROADCASTER: &str = "broadcaster";
    pub const GATEWAY: &str = "gateway";
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub since: DateTime<Utc>,
}

/// Shared registry handle. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<&'static str, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy. Called once by the supervisor
    /// before the component starts.
    pub fn register(&self, name: &'static str) {
        self.set(name, HealthState::Healthy);
    }

    /// Record a state change; transitions are logged, refreshes are not.
    pub fn set(&self, name: &'static str, state: HealthState) {
        let mut map = self.inner.write().unwrap();
        match map.get(name) {
            Some(current) if current.state == state => {}
            Some(current) => {
                log::info!(
                    "{}: health {} -> {}",
                    name,
                    current.state,
                    state
                );
                map.insert(
                    name,
                    ComponentHealth {
                        state,
                        since: Utc::now(),
                    },
                );
            }
            None => {
                map.insert(
                    name,
                    ComponentHealth {
                        state,
                        since: Utc::now(),
                    },
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<ComponentHealth> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn snapshot(&self) -> HashMap<&'static str, ComponentHealth> {
        self.inner.read().unwrap().clone()
    }

    pub fn any_unhealthy(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .values()
            .any(|c| c.state == HealthState::Unhealthy)
    }

    pub fn is_unhealthy(&self, name: &str) -> bool {
        matches!(
            self.get(name),
            Some(ComponentHealth {
                state: HealthState::Unhealthy,
                ..
            })
        )
    }

    /// Aggregate for the top-level `status` field: the worst state of any
    /// registered component.
    pub fn overall(&self) -> HealthState {
        let map = self.inner.read().unwrap();
        let mut overall = HealthState::Healthy;
        for c in map.values() {
            overall = match (overall, c.state) {
                (_, HealthState::Unhealthy) | (HealthState::Unhealthy, _) => HealthState::Unhealthy,
                (_, HealthState::Degraded) | (HealthState::Degraded, _) => HealthState::Degraded,
                _ => HealthState::Healthy,
            };
        }
        overall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_takes_the_worst() {
        let registry = HealthRegistry::new();
        registry.register(component::RADAR_READER);
        registry.register(component::CONSOLIDATOR);
        assert_eq!(registry.overall(), HealthState::Healthy);

        registry.set(component::RADAR_READER, HealthState::Degraded);
        assert_eq!(registry.overall(), HealthState::Degraded);

        registry.set(component::CONSOLIDATOR, HealthState::Unhealthy);
        assert_eq!(registry.overall(), HealthState::Unhealthy);
        assert!(registry.any_unhealthy());
    }

    #[test]
    fn test_refresh_keeps_since() {
        let registry = HealthRegistry::new();
        registry.register(component::BROADCASTER);
        let first = registry.get(component::BROADCASTER).unwrap().since;
        registry.set(component::BROADCASTER, HealthState::Healthy);
        assert_eq!(registry.get(component::BROADCASTER).unwrap().since, first);
    }
}
