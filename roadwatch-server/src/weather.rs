//! Weather cache service.
//!
//! The external readers (local GPIO sensor, airport METAR fetcher) hand
//! snapshots in through the session's injection channel; this service
//! writes the fixed cache keys and announces every write on
//! `weather_updates`. The rest of the pipeline only ever reads the keys,
//! and the consolidator alone decides staleness.

use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use roadwatch_core::contract::{self, cache_key, topic};
use roadwatch_core::model::{WeatherSnapshot, WeatherSource};

use crate::broker::{Broker, BrokerError};
use crate::health::{component, HealthRegistry, HealthState};
use crate::Session;

pub struct WeatherService {
    broker: Broker,
    health: HealthRegistry,
    rx: mpsc::Receiver<WeatherSnapshot>,
}

impl WeatherService {
    /// Takes the session's snapshot receiver; constructing a second
    /// service is a wiring bug and panics early.
    pub fn new(session: &Session) -> Self {
        WeatherService {
            broker: session.broker(),
            health: session.health(),
            rx: session
                .take_weather_rx()
                .expect("weather service constructed twice"),
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), BrokerError> {
        log::info!("weather: cache service starting");
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    log::info!("weather: shutdown");
                    return Ok(());
                }
                snapshot = self.rx.recv() => match snapshot {
                    Some(snapshot) => self.apply(snapshot),
                    None => {
                        // All feed handles dropped; nothing left to cache.
                        log::warn!("weather: feed closed, cache is frozen");
                        subsys.on_shutdown_requested().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Write one snapshot under its fixed key and announce it.
    fn apply(&self, snapshot: WeatherSnapshot) {
        let key = match snapshot.source {
            WeatherSource::Local => cache_key::WEATHER_LOCAL_LATEST,
            WeatherSource::Airport => cache_key::WEATHER_AIRPORT_LATEST,
        };

        let value = match contract::encode_weather_snapshot(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                log::error!("weather: cannot encode {} snapshot: {}", snapshot.source, e);
                return;
            }
        };

        self.broker.cache_set(key, value.clone(), None);
        if self.broker.publish(topic::WEATHER_UPDATES, value).is_err() {
            self.broker.count_publish_failure(topic::WEATHER_UPDATES);
        }
        self.health
            .set(component::WEATHER_CACHE, HealthState::Healthy);
        log::debug!(
            "weather: {} snapshot at {} cached",
            snapshot.source,
            snapshot.observed_at
        );
    }
}
