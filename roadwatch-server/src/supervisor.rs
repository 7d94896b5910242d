//! Supervisor: owns startup order and the storage handles.
//!
//! Components start in dependency order — sensor edge first, fusion
//! next, durable and live outputs after that, the gateway last — each
//! as a named subsystem under `tokio-graceful-shutdown`. A SIGINT or
//! SIGTERM cancels the whole tree; every service drains per its own
//! policy (the writer performs a final flush, the broadcaster closes
//! its clients, the radar reader drops any partial frame).

use std::sync::Arc;

use thiserror::Error;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use crate::broadcaster::Broadcaster;
use crate::consolidator::Consolidator;
use crate::health::component;
use crate::persistence::{EventStore, PersistenceWriter, StoreError};
use crate::radar::RadarReader;
use crate::weather::WeatherService;
use crate::web::{BrokerReads, SessionHealth, Web};
use crate::{Session, VERSION};

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Storage must open at startup; anything else is a misconfigured
    /// deployment and the process exits non-zero.
    #[error("Storage startup failed")]
    Store(#[from] StoreError),
}

pub async fn run(session: Session, subsys: SubsystemHandle) -> Result<(), SupervisorError> {
    let config = session.config();
    log::info!("roadwatch-server {} starting", VERSION);

    let health = session.health();
    for name in [
        component::RADAR_READER,
        component::WEATHER_CACHE,
        component::CONSOLIDATOR,
        component::PERSISTENCE_WRITER,
        component::BROADCASTER,
        component::GATEWAY,
    ] {
        health.register(name);
    }

    // The writer owns the store; the gateway reads through its own
    // read-only pool (same pool only for in-memory databases, which
    // exist per connection).
    let store = EventStore::connect(&config.persistence.database_url).await?;
    let read_store = if config.persistence.database_url.contains(":memory:") {
        store.clone()
    } else {
        EventStore::connect_read_only(&config.persistence.database_url).await?
    };

    // Sensor edge.
    let reader = RadarReader::new(&session);
    subsys.start(SubsystemBuilder::new("RadarReader", |s| reader.run(s)));
    let weather = WeatherService::new(&session);
    subsys.start(SubsystemBuilder::new("WeatherCache", |s| weather.run(s)));

    // Fusion.
    let consolidator = Consolidator::new(&session);
    subsys.start(SubsystemBuilder::new("Consolidator", |s| consolidator.run(s)));

    // Durable and live outputs.
    let writer = PersistenceWriter::new(&session, store);
    subsys.start(SubsystemBuilder::new("PersistenceWriter", |s| writer.run(s)));
    let broadcaster = Broadcaster::new(&session);
    let broadcaster_handle = broadcaster.handle();
    subsys.start(SubsystemBuilder::new("Broadcaster", |s| broadcaster.run(s)));

    // Gateway last: everything it reads already exists.
    let broker_reads = Arc::new(BrokerReads::new(session.broker()));
    let web = Web::new(
        &session,
        Arc::new(read_store),
        broker_reads.clone(),
        broker_reads,
        Arc::new(SessionHealth::new(&session)),
        broadcaster_handle,
    );
    subsys.start(SubsystemBuilder::new("Gateway", |s| web.run(s)));

    subsys.on_shutdown_requested().await;
    log::info!("roadwatch-server shutting down");
    Ok(())
}
