//! Radar serial reader.
//!
//! Owns the serial device exclusively. Bytes come in arbitrary chunks;
//! the core frame accumulator reassembles newline-terminated records
//! across reads, and every frame that survives validation becomes one
//! published [`RadarSample`] carrying a freshly minted correlation id.
//!
//! Failure policy: I/O errors reconnect with exponential backoff
//! (100 ms doubling to a 30 s cap); a sustained outage marks the reader
//! degraded. Samples are never buffered across a disconnect, and a
//! partially-parsed frame is dropped on reconnect and shutdown.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout, Instant};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use uuid::Uuid;

use roadwatch_core::contract::{self, stream, topic};
use roadwatch_core::frame::{parse_frame, FrameAccumulator};

use crate::broker::Broker;
use crate::config::RadarConfig;
use crate::health::{component, HealthRegistry, HealthState};
use crate::Session;

#[derive(Error, Debug)]
pub enum RadarError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("Serial port error")]
    Serial(#[from] tokio_serial::Error),
}

/// Why the inner read loop returned.
enum ReadExit {
    Shutdown,
    Disconnected(String),
}

pub struct RadarReader {
    broker: Broker,
    health: HealthRegistry,
    cfg: RadarConfig,
    /// Frames discarded for failing validation.
    malformed: u64,
}

impl RadarReader {
    pub fn new(session: &Session) -> Self {
        RadarReader {
            broker: session.broker(),
            health: session.health(),
            cfg: session.config().radar,
            malformed: 0,
        }
    }

    /// Open the device and pump frames until shutdown, reconnecting with
    /// backoff on any I/O failure.
    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), RadarError> {
        log::info!(
            "radar: reader starting on {} at {} baud",
            self.cfg.device,
            self.cfg.baud_rate
        );

        let mut backoff = Duration::from_millis(self.cfg.reconnect_initial_ms);
        let backoff_cap = Duration::from_millis(self.cfg.reconnect_max_ms);
        let degraded_after = Duration::from_secs(self.cfg.degraded_after_s);
        let mut failing_since: Option<Instant> = None;

        loop {
            match tokio_serial::new(&self.cfg.device, self.cfg.baud_rate).open_native_async() {
                Ok(port) => {
                    log::info!("radar: connected to {}", self.cfg.device);
                    self.health.set(component::RADAR_READER, HealthState::Healthy);
                    failing_since = None;
                    backoff = Duration::from_millis(self.cfg.reconnect_initial_ms);

                    match self.read_loop(&subsys, port).await {
                        ReadExit::Shutdown => {
                            log::info!(
                                "radar: shutdown ({} malformed frames discarded)",
                                self.malformed
                            );
                            return Ok(());
                        }
                        ReadExit::Disconnected(reason) => {
                            log::warn!("radar: disconnected from {}: {}", self.cfg.device, reason);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("radar: cannot open {}: {}", self.cfg.device, e);
                }
            }

            let since = *failing_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= degraded_after {
                self.health
                    .set(component::RADAR_READER, HealthState::Degraded);
            }

            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => return Ok(()),
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    async fn read_loop(&mut self, subsys: &SubsystemHandle, mut port: SerialStream) -> ReadExit {
        let mut acc = FrameAccumulator::new();
        let mut buf = [0u8; 256];
        let read_timeout = Duration::from_millis(self.cfg.read_timeout_ms);
        let mut consecutive_timeouts: u32 = 0;

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    // Partial frame dies with the connection.
                    acc.clear();
                    return ReadExit::Shutdown;
                }
                read = timeout(read_timeout, port.read(&mut buf)) => match read {
                    Ok(Ok(0)) => return ReadExit::Disconnected("end of stream".to_string()),
                    Ok(Ok(n)) => {
                        consecutive_timeouts = 0;
                        acc.extend(&buf[..n]);
                        while let Some(line) = acc.next_line() {
                            self.handle_line(line);
                        }
                    }
                    Ok(Err(e)) => return ReadExit::Disconnected(e.to_string()),
                    Err(_) => {
                        // Timeouts are normal on an empty road; only a long
                        // silent stretch forces a reopen.
                        consecutive_timeouts += 1;
                        if consecutive_timeouts >= self.cfg.timeouts_before_reopen {
                            return ReadExit::Disconnected(format!(
                                "{} consecutive read timeouts",
                                consecutive_timeouts
                            ));
                        }
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, line: Result<String, roadwatch_core::ParseError>) {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                self.malformed += 1;
                log::debug!("radar: discarded unreadable line: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            return;
        }

        let raw = match parse_frame(&line) {
            Ok(raw) => raw,
            Err(e) => {
                self.malformed += 1;
                log::debug!("radar: discarded frame '{}': {}", line, e);
                return;
            }
        };

        let correlation_id = Uuid::now_v7();
        let sample = raw.into_sample(Utc::now(), correlation_id, self.cfg.epsilon_mph);
        log::trace!(
            "{}: radar sample speed={} mph direction={} alert={}",
            correlation_id,
            sample.speed_mph,
            sample.direction,
            sample.alert_level
        );

        let value = match contract::encode_radar_sample(&sample) {
            Ok(value) => value,
            Err(e) => {
                log::error!("{}: cannot encode radar sample: {}", correlation_id, e);
                return;
            }
        };

        if let Err(e) = self.broker.stream_append(stream::RADAR_DATA, value.clone()) {
            log::error!("{}: stream append failed: {}", correlation_id, e);
        }
        if self.broker.publish(topic::RADAR_DETECTIONS, value).is_err() {
            self.broker.count_publish_failure(topic::RADAR_DETECTIONS);
        }
    }
}
