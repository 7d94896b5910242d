//! Radar UART frame accumulation and parsing.
//!
//! The Doppler radar emits newline-terminated ASCII records of
//! comma-separated `key=value` fields:
//!
//! ```text
//! speed=+22.5,mag=180\n
//! speed=-3.4\n
//! alert=high_alert\n
//! ```
//!
//! A frame carries zero or more of `speed` (signed float, mph), `mag`
//! (float) and `alert` (one of three level strings). Serial reads hand the
//! accumulator arbitrary byte chunks; a frame is complete only when the
//! terminator is seen, so partial frames survive across reads. Lines that
//! fail validation are discarded by the caller with a counter, never an
//! error to the device loop.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ParseError;
use crate::model::{AlertLevel, Direction, RadarSample};

/// Longest line the accumulator will buffer before declaring the stream
/// corrupt and resynchronizing on the next newline.
pub const MAX_FRAME_LEN: usize = 256;

// =============================================================================
// Accumulator
// =============================================================================

/// Buffers raw serial bytes and yields complete, newline-terminated lines.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    /// Set when the current line overran [`MAX_FRAME_LEN`]; bytes are
    /// discarded until the next terminator.
    overrun: bool,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes from the serial device.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator. `\r\n` is
    /// tolerated. Returns `Err` for an overlong or non-UTF-8 line; the
    /// accumulator has already resynchronized past it.
    pub fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        loop {
            let pos = self.buf.iter().position(|&b| b == b'\n');

            let Some(pos) = pos else {
                if self.buf.len() > MAX_FRAME_LEN && !self.overrun {
                    self.overrun = true;
                    let len = self.buf.len();
                    self.buf.clear();
                    return Some(Err(ParseError::FrameTooLong(len)));
                }
                if self.overrun {
                    self.buf.clear();
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.overrun {
                // Tail of the line that overran; skip it and resume.
                self.overrun = false;
                continue;
            }
            if line.len() > MAX_FRAME_LEN {
                return Some(Err(ParseError::FrameTooLong(line.len())));
            }

            return Some(match String::from_utf8(line) {
                Ok(s) => Ok(s),
                Err(_) => Err(ParseError::InvalidEncoding),
            });
        }
    }

    /// Drop any partially-accumulated frame (used on disconnect and
    /// shutdown; partial frames never cross a reconnect).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.overrun = false;
    }
}

// =============================================================================
// Frame parsing
// =============================================================================

/// The fields a single validated frame carried.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawFrame {
    pub speed_mph: Option<f64>,
    pub magnitude: Option<f64>,
    pub alert: Option<AlertLevel>,
}

impl RawFrame {
    /// Frames with a speed are trigger candidates; alert-only frames are
    /// published but never consolidate.
    pub fn has_speed(&self) -> bool {
        self.speed_mph.is_some()
    }

    /// Build the typed sample for publication. Direction falls out of the
    /// signed speed; alert-only frames read as speed 0 with direction
    /// unknown.
    pub fn into_sample(
        self,
        observed_at: DateTime<Utc>,
        correlation_id: Uuid,
        epsilon_mph: f64,
    ) -> RadarSample {
        let (speed_mph, direction) = match self.speed_mph {
            Some(speed) => (speed, Direction::from_speed(speed, epsilon_mph)),
            None => (0.0, Direction::Unknown),
        };
        RadarSample {
            correlation_id,
            observed_at,
            speed_mph,
            magnitude: self.magnitude,
            direction,
            alert_level: self.alert.unwrap_or_default(),
        }
    }
}

/// Parse one complete line into its fields.
///
/// Validation is strict: every field must be a known `key=value` pair and
/// at least one field must be present. A duplicated key keeps the last
/// occurrence, matching the radar firmware's own behavior when it retries
/// a partially-written record.
pub fn parse_frame(line: &str) -> Result<RawFrame, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut frame = RawFrame::default();
    for field in line.split(',') {
        let field = field.trim();
        let Some((key, value)) = field.split_once('=') else {
            return Err(ParseError::MissingSeparator(field.to_string()));
        };
        match key {
            "speed" => frame.speed_mph = Some(parse_float(key, value)?),
            "mag" => frame.magnitude = Some(parse_float(key, value)?),
            "alert" => {
                frame.alert = Some(
                    AlertLevel::from_wire(value)
                        .ok_or_else(|| ParseError::UnknownAlert(value.to_string()))?,
                )
            }
            _ => return Err(ParseError::UnknownKey(key.to_string())),
        }
    }
    Ok(frame)
}

fn parse_float(key: &str, value: &str) -> Result<f64, ParseError> {
    let parsed = value.parse::<f64>().map_err(|_| ParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    if !parsed.is_finite() {
        return Err(ParseError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}
