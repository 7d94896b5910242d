//! Speed statistics for the gateway's stats endpoint, plus the ISO-8601
//! duration parser used by its `window` query parameter.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Summary over a set of consolidated events. Speeds are absolute values;
/// direction is irrelevant to the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedStats {
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_speed_mph: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_speed_mph: Option<f64>,
    pub by_type: BTreeMap<String, u64>,
}

/// Summarize `(speed_mph, vehicle_type)` pairs. Events without a camera
/// attachment count toward the totals but not toward any type bucket.
pub fn summarize<I>(rows: I) -> SpeedStats
where
    I: IntoIterator<Item = (f64, Option<String>)>,
{
    let mut speeds: Vec<f64> = Vec::new();
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();

    for (speed, vehicle_type) in rows {
        speeds.push(speed.abs());
        if let Some(t) = vehicle_type {
            *by_type.entry(t).or_insert(0) += 1;
        }
    }

    let count = speeds.len() as u64;
    if count == 0 {
        return SpeedStats {
            count,
            avg_speed_mph: None,
            p95_speed_mph: None,
            by_type,
        };
    }

    let avg = speeds.iter().sum::<f64>() / count as f64;
    speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    // Nearest-rank p95: ceil(0.95 * n), 1-indexed.
    let rank = ((0.95 * count as f64).ceil() as usize).clamp(1, speeds.len());
    let p95 = speeds[rank - 1];

    SpeedStats {
        count,
        avg_speed_mph: Some(avg),
        p95_speed_mph: Some(p95),
        by_type,
    }
}

/// Error from [`parse_iso8601_duration`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DurationParseError {
    #[error("Duration must start with 'P': '{0}'")]
    MissingPrefix(String),
    #[error("Invalid duration component '{0}'")]
    InvalidComponent(String),
    #[error("Empty duration")]
    Empty,
}

/// Parse an ISO-8601 duration of the form `PnDTnHnMn.nS` (calendar
/// components beyond days are not supported; the stats window never
/// needs them). `PT0S` is valid and means a zero-length window.
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    let Some(rest) = s.strip_prefix('P').or_else(|| s.strip_prefix('p')) else {
        return Err(DurationParseError::MissingPrefix(s.to_string()));
    };
    if rest.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let (date_part, time_part) = match rest.split_once(['T', 't']) {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::zero();
    let mut saw_component = false;

    for (part, in_time) in [(date_part, false), (time_part, true)] {
        let mut number = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
                continue;
            }
            let value: f64 = number
                .parse()
                .map_err(|_| DurationParseError::InvalidComponent(format!("{}{}", number, ch)))?;
            number.clear();
            saw_component = true;

            let millis = match (ch.to_ascii_uppercase(), in_time) {
                ('W', false) => value * 7.0 * 86_400_000.0,
                ('D', false) => value * 86_400_000.0,
                ('H', true) => value * 3_600_000.0,
                ('M', true) => value * 60_000.0,
                ('S', true) => value * 1_000.0,
                _ => {
                    return Err(DurationParseError::InvalidComponent(format!(
                        "{}{}",
                        value, ch
                    )))
                }
            };
            total = total + Duration::milliseconds(millis.round() as i64);
        }
        if !number.is_empty() {
            return Err(DurationParseError::InvalidComponent(number));
        }
    }

    if !saw_component {
        return Err(DurationParseError::Empty);
    }
    Ok(total)
}
