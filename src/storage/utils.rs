//! Timestamp helpers shared by every backend
//!
//! All timestamps inside the storage layer are `DateTime<Utc>`. Inputs that
//! carry another offset are normalised on the way in, so two spellings of
//! the same instant always compare equal.

use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Parse an ISO 8601 timestamp, with or without an offset.
///
/// A timestamp without an offset is taken to be UTC.
pub fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(StorageError::validation(format!("invalid timestamp: {}", s)))
}

/// Microseconds since the Unix epoch
pub fn to_micros(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Inverse of [`to_micros`]
pub fn from_micros(micros: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", micros)))
}

/// Drop the sub-second part of a timestamp
pub fn floor_to_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

/// Seconds between two instants, with microsecond precision
pub fn seconds_between(start: &DateTime<Utc>, end: &DateTime<Utc>) -> f64 {
    (to_micros(end) - to_micros(start)) as f64 / MICROS_PER_SEC as f64
}

/// Oldest timestamp a sample may have to survive a purge at `now`.
///
/// `None` when `now - max_age_secs` falls before the earliest representable
/// instant, in which case nothing is old enough to expire.
pub fn expiry_cutoff(now: DateTime<Utc>, max_age_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(max_age_secs).ok()?;
    let age = TimeDelta::try_seconds(secs)?;
    now.checked_sub_signed(age)
}

/// Fixed-point decimal encoding of a timestamp: seconds since the epoch with
/// exactly six fractional digits.
///
/// Used for datetime traits so equality is exact on every backend; a float
/// would not survive the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DecimalTimestamp {
    micros: i64,
}

impl DecimalTimestamp {
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self {
            micros: to_micros(dt),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn micros(&self) -> i64 {
        self.micros
    }

    pub fn to_datetime(&self) -> StorageResult<DateTime<Utc>> {
        from_micros(self.micros)
    }
}

impl fmt::Display for DecimalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.micros < 0 { "-" } else { "" };
        let magnitude = self.micros.unsigned_abs();
        let per_sec = MICROS_PER_SEC as u64;
        write!(f, "{}{}.{:06}", sign, magnitude / per_sec, magnitude % per_sec)
    }
}

impl FromStr for DecimalTimestamp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::validation(format!("invalid decimal timestamp: {}", s));

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (secs, frac) = match digits.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (digits, ""),
        };
        if secs.is_empty() || !secs.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let secs: i64 = secs.parse().map_err(|_| invalid())?;
        let frac: i64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<6}", frac).parse().map_err(|_| invalid())?
        };

        let magnitude = secs
            .checked_mul(MICROS_PER_SEC)
            .and_then(|m| m.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Self::from_micros(if negative { -magnitude } else { magnitude }))
    }
}

impl From<DecimalTimestamp> for String {
    fn from(d: DecimalTimestamp) -> Self {
        d.to_string()
    }
}

impl TryFrom<String> for DecimalTimestamp {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
