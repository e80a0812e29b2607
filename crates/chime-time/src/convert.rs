use std::time::Duration;

use thiserror::Error;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecondsError {
    #[error("value is NaN")]
    NotANumber,
    #[error("value is negative")]
    Negative,
    #[error("value exceeds the nanosecond range")]
    OutOfRange,
}

/// Convert a floating-point number of seconds to whole nanoseconds, rounding to nearest.
pub fn ns_from_secs_f64(secs: f64) -> Result<u64, SecondsError> {
    if secs.is_nan() {
        return Err(SecondsError::NotANumber);
    }
    if secs < 0.0 {
        return Err(SecondsError::Negative);
    }
    let ns = (secs * NANOS_PER_SEC as f64).round();
    // `u64::MAX as f64` rounds up to 2^64, so equality is already out of range.
    if ns >= u64::MAX as f64 {
        return Err(SecondsError::OutOfRange);
    }
    Ok(ns as u64)
}

/// Saturating conversion; durations beyond ~584 years clamp to `u64::MAX`.
pub fn ns_from_duration(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
