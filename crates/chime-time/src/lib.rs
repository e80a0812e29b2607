//! Monotonic time modelling for the timer engine.
//!
//! Every deadline in the engine is expressed as **monotonic nanoseconds** since a clock-specific
//! epoch. In production the epoch is the instant the engine was created (see
//! [`MonotonicClock`]); unit tests drive time explicitly via [`FakeClock`] so expiry ordering and
//! drift correction can be asserted without sleeping. On Linux, [`ThreadCpuClock`] measures the
//! CPU time of one thread instead, for timers that should only count time spent running.

mod clock;
mod convert;

#[cfg(target_os = "linux")]
pub use clock::ThreadCpuClock;
pub use clock::{Clock, FakeClock, MonotonicClock};
pub use convert::{
    ns_from_duration, ns_from_secs_f64, SecondsError, NANOS_PER_MILLI, NANOS_PER_SEC,
};
