//! Logical timers multiplexed over a single timer source, with callbacks deferred to safe points.
//!
//! Data flow:
//!
//! 1. The registry arms a timer: its deadline goes into the [`heap`] inside the schedule, and
//!    the timer source is reprogrammed for the earliest deadline.
//! 2. The source fires and runs the interrupt handler, which pops every due deadline and
//!    publishes a compact record per expiry on the lock-free [`queue`]. No user code runs there.
//! 3. The host calls [`TimerEngine::pump`] at a safe point. The dispatcher drains the queue,
//!    validates each record against the timer table and invokes the callback. Periodic timers are
//!    re-armed on their drift-corrected period boundary.
//!
//! All times are `u64` monotonic nanoseconds (see `chime_time`).

mod config;
mod dispatcher;
mod engine;
mod error;
mod handler;
pub mod heap;
mod id;
pub mod queue;
mod registry;
mod schedule;
pub mod source;
mod spin;
mod sync;

pub use config::{
    ClockKind, EngineConfig, DEFAULT_MAX_TIMERS, DEFAULT_OVERFLOW_BACKOFF, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SPIN_THRESHOLD, MAX_QUEUE_CAPACITY,
};
pub use dispatcher::DispatchReport;
pub use engine::{EngineStats, TimerEngine};
pub use error::{ConfigError, Result, TimerError};
pub use id::TimerId;
pub use registry::{Callback, TimerMode, TimerSpec, TimerState};
pub use schedule::next_boundary;
pub use source::{ExpiryHandler, ManualTimerSource, ThreadTimerSource, TimerControl, TimerSource};
