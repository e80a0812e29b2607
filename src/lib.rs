//! Timer multiplexing engine: many logical timers over one timer source, with callbacks run only
//! at host-designated safe points.
//!
//! See [`timers::TimerEngine`] for the entry point.

pub use chime_time as time;
pub use chime_timers as timers;

pub use chime_timers::{
    Callback, ClockKind, DispatchReport, EngineConfig, EngineStats, TimerEngine, TimerError, TimerId,
    TimerMode, TimerSpec, TimerState,
};
