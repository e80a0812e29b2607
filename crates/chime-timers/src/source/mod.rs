//! OS timer sources: the single real time-keeping primitive all logical timers multiplex over.
//!
//! A source is programmed with one absolute deadline at a time. When the deadline passes it
//! *latches* (clears its program) and then invokes the [`ExpiryHandler`] exactly once, handing it
//! a [`TimerControl`] so the handler can reprogram the next deadline without owning the source.

use std::sync::Arc;

use crate::Result;

mod manual;
mod thread;

pub use manual::ManualTimerSource;
pub use thread::ThreadTimerSource;

/// Programming interface of a one-shot timer primitive.
pub trait TimerControl: Send + Sync {
    /// Fire once at `deadline_ns` (monotonic clock time), replacing any prior program.
    fn arm_at(&self, deadline_ns: u64) -> Result<()>;

    /// Cancel the pending program, if any. A firing that already latched is still delivered.
    fn disarm(&self);
}

/// A [`TimerControl`] with a lifecycle.
pub trait TimerSource: TimerControl {
    /// Attach the expiry handler and begin delivering notifications.
    fn start(&self, handler: Arc<dyn ExpiryHandler>) -> Result<()>;

    /// Stop delivering notifications. After this returns the handler is never invoked again.
    fn shutdown(&self);
}

/// Receiver of source expiries. Runs in the source's notification context, so implementations
/// must not block, allocate, or run user code.
pub trait ExpiryHandler: Send + Sync {
    fn on_expiry(&self, control: &dyn TimerControl);
}
