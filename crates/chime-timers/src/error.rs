use thiserror::Error;

use crate::TimerId;

pub type Result<T> = std::result::Result<T, TimerError>;

/// Errors surfaced by the timer engine.
///
/// None of these leave the deadline heap and the timer table out of sync: every failing
/// operation either completes its rollback or leaves the timer in its previous state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// The handle refers to a destroyed or never-issued timer.
    #[error("invalid timer handle {0}")]
    InvalidHandle(TimerId),

    /// The event queue was full when the interrupt handler tried to publish expiries.
    ///
    /// Periodic ticks are coalesced into the next period boundary; one-shot expiries stay armed
    /// and are retried after the configured backoff.
    #[error("event queue overflow: {coalesced} periodic ticks coalesced, {deferred} one-shot expiries deferred")]
    QueueOverflow { coalesced: u64, deferred: u64 },

    /// A callback panicked while being dispatched.
    #[error("callback for {id} failed: {message}")]
    CallbackFailure { id: TimerId, message: String },

    #[error("timer source unavailable: {0}")]
    TimerSourceUnavailable(String),

    #[error("invalid timer spec: {0}")]
    InvalidSpec(&'static str),

    #[error("timer capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
