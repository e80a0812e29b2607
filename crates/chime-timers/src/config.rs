use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

pub const DEFAULT_MAX_TIMERS: usize = 16_384;
pub const DEFAULT_QUEUE_CAPACITY: usize = 32_768;
pub const DEFAULT_SPIN_THRESHOLD: Duration = Duration::from_micros(50);
pub const DEFAULT_OVERFLOW_BACKOFF: Duration = Duration::from_millis(1);

/// Upper bound on the event queue size; keeps the preallocated ring within a few hundred MiB.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 24;

/// Time base that [`crate::TimerEngine::new`] measures deadlines against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Elapsed real time.
    #[default]
    Monotonic,
    /// CPU time of the thread that builds the engine. Linux only.
    ThreadCpu,
}

impl FromStr for ClockKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monotonic" | "real" => Ok(Self::Monotonic),
            "thread-cpu" | "cpu" => Ok(Self::ThreadCpu),
            _ => Err(ConfigError::InvalidEnv("CHIME_CLOCK")),
        }
    }
}

/// Engine sizing and timing knobs.
///
/// All per-timer storage is preallocated from `max_timers` when the engine is built, so neither
/// `create_timer` nor the interrupt handler allocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of live (created, not yet destroyed) timers.
    pub max_timers: usize,
    /// Event queue slots; rounded up to a power of two.
    pub queue_capacity: usize,
    /// Records drained per `pump()`. `None` drains up to the queue capacity.
    pub dispatch_budget: Option<usize>,
    /// How long the background timer thread busy-waits before a deadline instead of sleeping.
    pub spin_threshold: Duration,
    /// Retry delay for one-shot expiries that found the event queue full.
    pub overflow_backoff: Duration,
    /// Ignored by [`crate::TimerEngine::with_source`], which takes its clock explicitly.
    pub clock: ClockKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_timers: DEFAULT_MAX_TIMERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dispatch_budget: None,
            spin_threshold: DEFAULT_SPIN_THRESHOLD,
            overflow_backoff: DEFAULT_OVERFLOW_BACKOFF,
            clock: ClockKind::Monotonic,
        }
    }
}

impl EngineConfig {
    /// Read overrides from `CHIME_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`EngineConfig::from_env`], but with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var::<usize, _>(&lookup, "CHIME_MAX_TIMERS")? {
            cfg.max_timers = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "CHIME_QUEUE_CAPACITY")? {
            cfg.queue_capacity = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "CHIME_DISPATCH_BUDGET")? {
            cfg.dispatch_budget = Some(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CHIME_SPIN_THRESHOLD_US")? {
            cfg.spin_threshold = Duration::from_micros(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CHIME_OVERFLOW_BACKOFF_US")? {
            cfg.overflow_backoff = Duration::from_micros(v);
        }
        if let Some(v) = parse_var::<ClockKind, _>(&lookup, "CHIME_CLOCK")? {
            cfg.clock = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_timers == 0 {
            return Err(ConfigError::Invalid("max_timers must be non-zero"));
        }
        // Slab indices are 32-bit and `u32::MAX` marks an absent heap position.
        if self.max_timers >= u32::MAX as usize {
            return Err(ConfigError::Invalid("max_timers must fit in 32 bits"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be non-zero"));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::Invalid("queue_capacity too large"));
        }
        if self.dispatch_budget == Some(0) {
            return Err(ConfigError::Invalid("dispatch_budget must be non-zero"));
        }
        if self.overflow_backoff.is_zero() {
            return Err(ConfigError::Invalid("overflow_backoff must be non-zero"));
        }
        Ok(())
    }

    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.next_power_of_two()
    }

    pub fn effective_dispatch_budget(&self) -> usize {
        self.dispatch_budget
            .unwrap_or_else(|| self.effective_queue_capacity())
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.effective_dispatch_budget(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("CHIME_MAX_TIMERS", "2000"),
            ("CHIME_QUEUE_CAPACITY", " 3000 "),
            ("CHIME_DISPATCH_BUDGET", "64"),
            ("CHIME_SPIN_THRESHOLD_US", "0"),
            ("CHIME_OVERFLOW_BACKOFF_US", "250"),
            ("CHIME_CLOCK", "thread-cpu"),
        ]))
        .unwrap();

        assert_eq!(cfg.max_timers, 2000);
        assert_eq!(cfg.queue_capacity, 3000);
        assert_eq!(cfg.effective_queue_capacity(), 4096);
        assert_eq!(cfg.effective_dispatch_budget(), 64);
        assert_eq!(cfg.spin_threshold, Duration::ZERO);
        assert_eq!(cfg.overflow_backoff, Duration::from_micros(250));
        assert_eq!(cfg.clock, ClockKind::ThreadCpu);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = EngineConfig::from_lookup(lookup_from(&[("CHIME_MAX_TIMERS", "lots")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidEnv("CHIME_MAX_TIMERS"));
        let err = EngineConfig::from_lookup(lookup_from(&[("CHIME_CLOCK", "wall")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidEnv("CHIME_CLOCK"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for pairs in [
            [("CHIME_MAX_TIMERS", "0")],
            [("CHIME_QUEUE_CAPACITY", "0")],
            [("CHIME_DISPATCH_BUDGET", "0")],
            [("CHIME_OVERFLOW_BACKOFF_US", "0")],
        ] {
            let err = EngineConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{pairs:?} -> {err:?}");
        }
    }
}
