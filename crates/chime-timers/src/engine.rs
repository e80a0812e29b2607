use std::sync::Arc;
use std::time::Duration;

use chime_time::{ns_from_duration, Clock, MonotonicClock};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::handler::{EngineCore, InterruptHandler};
use crate::registry::{Callback, TimerRegistry, TimerSpec, TimerState};
use crate::source::{ThreadTimerSource, TimerSource};
use crate::sync::Ordering;
use crate::{ClockKind, EngineConfig, Result, TimerError, TimerId};

/// Engine-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Timer source expiries delivered to the interrupt handler.
    pub interrupts: u64,
    /// Event records published.
    pub queued: u64,
    /// Periodic ticks dropped because the event queue was full.
    pub coalesced: u64,
    /// One-shot expiries postponed because the event queue was full.
    pub deferred_oneshots: u64,
    /// Expiry passes run by normal context on behalf of a handler that found the schedule locked.
    pub deferred_passes: u64,
    pub callbacks_run: u64,
    pub callback_failures: u64,
    pub armed_timers: usize,
    pub live_timers: usize,
}

/// Multiplexes many logical timers over one timer source.
///
/// Expiries are only recorded asynchronously; callbacks run when the host calls
/// [`TimerEngine::pump`] at a point where running arbitrary code is safe.
///
/// ```no_run
/// use std::time::Duration;
/// use chime_timers::{EngineConfig, TimerEngine, TimerSpec};
///
/// let mut engine = TimerEngine::new(EngineConfig::default())?;
/// let id = engine.create_timer(TimerSpec::periodic(Duration::from_millis(10)), Box::new(|| {
///     println!("tick");
/// }))?;
/// engine.start(id)?;
/// loop {
///     if engine.interrupt_pending() {
///         engine.pump();
///     }
///     # break;
/// }
/// # Ok::<(), chime_timers::TimerError>(())
/// ```
pub struct TimerEngine {
    // Dropped first: shuts the source down before the core goes away.
    registry: TimerRegistry,
    dispatcher: Dispatcher,
}

impl TimerEngine {
    /// Build an engine driven by a background timer thread, measuring deadlines on
    /// `config.clock`.
    ///
    /// With [`ClockKind::ThreadCpu`] the clock is the CPU time of the calling thread.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (clock, spin_threshold) = match config.clock {
            ClockKind::Monotonic => (
                Arc::new(MonotonicClock::new()) as Arc<dyn Clock>,
                config.spin_threshold,
            ),
            // CPU time never runs ahead of real time, so sleeping the remainder cannot overshoot.
            ClockKind::ThreadCpu => (thread_cpu_clock()?, Duration::ZERO),
        };
        let source = Arc::new(ThreadTimerSource::new(clock.clone(), spin_threshold));
        Self::with_source(config, clock, source)
    }

    /// Build an engine on an explicit clock and timer source.
    ///
    /// The source is started here and must not have been started before.
    pub fn with_source(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        source: Arc<dyn TimerSource>,
    ) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(EngineCore::new(
            clock,
            config.max_timers,
            config.effective_queue_capacity(),
            ns_from_duration(config.overflow_backoff),
        ));
        source.start(Arc::new(InterruptHandler::new(core.clone())))?;

        tracing::debug!(
            max_timers = config.max_timers,
            queue_capacity = config.effective_queue_capacity(),
            dispatch_budget = config.effective_dispatch_budget(),
            "timer engine started"
        );
        Ok(Self {
            registry: TimerRegistry::new(core, source, config.max_timers),
            dispatcher: Dispatcher::new(config.effective_dispatch_budget()),
        })
    }

    pub fn create_timer(&mut self, spec: TimerSpec, callback: Callback) -> Result<TimerId> {
        self.registry.create(spec, callback)
    }

    pub fn start(&mut self, id: TimerId) -> Result<()> {
        self.registry.start(id)
    }

    pub fn stop(&mut self, id: TimerId) -> Result<()> {
        self.registry.stop(id)
    }

    pub fn destroy(&mut self, id: TimerId) -> Result<()> {
        self.registry.destroy(id)
    }

    /// Create and start a one-shot timer.
    pub fn set_timeout(&mut self, interval: Duration, callback: Callback) -> Result<TimerId> {
        let id = self.registry.create(TimerSpec::one_shot(interval), callback)?;
        if let Err(err) = self.registry.start(id) {
            let _ = self.registry.destroy(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Run callbacks for every expiry recorded since the last call (up to the dispatch budget).
    pub fn pump(&mut self) -> DispatchReport {
        self.dispatcher.drain_and_dispatch(&mut self.registry)
    }

    /// Whether expiries are waiting for [`TimerEngine::pump`].
    pub fn interrupt_pending(&self) -> bool {
        self.registry.core().interrupt_pending()
    }

    pub fn state(&self, id: TimerId) -> Result<TimerState> {
        self.registry.state(id)
    }

    pub fn spec(&self, id: TimerId) -> Result<TimerSpec> {
        self.registry.spec(id)
    }

    pub fn remaining(&self, id: TimerId) -> Result<Duration> {
        self.registry.remaining(id)
    }

    pub fn fire_count(&self, id: TimerId) -> Result<u64> {
        self.registry.fire_count(id)
    }

    pub fn missed_ticks(&self, id: TimerId) -> Result<u64> {
        self.registry.missed_ticks(id)
    }

    /// Number of entries in the deadline heap.
    pub fn scheduled_count(&self) -> usize {
        self.registry.scheduled_count()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.registry.core().counters;
        EngineStats {
            interrupts: counters.interrupts.load(Ordering::Relaxed),
            queued: counters.queued.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            deferred_oneshots: counters.deferred_oneshots.load(Ordering::Relaxed),
            deferred_passes: counters.deferred_passes.load(Ordering::Relaxed),
            callbacks_run: self.dispatcher.callbacks_run(),
            callback_failures: self.dispatcher.callback_failures(),
            armed_timers: self.registry.armed_count(),
            live_timers: self.registry.live_count(),
        }
    }
}

#[cfg(target_os = "linux")]
fn thread_cpu_clock() -> Result<Arc<dyn Clock>> {
    let clock = chime_time::ThreadCpuClock::current_thread().map_err(|err| {
        TimerError::TimerSourceUnavailable(format!("thread CPU clock unavailable: {err}"))
    })?;
    Ok(Arc::new(clock))
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_clock() -> Result<Arc<dyn Clock>> {
    Err(TimerError::TimerSourceUnavailable(
        "thread CPU clock is only supported on Linux".into(),
    ))
}
