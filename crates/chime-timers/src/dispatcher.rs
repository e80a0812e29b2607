//! Safe-point dispatch: drain the event queue and run callbacks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::registry::TimerRegistry;
use crate::sync::Ordering;
use crate::TimerError;

/// Outcome of one `pump()`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks invoked.
    pub dispatched: usize,
    /// Stale records dropped (timer stopped, destroyed, restarted or coalesced).
    pub discarded: usize,
    /// Callback failures and overflow/reprogramming problems observed since the last pump.
    pub errors: Vec<TimerError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    budget: usize,
    seen_coalesced: u64,
    seen_deferred: u64,
    seen_rearm_failures: u64,
    callbacks_run: u64,
    callback_failures: u64,
}

impl Dispatcher {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            seen_coalesced: 0,
            seen_deferred: 0,
            seen_rearm_failures: 0,
            callbacks_run: 0,
            callback_failures: 0,
        }
    }

    pub fn callbacks_run(&self) -> u64 {
        self.callbacks_run
    }

    pub fn callback_failures(&self) -> u64 {
        self.callback_failures
    }

    /// Drain up to the dispatch budget of records and invoke their callbacks.
    ///
    /// Records left over when the budget runs out stay queued and the interrupt flag is raised
    /// again so the host pumps once more.
    pub fn drain_and_dispatch(&mut self, registry: &mut TimerRegistry) -> DispatchReport {
        let mut report = DispatchReport::default();

        registry.core().take_interrupt();
        registry.core().run_deferred(registry.source());
        self.collect_overflow(registry, &mut report);

        while report.dispatched + report.discarded < self.budget {
            let Some(record) = registry.core().queue.try_pop() else {
                break;
            };
            let Some(mut checkout) = registry.begin_dispatch(record) else {
                report.discarded += 1;
                continue;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (checkout.callback)()));
            report.dispatched += 1;
            self.callbacks_run += 1;

            let id = checkout.id;
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                tracing::error!(%id, %message, "timer callback panicked");
                self.callback_failures += 1;
                report
                    .errors
                    .push(TimerError::CallbackFailure { id, message });
            }

            if let Err(err) = registry.finish_dispatch(checkout) {
                tracing::error!(%id, %err, "failed to re-arm periodic timer");
                report.errors.push(err);
            }
        }

        if !registry.core().queue.is_empty() {
            registry.core().raise_interrupt();
        }
        report
    }

    fn collect_overflow(&mut self, registry: &TimerRegistry, report: &mut DispatchReport) {
        let core = registry.core();
        let coalesced = core.counters.coalesced.load(Ordering::Relaxed);
        let deferred = core.counters.deferred_oneshots.load(Ordering::Relaxed);
        let rearm_failures = core.counters.rearm_failures.load(Ordering::Relaxed);

        let new_coalesced = coalesced - self.seen_coalesced;
        let new_deferred = deferred - self.seen_deferred;
        self.seen_coalesced = coalesced;
        self.seen_deferred = deferred;

        if new_coalesced > 0 || new_deferred > 0 {
            if new_deferred > 0 {
                tracing::error!(
                    deferred = new_deferred,
                    coalesced = new_coalesced,
                    capacity = core.queue.capacity(),
                    "event queue full, one-shot expiries deferred"
                );
                // Records are being drained now; retry the deferred expiries without waiting out
                // the backoff.
                let source = registry.source();
                let retried = core.with_schedule(source, |schedule| {
                    schedule.clear_backoff();
                    schedule.reprogram(source)
                });
                if let Err(err) = retried {
                    report.errors.push(err);
                }
            } else {
                tracing::warn!(
                    coalesced = new_coalesced,
                    capacity = core.queue.capacity(),
                    "event queue full, periodic ticks coalesced"
                );
            }
            report.errors.push(TimerError::QueueOverflow {
                coalesced: new_coalesced,
                deferred: new_deferred,
            });
        }

        if rearm_failures > self.seen_rearm_failures {
            self.seen_rearm_failures = rearm_failures;
            tracing::error!("expiry handler failed to reprogram the timer source");
            let source = registry.source();
            if let Err(err) = core.with_schedule(source, |schedule| schedule.reprogram(source)) {
                report.errors.push(err);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::handler::{EngineCore, InterruptHandler};
    use crate::registry::{Callback, TimerSpec, TimerState};
    use crate::source::{ManualTimerSource, TimerSource};
    use chime_time::{Clock, FakeClock};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<FakeClock>,
        source: Arc<ManualTimerSource>,
        registry: TimerRegistry,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let clock = Arc::new(FakeClock::new(0));
        let source = Arc::new(ManualTimerSource::new());
        let core = Arc::new(EngineCore::new(clock.clone(), 16, queue_capacity, 1_000));
        source
            .start(Arc::new(InterruptHandler::new(core.clone())))
            .unwrap();
        let registry = TimerRegistry::new(core, source.clone(), 16);
        Fixture {
            clock,
            source,
            registry,
        }
    }

    fn counter() -> (Rc<Cell<u32>>, Callback) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        (count, Box::new(move || c.set(c.get() + 1)))
    }

    impl Fixture {
        fn advance_and_fire(&self, ns: u64) {
            let now = self.clock.advance(ns);
            self.source.fire_due(now);
        }
    }

    #[test]
    fn panic_message_extracts_strings() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u32), "callback panicked");
    }

    #[test]
    fn budget_leaves_remaining_records_queued() {
        let mut f = fixture(16);
        let mut dispatcher = Dispatcher::new(2);
        let (count, _) = counter();
        for _ in 0..5 {
            let c = count.clone();
            let id = f
                .registry
                .create(
                    TimerSpec::one_shot(Duration::from_nanos(10)),
                    Box::new(move || c.set(c.get() + 1)),
                )
                .unwrap();
            f.registry.start(id).unwrap();
        }
        f.advance_and_fire(10);

        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 2);
        assert!(f.registry.core().interrupt_pending());

        dispatcher.drain_and_dispatch(&mut f.registry);
        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 1);
        assert!(!f.registry.core().interrupt_pending());
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn panicking_callback_is_reported_and_periodic_keeps_schedule() {
        let mut f = fixture(16);
        let mut dispatcher = Dispatcher::new(16);
        let id = f
            .registry
            .create(
                TimerSpec::periodic(Duration::from_nanos(100)),
                Box::new(|| panic!("callback exploded")),
            )
            .unwrap();
        f.registry.start(id).unwrap();
        f.advance_and_fire(100);

        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 1);
        assert_eq!(
            report.errors,
            vec![TimerError::CallbackFailure {
                id,
                message: "callback exploded".into()
            }]
        );
        assert_eq!(f.registry.state(id), Ok(TimerState::Armed));
        assert_eq!(f.source.program(), Some(200));
        assert_eq!(dispatcher.callback_failures(), 1);
    }

    #[test]
    fn one_shot_stops_after_dispatch() {
        let mut f = fixture(16);
        let mut dispatcher = Dispatcher::new(16);
        let (count, callback) = counter();
        let id = f
            .registry
            .create(TimerSpec::one_shot(Duration::from_nanos(5)), callback)
            .unwrap();
        f.registry.start(id).unwrap();
        f.advance_and_fire(5);

        dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(count.get(), 1);
        assert_eq!(f.registry.state(id), Ok(TimerState::Stopped));
        assert_eq!(f.registry.fire_count(id), Ok(1));
        assert!(!f.source.is_armed());
    }

    #[test]
    fn stopped_timer_record_is_discarded() {
        let mut f = fixture(16);
        let mut dispatcher = Dispatcher::new(16);
        let (count, callback) = counter();
        let id = f
            .registry
            .create(TimerSpec::one_shot(Duration::from_nanos(5)), callback)
            .unwrap();
        f.registry.start(id).unwrap();
        f.advance_and_fire(5);
        f.registry.stop(id).unwrap();
        // Restarting must not resurrect the stale record.
        f.registry.start(id).unwrap();

        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.discarded, 1);
        assert_eq!(count.get(), 0);
        assert_eq!(f.registry.state(id), Ok(TimerState::Armed));
    }

    #[test]
    fn periodic_overflow_is_coalesced_and_reported() {
        let mut f = fixture(1);
        let mut dispatcher = Dispatcher::new(16);
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let a = f
            .registry
            .create(TimerSpec::periodic(Duration::from_nanos(100)), a)
            .unwrap();
        let b = f
            .registry
            .create(TimerSpec::periodic(Duration::from_nanos(100)), b)
            .unwrap();
        f.registry.start(a).unwrap();
        f.registry.start(b).unwrap();
        f.advance_and_fire(100);

        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 1);
        assert_eq!(
            report.errors,
            vec![TimerError::QueueOverflow {
                coalesced: 1,
                deferred: 0
            }]
        );
        assert_eq!(a_count.get(), 1);
        assert_eq!(b_count.get(), 0);
        assert_eq!(f.registry.missed_ticks(b), Ok(1));
        assert_eq!(f.registry.state(b), Ok(TimerState::Armed));

        // Both fire at the next boundary; only one fits again, but nothing is lost for good.
        f.advance_and_fire(100);
        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(report.dispatched, 1);
        assert_eq!(a_count.get() + b_count.get(), 2);
    }

    #[test]
    fn one_shot_overflow_is_deferred_not_lost() {
        let mut f = fixture(1);
        let mut dispatcher = Dispatcher::new(16);
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let a = f
            .registry
            .create(TimerSpec::one_shot(Duration::from_nanos(10)), a)
            .unwrap();
        let b = f
            .registry
            .create(TimerSpec::one_shot(Duration::from_nanos(10)), b)
            .unwrap();
        f.registry.start(a).unwrap();
        f.registry.start(b).unwrap();
        f.advance_and_fire(10);
        assert_eq!(f.registry.state(b), Ok(TimerState::Armed));
        assert_eq!(f.source.program(), Some(1_010));

        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert_eq!(a_count.get(), 1);
        assert_eq!(
            report.errors,
            vec![TimerError::QueueOverflow {
                coalesced: 0,
                deferred: 1
            }]
        );
        // The backoff was lifted once the queue drained.
        assert_eq!(f.source.program(), Some(10));

        f.source.fire_due(f.clock.now_ns());
        let report = dispatcher.drain_and_dispatch(&mut f.registry);
        assert!(report.is_clean());
        assert_eq!(b_count.get(), 1);
        assert_eq!(f.registry.state(b), Ok(TimerState::Stopped));
    }
}
