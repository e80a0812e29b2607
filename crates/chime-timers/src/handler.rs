//! Interrupt handler and the engine state it shares with normal context.
//!
//! The handler runs on the timer source's notification context. It never blocks, allocates, logs
//! or touches the timer table. It try-locks the schedule; when normal context holds the lock it
//! raises `deferred` instead, and the lock holder runs the same expiry pass right after unlocking.

use std::sync::Arc;

use chime_time::Clock;

use crate::queue::EventQueue;
use crate::schedule::Schedule;
use crate::source::{ExpiryHandler, TimerControl};
use crate::spin::SpinLock;
use crate::sync::{fence, AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub interrupts: AtomicU64,
    pub queued: AtomicU64,
    pub coalesced: AtomicU64,
    pub deferred_oneshots: AtomicU64,
    pub deferred_passes: AtomicU64,
    pub rearm_failures: AtomicU64,
}

pub(crate) struct EngineCore {
    pub schedule: SpinLock<Schedule>,
    pub queue: EventQueue,
    pub clock: Arc<dyn Clock>,
    pub counters: Counters,
    overflow_backoff_ns: u64,
    deferred: AtomicBool,
    interrupt: AtomicBool,
}

impl EngineCore {
    pub fn new(
        clock: Arc<dyn Clock>,
        slots: usize,
        queue_capacity: usize,
        overflow_backoff_ns: u64,
    ) -> Self {
        Self {
            schedule: SpinLock::new(Schedule::with_slots(slots)),
            queue: EventQueue::new(queue_capacity),
            clock,
            counters: Counters::default(),
            overflow_backoff_ns,
            deferred: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn expire_locked<R>(&self, schedule: &mut Schedule, control: &R)
    where
        R: TimerControl + ?Sized,
    {
        let pass = schedule.expire_due(self.clock.now_ns(), &self.queue, self.overflow_backoff_ns);
        if pass.queued > 0 {
            self.counters.queued.fetch_add(pass.queued, Ordering::Relaxed);
            self.interrupt.store(true, Ordering::Release);
        }
        if pass.coalesced > 0 {
            self.counters
                .coalesced
                .fetch_add(pass.coalesced, Ordering::Relaxed);
        }
        if pass.deferred > 0 {
            self.counters
                .deferred_oneshots
                .fetch_add(pass.deferred, Ordering::Relaxed);
            self.interrupt.store(true, Ordering::Release);
        }
        if schedule.reprogram(control).is_err() {
            self.counters.rearm_failures.fetch_add(1, Ordering::Relaxed);
            self.interrupt.store(true, Ordering::Release);
        }
    }

    /// Run `f` with the schedule locked, then any expiry pass the handler deferred meanwhile.
    pub fn with_schedule<T, R>(&self, control: &R, f: impl FnOnce(&mut Schedule) -> T) -> T
    where
        R: TimerControl + ?Sized,
    {
        let out = {
            let mut schedule = self.schedule.lock();
            f(&mut schedule)
        };
        fence(Ordering::SeqCst);
        self.run_deferred(control);
        out
    }

    pub fn run_deferred<R>(&self, control: &R)
    where
        R: TimerControl + ?Sized,
    {
        while self.deferred.swap(false, Ordering::SeqCst) {
            let mut schedule = self.schedule.lock();
            self.counters.deferred_passes.fetch_add(1, Ordering::Relaxed);
            self.expire_locked(&mut schedule, control);
        }
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    pub fn raise_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }
}

pub(crate) struct InterruptHandler {
    core: Arc<EngineCore>,
}

impl InterruptHandler {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

impl ExpiryHandler for InterruptHandler {
    fn on_expiry(&self, control: &dyn TimerControl) {
        let core = &self.core;
        core.counters.interrupts.fetch_add(1, Ordering::Relaxed);

        core.deferred.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if let Some(mut schedule) = core.schedule.try_lock() {
            core.deferred.store(false, Ordering::SeqCst);
            core.expire_locked(&mut schedule, control);
        }
    }
}
