//! Timer table: handles, lifecycle state and callbacks.
//!
//! The registry is the only normal-context owner of the schedule. Every start/stop goes through
//! [`EngineCore::with_schedule`], which also reprograms the timer source under the same lock.

use std::sync::Arc;
use std::time::Duration;

use chime_time::{ns_from_duration, ns_from_secs_f64, SecondsError};

use crate::handler::EngineCore;
use crate::queue::EventRecord;
use crate::schedule::next_boundary;
use crate::source::TimerSource;
use crate::{Result, TimerError, TimerId};

/// User logic invoked by the dispatcher. Never called from the interrupt handler.
pub type Callback = Box<dyn FnMut() + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Created, never started.
    Idle,
    /// Scheduled and waiting for its deadline.
    Armed,
    /// Explicitly stopped, or a one-shot timer that already fired.
    Stopped,
    /// Expired; the record is queued but not dispatched yet.
    FiredPending,
}

/// How a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub mode: TimerMode,
    /// Delay from `start` to the first expiry. Zero fires as soon as possible.
    pub interval: Duration,
    /// Delay between expiries of a periodic timer. Ignored for one-shot timers.
    pub period: Duration,
}

impl TimerSpec {
    pub fn new(mode: TimerMode, interval: Duration, period: Duration) -> Self {
        Self {
            mode,
            interval,
            period,
        }
    }

    pub fn one_shot(interval: Duration) -> Self {
        Self::new(TimerMode::OneShot, interval, Duration::ZERO)
    }

    /// Periodic timer whose first expiry is one period after `start`.
    pub fn periodic(period: Duration) -> Self {
        Self::new(TimerMode::Periodic, period, period)
    }

    /// Build a spec from fractional seconds.
    pub fn from_secs_f64(mode: TimerMode, interval: f64, period: f64) -> Result<Self> {
        let interval = ns_from_secs_f64(interval).map_err(|err| {
            TimerError::InvalidSpec(match err {
                SecondsError::NotANumber => "interval is NaN",
                SecondsError::Negative => "interval must be non-negative",
                SecondsError::OutOfRange => "interval is too large",
            })
        })?;
        let period = ns_from_secs_f64(period).map_err(|err| {
            TimerError::InvalidSpec(match err {
                SecondsError::NotANumber => "period is NaN",
                SecondsError::Negative => "period must be non-negative",
                SecondsError::OutOfRange => "period is too large",
            })
        })?;
        Ok(Self::new(
            mode,
            Duration::from_nanos(interval),
            Duration::from_nanos(period),
        ))
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == TimerMode::Periodic && self.period.is_zero() {
            return Err(TimerError::InvalidSpec(
                "periodic timers need a non-zero period",
            ));
        }
        Ok(())
    }

    fn period_ns(&self) -> u64 {
        match self.mode {
            TimerMode::OneShot => 0,
            TimerMode::Periodic => ns_from_duration(self.period).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Armed,
    Stopped,
}

struct Entry {
    generation: u32,
    live: bool,
    spec: TimerSpec,
    lifecycle: Lifecycle,
    callback: Option<Callback>,
    fire_count: u64,
    missed: u64,
}

/// A callback checked out for one dispatch.
pub(crate) struct Checkout {
    pub id: TimerId,
    pub deadline: u64,
    pub callback: Callback,
}

pub struct TimerRegistry {
    core: Arc<EngineCore>,
    source: Arc<dyn TimerSource>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    max_timers: usize,
    live: usize,
}

impl TimerRegistry {
    pub(crate) fn new(core: Arc<EngineCore>, source: Arc<dyn TimerSource>, max_timers: usize) -> Self {
        Self {
            core,
            source,
            entries: Vec::with_capacity(max_timers),
            free: Vec::with_capacity(max_timers),
            max_timers,
            live: 0,
        }
    }

    pub(crate) fn core(&self) -> &EngineCore {
        &self.core
    }

    pub(crate) fn source(&self) -> &dyn TimerSource {
        &*self.source
    }

    fn entry(&self, id: TimerId) -> Result<&Entry> {
        self.entries
            .get(id.index() as usize)
            .filter(|e| e.live && e.generation == id.generation())
            .ok_or(TimerError::InvalidHandle(id))
    }

    fn entry_mut(&mut self, id: TimerId) -> Result<&mut Entry> {
        self.entries
            .get_mut(id.index() as usize)
            .filter(|e| e.live && e.generation == id.generation())
            .ok_or(TimerError::InvalidHandle(id))
    }

    pub fn create(&mut self, spec: TimerSpec, callback: Callback) -> Result<TimerId> {
        spec.validate()?;

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.entries.len() < self.max_timers => {
                self.entries.push(Entry {
                    generation: 0,
                    live: false,
                    spec,
                    lifecycle: Lifecycle::Idle,
                    callback: None,
                    fire_count: 0,
                    missed: 0,
                });
                (self.entries.len() - 1) as u32
            }
            None => {
                return Err(TimerError::CapacityExceeded {
                    limit: self.max_timers,
                })
            }
        };

        let entry = &mut self.entries[index as usize];
        entry.live = true;
        entry.spec = spec;
        entry.lifecycle = Lifecycle::Idle;
        entry.callback = Some(callback);
        entry.fire_count = 0;
        entry.missed = 0;
        self.live += 1;

        let id = TimerId::new(index, entry.generation);
        tracing::trace!(%id, mode = ?spec.mode, "timer created");
        Ok(id)
    }

    /// Arm `id` at `now + interval`. Starting an armed or fired-pending timer is a no-op.
    ///
    /// If the source cannot be programmed the timer keeps its previous state.
    pub fn start(&mut self, id: TimerId) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.lifecycle == Lifecycle::Armed {
            return Ok(());
        }
        let spec = entry.spec;
        let deadline = self
            .core
            .now_ns()
            .saturating_add(ns_from_duration(spec.interval));

        let source = &*self.source;
        self.core.with_schedule(source, |schedule| {
            schedule.arm(id, deadline, spec.period_ns());
            schedule.reprogram(source).inspect_err(|_| {
                schedule.disarm(id);
            })
        })?;

        self.entry_mut(id)?.lifecycle = Lifecycle::Armed;
        tracing::trace!(%id, deadline, "timer started");
        Ok(())
    }

    /// Disarm `id`. Idempotent; a queued record for the timer is discarded at dispatch.
    pub fn stop(&mut self, id: TimerId) -> Result<()> {
        if self.entry(id)?.lifecycle != Lifecycle::Armed {
            return Ok(());
        }

        let source = &*self.source;
        let (coalesced, reprogrammed) = self.core.with_schedule(source, |schedule| {
            schedule.disarm(id);
            let coalesced = schedule.take_coalesced(id);
            (coalesced, schedule.reprogram(source))
        });
        if let Err(err) = reprogrammed {
            tracing::warn!(%id, %err, "failed to reprogram timer source after stop");
        }

        let entry = self.entry_mut(id)?;
        entry.lifecycle = Lifecycle::Stopped;
        entry.missed = entry.missed.saturating_add(coalesced);
        tracing::trace!(%id, "timer stopped");
        Ok(())
    }

    /// Stop `id`, release its callback and invalidate the handle.
    pub fn destroy(&mut self, id: TimerId) -> Result<()> {
        self.stop(id)?;

        let entry = self.entry_mut(id)?;
        entry.live = false;
        entry.callback = None;
        let retired = entry.generation == u32::MAX;
        entry.generation = entry.generation.wrapping_add(1);
        if !retired {
            self.free.push(id.index());
        }
        self.live -= 1;
        tracing::trace!(%id, retired, "timer destroyed");
        Ok(())
    }

    pub fn state(&self, id: TimerId) -> Result<TimerState> {
        Ok(match self.entry(id)?.lifecycle {
            Lifecycle::Idle => TimerState::Idle,
            Lifecycle::Stopped => TimerState::Stopped,
            Lifecycle::Armed => {
                let scheduled = self
                    .core
                    .with_schedule(self.source(), |schedule| schedule.is_scheduled(id));
                if scheduled {
                    TimerState::Armed
                } else {
                    TimerState::FiredPending
                }
            }
        })
    }

    /// Time until the next expiry of `id`; zero unless it is waiting in the schedule.
    pub fn remaining(&self, id: TimerId) -> Result<Duration> {
        if self.entry(id)?.lifecycle != Lifecycle::Armed {
            return Ok(Duration::ZERO);
        }
        let deadline = self
            .core
            .with_schedule(self.source(), |schedule| schedule.deadline_of(id));
        Ok(deadline.map_or(Duration::ZERO, |deadline| {
            Duration::from_nanos(deadline.saturating_sub(self.core.now_ns()))
        }))
    }

    pub fn spec(&self, id: TimerId) -> Result<TimerSpec> {
        Ok(self.entry(id)?.spec)
    }

    pub fn fire_count(&self, id: TimerId) -> Result<u64> {
        Ok(self.entry(id)?.fire_count)
    }

    /// Periodic ticks skipped by drift correction or queue-overflow coalescing.
    pub fn missed_ticks(&self, id: TimerId) -> Result<u64> {
        let missed = self.entry(id)?.missed;
        let pending = self
            .core
            .with_schedule(self.source(), |schedule| schedule.coalesced(id));
        Ok(missed.saturating_add(pending))
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn armed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.live && e.lifecycle == Lifecycle::Armed)
            .count()
    }

    /// Number of entries in the deadline heap.
    pub fn scheduled_count(&self) -> usize {
        self.core
            .with_schedule(self.source(), |schedule| schedule.len())
    }

    pub fn live_ids(&self) -> impl Iterator<Item = TimerId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(index, e)| TimerId::new(index as u32, e.generation))
    }

    /// Validate a drained record and check its callback out for invocation.
    ///
    /// Returns `None` when the record is stale: the timer was destroyed, stopped or restarted
    /// after the record was queued, or the record was coalesced away.
    pub(crate) fn begin_dispatch(&mut self, record: EventRecord) -> Option<Checkout> {
        let id = record.id;
        if self.entry(id).ok()?.lifecycle != Lifecycle::Armed {
            return None;
        }
        let source = &*self.source;
        let fired = self
            .core
            .with_schedule(source, |schedule| schedule.take_fired(id, record.deadline));
        if !fired {
            return None;
        }
        let callback = self.entry_mut(id).ok()?.callback.take()?;
        Some(Checkout {
            id,
            deadline: record.deadline,
            callback,
        })
    }

    /// Return a checked-out callback and reschedule or retire the timer.
    pub(crate) fn finish_dispatch(&mut self, checkout: Checkout) -> Result<()> {
        let Checkout {
            id,
            deadline,
            callback,
        } = checkout;
        let entry = self.entry_mut(id)?;
        entry.callback = Some(callback);
        entry.fire_count = entry.fire_count.saturating_add(1);
        if entry.lifecycle != Lifecycle::Armed {
            return Ok(());
        }

        let spec = entry.spec;
        if spec.mode == TimerMode::OneShot {
            entry.lifecycle = Lifecycle::Stopped;
            return Ok(());
        }

        let period = spec.period_ns();
        let now = self.core.now_ns();
        let (next, skipped) = next_boundary(deadline, period, now);
        let source = &*self.source;
        let (coalesced, armed) = self.core.with_schedule(source, |schedule| {
            schedule.arm(id, next, period);
            let armed = schedule.reprogram(source).inspect_err(|_| {
                schedule.disarm(id);
            });
            (schedule.take_coalesced(id), armed)
        });

        let entry = self.entry_mut(id)?;
        entry.missed = entry
            .missed
            .saturating_add(skipped)
            .saturating_add(coalesced);
        if skipped > 0 {
            tracing::debug!(%id, skipped, next, "periodic timer skipped missed ticks");
        }
        if let Err(err) = armed {
            entry.lifecycle = Lifecycle::Stopped;
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        let ids: Vec<TimerId> = self.live_ids().collect();
        for id in ids {
            let _ = self.destroy(id);
        }
        self.source.shutdown();
        tracing::debug!("timer registry shut down");
    }
}
