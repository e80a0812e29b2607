//! Deadline heap plus the per-slot bookkeeping the interrupt handler needs.
//!
//! The schedule is the only state shared between normal context and the interrupt handler. It is
//! always accessed under the engine's spin lock; the handler only ever try-locks it.

use crate::heap::DeadlineHeap;
use crate::queue::{EventQueue, EventRecord, PushError};
use crate::source::TimerControl;
use crate::{Result, TimerId};

#[derive(Debug, Clone, Copy, Default)]
struct SlotSchedule {
    /// Zero for one-shot timers.
    period_ns: u64,
    /// Deadline of the record currently queued for this slot, if any.
    fired_at: Option<u64>,
    /// Ticks skipped by the handler that the registry has not collected yet.
    coalesced: u64,
}

/// Outcome of one expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryPass {
    pub queued: u64,
    pub coalesced: u64,
    pub deferred: u64,
}

#[derive(Debug)]
pub struct Schedule {
    heap: DeadlineHeap,
    slots: Vec<SlotSchedule>,
    /// Deadline the source is currently programmed for.
    armed_for: Option<u64>,
    /// One-shot retries after a full queue are not programmed before this time.
    backoff_until: u64,
}

impl Schedule {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            heap: DeadlineHeap::with_slots(slots),
            slots: vec![SlotSchedule::default(); slots],
            armed_for: None,
            backoff_until: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn armed_for(&self) -> Option<u64> {
        self.armed_for
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.heap.contains(id)
    }

    pub fn deadline_of(&self, id: TimerId) -> Option<u64> {
        self.heap.deadline_of(id)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek_min().map(|(_, deadline)| deadline)
    }

    /// Queue `id` at `deadline`. `period_ns` is zero for one-shot timers.
    pub fn arm(&mut self, id: TimerId, deadline: u64, period_ns: u64) {
        let slot = &mut self.slots[id.index() as usize];
        slot.period_ns = period_ns;
        slot.fired_at = None;
        self.heap.insert(id, deadline);
    }

    /// Remove `id` from the heap and forget any queued firing. Returns whether it was scheduled.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        let was_scheduled = self.heap.remove(id).is_some();
        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            slot.fired_at = None;
        }
        was_scheduled
    }

    /// The deadline of the record queued for `id`, while the timer is not back in the heap.
    pub fn fired_deadline(&self, id: TimerId) -> Option<u64> {
        if self.heap.contains(id) {
            return None;
        }
        self.slots.get(id.index() as usize)?.fired_at
    }

    /// Consume the queued firing of `id` if it matches `deadline`. A record that does not match is
    /// stale (the timer was stopped, restarted or coalesced since) and must be discarded.
    pub fn take_fired(&mut self, id: TimerId, deadline: u64) -> bool {
        if self.fired_deadline(id) != Some(deadline) {
            return false;
        }
        self.slots[id.index() as usize].fired_at = None;
        true
    }

    pub fn coalesced(&self, id: TimerId) -> u64 {
        self.slots
            .get(id.index() as usize)
            .map_or(0, |slot| slot.coalesced)
    }

    pub fn take_coalesced(&mut self, id: TimerId) -> u64 {
        self.slots
            .get_mut(id.index() as usize)
            .map_or(0, |slot| std::mem::take(&mut slot.coalesced))
    }

    pub fn clear_backoff(&mut self) {
        self.backoff_until = 0;
    }

    /// Pop every entry due at `now`, publishing one record per expiry.
    ///
    /// Must only run after the source latched (or was never armed): the source program is
    /// considered consumed. Never allocates.
    pub fn expire_due(&mut self, now: u64, queue: &EventQueue, backoff_ns: u64) -> ExpiryPass {
        self.armed_for = None;

        let mut pass = ExpiryPass::default();
        while let Some((id, deadline)) = self.heap.peek_min() {
            if deadline > now {
                break;
            }
            let slot = &mut self.slots[id.index() as usize];
            match queue.try_push(EventRecord { id, deadline }) {
                Ok(()) => {
                    self.heap.pop_min();
                    slot.fired_at = Some(deadline);
                    pass.queued += 1;
                }
                Err(PushError::Full) if slot.period_ns > 0 => {
                    let (next, skipped) = next_boundary(deadline, slot.period_ns, now);
                    let dropped = skipped.saturating_add(1);
                    slot.coalesced = slot.coalesced.saturating_add(dropped);
                    pass.coalesced = pass.coalesced.saturating_add(dropped);
                    self.heap.insert(id, next);
                }
                Err(PushError::Full) => {
                    // One-shot expiries are never dropped: leave the entry due and retry later.
                    pass.deferred += 1;
                    self.backoff_until = now.saturating_add(backoff_ns);
                    break;
                }
            }
        }
        pass
    }

    /// Program `source` for the earliest deadline, or disarm it when nothing is scheduled.
    ///
    /// Skips the call when the source is already programmed for that deadline. On failure the
    /// recorded program is left unchanged.
    pub fn reprogram<R>(&mut self, source: &R) -> Result<()>
    where
        R: TimerControl + ?Sized,
    {
        match self.next_deadline() {
            Some(deadline) => {
                let target = deadline.max(self.backoff_until);
                if self.armed_for != Some(target) {
                    source.arm_at(target)?;
                    self.armed_for = Some(target);
                }
            }
            None => {
                if self.armed_for.take().is_some() {
                    source.disarm();
                }
            }
        }
        Ok(())
    }
}

/// First period boundary after a tick scheduled at `scheduled`.
///
/// Normally `scheduled + period`. When that is already at or before `now` the boundary skips
/// forward to the first multiple strictly after `now`; the second value is the number of ticks
/// skipped on the way.
pub fn next_boundary(scheduled: u64, period: u64, now: u64) -> (u64, u64) {
    debug_assert!(period > 0);
    let next = scheduled.saturating_add(period);
    if next > now {
        return (next, 0);
    }
    let ticks = (now - scheduled) / period + 1;
    let next = scheduled.saturating_add(ticks.saturating_mul(period));
    (next, ticks - 1)
}
