//! Lock-free bounded queue of "timer fired" records.
//!
//! Design goals:
//! - Fixed-size records (timer id + the deadline it fired for); no callback pointers cross the
//!   interrupt boundary.
//! - Push never blocks and never allocates: a full queue is reported to the caller, which applies
//!   the overflow policy.
//! - MPSC via a reservation pointer (`tail_reserve`) and an in-order commit pointer
//!   (`tail_commit`). In practice there is a single producer (the interrupt handler, serialized by
//!   the schedule lock) and a single consumer (the dispatcher).
//! - Records are drained in the order they were committed.

use crate::sync::{spin_hint, AtomicU64, AtomicUsize, Ordering};
use crate::TimerId;

/// Payload published by the interrupt handler for each expired timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub id: TimerId,
    /// The scheduled deadline the timer fired for (not the observed fire time).
    pub deadline: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
}

struct Slot {
    id: AtomicU64,
    deadline: AtomicU64,
}

pub struct EventQueue {
    mask: usize,
    head: AtomicUsize,
    tail_reserve: AtomicUsize,
    tail_commit: AtomicUsize,
    slots: Box<[Slot]>,
}

impl EventQueue {
    /// Create a queue holding at least `capacity` records (rounded up to a power of two).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let cap = capacity.next_power_of_two();
        let slots = (0..cap)
            .map(|_| Slot {
                id: AtomicU64::new(0),
                deadline: AtomicU64::new(0),
            })
            .collect();
        Self {
            mask: cap - 1,
            head: AtomicUsize::new(0),
            tail_reserve: AtomicUsize::new(0),
            tail_commit: AtomicUsize::new(0),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail_commit.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_push(&self, record: EventRecord) -> Result<(), PushError> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);

            if tail.wrapping_sub(head) >= self.capacity() {
                return Err(PushError::Full);
            }

            if self
                .tail_reserve
                .compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                spin_hint();
                continue;
            }

            let slot = &self.slots[tail & self.mask];
            slot.id.store(record.id.to_raw(), Ordering::Relaxed);
            slot.deadline.store(record.deadline, Ordering::Relaxed);

            // Commit in-order.
            while self.tail_commit.load(Ordering::Acquire) != tail {
                spin_hint();
            }
            self.tail_commit
                .store(tail.wrapping_add(1), Ordering::Release);
            return Ok(());
        }
    }

    /// Pop the oldest committed record. Must only be called from the single consumer.
    pub fn try_pop(&self) -> Option<EventRecord> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail_commit.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let slot = &self.slots[head & self.mask];
        let record = EventRecord {
            id: TimerId::from_raw(slot.id.load(Ordering::Relaxed)),
            deadline: slot.deadline.load(Ordering::Relaxed),
        };

        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(record)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct Rng(u64);

    impl Rng {
        fn next_u32(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.0 = x;
            ((x.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
        }
    }

    fn record(n: u64) -> EventRecord {
        EventRecord {
            id: TimerId::new(n as u32, (n >> 32) as u32),
            deadline: n.wrapping_mul(3),
        }
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(EventQueue::new(1).capacity(), 1);
        assert_eq!(EventQueue::new(3).capacity(), 4);
        assert_eq!(EventQueue::new(1000).capacity(), 1024);
    }

    #[test]
    fn reports_full_without_overwriting() {
        let q = EventQueue::new(4);
        for n in 0..4 {
            q.try_push(record(n)).unwrap();
        }
        assert_eq!(q.try_push(record(99)), Err(PushError::Full));
        assert_eq!(q.len(), 4);
        for n in 0..4 {
            assert_eq!(q.try_pop(), Some(record(n)));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn single_thread_fuzz_against_model() {
        // Tiny capacity to force wraparound and full-queue behaviour.
        let q = EventQueue::new(8);
        let mut model = VecDeque::new();
        let mut rng = Rng(0x1234_5678_9ABC_DEF0);
        let mut next = 0u64;

        for _ in 0..50_000 {
            if rng.next_u32() % 2 == 0 {
                let r = record(next);
                next += 1;
                match q.try_push(r) {
                    Ok(()) => model.push_back(r),
                    Err(PushError::Full) => assert_eq!(model.len(), q.capacity()),
                }
            } else {
                assert_eq!(q.try_pop(), model.pop_front());
            }
            assert_eq!(q.len(), model.len());
        }
    }

    #[test]
    fn spsc_concurrent_preserves_order() {
        let q = Arc::new(EventQueue::new(64));
        let producer = q.clone();
        const N: u64 = 100_000;

        let t_prod = std::thread::spawn(move || {
            for n in 0..N {
                while producer.try_push(record(n)).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        for n in 0..N {
            let r = loop {
                if let Some(r) = q.try_pop() {
                    break r;
                }
                std::hint::spin_loop();
            };
            assert_eq!(r, record(n));
        }

        t_prod.join().unwrap();
        assert!(q.is_empty());
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;

    #[test]
    fn producer_and_consumer_agree_on_order() {
        loom::model(|| {
            let q = Arc::new(EventQueue::new(2));
            let producer = {
                let q = q.clone();
                loom::thread::spawn(move || {
                    for n in 0..2u32 {
                        q.try_push(EventRecord {
                            id: TimerId::new(n, 0),
                            deadline: u64::from(n),
                        })
                        .unwrap();
                    }
                })
            };

            let mut seen = Vec::new();
            while seen.len() < 2 {
                match q.try_pop() {
                    Some(r) => seen.push(r.deadline),
                    None => loom::thread::yield_now(),
                }
            }
            producer.join().unwrap();
            assert_eq!(seen, vec![0, 1]);
        });
    }
}
