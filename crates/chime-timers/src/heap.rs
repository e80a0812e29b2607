//! Indexed binary min-heap of armed timers keyed by absolute deadline.
//!
//! Each timer slot has at most one entry. A slot-indexed position table makes `remove` and
//! `contains` O(1) lookups followed by an O(log N) sift, which keeps start/stop cheap even when
//! thousands of timers are armed. Equal deadlines pop in insertion order.
//!
//! Storage is sized for a fixed number of slots at construction; `insert`, `remove` and `pop_min`
//! never allocate, so the interrupt handler may use them.

use crate::TimerId;

const ABSENT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: u64,
    seq: u64,
    id: TimerId,
}

impl HeapEntry {
    fn key(&self) -> (u64, u64) {
        (self.deadline, self.seq)
    }
}

#[derive(Debug)]
pub struct DeadlineHeap {
    entries: Vec<HeapEntry>,
    /// Heap position per slot index, `ABSENT` when the slot is not queued.
    positions: Vec<u32>,
    next_seq: u64,
}

impl DeadlineHeap {
    /// Create a heap able to hold one entry for each of `slots` timer slots.
    pub fn with_slots(slots: usize) -> Self {
        assert!(slots < ABSENT as usize);
        Self {
            entries: Vec::with_capacity(slots),
            positions: vec![ABSENT; slots],
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, id: TimerId) -> Option<usize> {
        let pos = *self.positions.get(id.index() as usize)?;
        if pos == ABSENT {
            return None;
        }
        let pos = pos as usize;
        (self.entries[pos].id == id).then_some(pos)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.position(id).is_some()
    }

    pub fn deadline_of(&self, id: TimerId) -> Option<u64> {
        self.position(id).map(|pos| self.entries[pos].deadline)
    }

    /// Queue `id` at `deadline`. An existing entry for the same slot is replaced and the new
    /// deadline sorts after every entry already queued with the same deadline.
    pub fn insert(&mut self, id: TimerId, deadline: u64) {
        let slot = id.index() as usize;
        if self.positions[slot] != ABSENT {
            self.remove_at(self.positions[slot] as usize);
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let pos = self.entries.len();
        self.entries.push(HeapEntry { deadline, seq, id });
        self.positions[slot] = pos as u32;
        self.sift_up(pos);
    }

    /// Remove `id` if present and return its deadline. Absent ids are a no-op.
    pub fn remove(&mut self, id: TimerId) -> Option<u64> {
        let pos = self.position(id)?;
        Some(self.remove_at(pos).deadline)
    }

    pub fn peek_min(&self) -> Option<(TimerId, u64)> {
        self.entries.first().map(|e| (e.id, e.deadline))
    }

    pub fn pop_min(&mut self) -> Option<(TimerId, u64)> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.remove_at(0);
        Some((entry.id, entry.deadline))
    }

    fn remove_at(&mut self, pos: usize) -> HeapEntry {
        let last = self.entries.len() - 1;
        self.swap(pos, last);
        let entry = self.entries[last];
        self.entries.truncate(last);
        self.positions[entry.id.index() as usize] = ABSENT;

        if pos < self.entries.len() {
            // The moved entry may belong above or below its new position.
            if pos > 0 && self.less(pos, (pos - 1) / 2) {
                self.sift_up(pos);
            } else {
                self.sift_down(pos);
            }
        }
        entry
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].key() < self.entries[b].key()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions[self.entries[a].id.index() as usize] = a as u32;
        self.positions[self.entries[b].id.index() as usize] = b as u32;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }
}
