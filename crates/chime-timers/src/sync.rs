//! Atomics shared between normal context and the interrupt handler.
//!
//! Under `--features loom` the unit tests swap in Loom's model-checked types.

#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize};
#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize};

pub(crate) use std::sync::atomic::Ordering;

#[cfg(all(feature = "loom", test))]
#[inline]
pub(crate) fn spin_hint() {
    loom::thread::yield_now();
}

#[cfg(not(all(feature = "loom", test)))]
#[inline]
pub(crate) fn spin_hint() {
    std::hint::spin_loop();
}
