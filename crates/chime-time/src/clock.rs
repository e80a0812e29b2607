use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic time for the engine.
///
/// `now_ns` is read both from normal context and from the interrupt handler, so implementations
/// must not block or take locks.
pub trait Clock: Debug + Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Host monotonic clock anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }
}

/// CPU time consumed by one thread, readable from any thread.
///
/// Deadlines on this clock only advance while the owning thread is running. Once the thread has
/// exited the clock stays at the last value observed.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ThreadCpuClock {
    clock_id: libc::clockid_t,
    last_ns: AtomicU64,
}

#[cfg(target_os = "linux")]
impl ThreadCpuClock {
    /// CPU-time clock of the calling thread.
    pub fn current_thread() -> std::io::Result<Self> {
        let mut clock_id: libc::clockid_t = 0;
        // SAFETY: `pthread_self` is always a valid handle for the calling thread and `clock_id`
        // is a valid out pointer.
        let ret = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock_id) };
        if ret != 0 {
            return Err(std::io::Error::from_raw_os_error(ret));
        }
        let clock = Self {
            clock_id,
            last_ns: AtomicU64::new(0),
        };
        clock.now_ns();
        Ok(clock)
    }
}

#[cfg(target_os = "linux")]
impl Clock for ThreadCpuClock {
    fn now_ns(&self) -> u64 {
        let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: `ts` is a valid out pointer; on success the kernel fully initializes it.
        let ret = unsafe { libc::clock_gettime(self.clock_id, ts.as_mut_ptr()) };
        if ret != 0 {
            return self.last_ns.load(Ordering::Relaxed);
        }
        // SAFETY: `clock_gettime` succeeded.
        let ts = unsafe { ts.assume_init() };
        let ns = (ts.tv_sec as u64)
            .saturating_mul(crate::NANOS_PER_SEC)
            .saturating_add(ts.tv_nsec as u64);
        let prev = self.last_ns.fetch_max(ns, Ordering::Relaxed);
        prev.max(ns)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeClock {
    now_ns: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    /// Move time forward by `delta_ns` and return the new time.
    pub fn advance(&self, delta_ns: u64) -> u64 {
        let prev = self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
        prev.saturating_add(delta_ns)
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
