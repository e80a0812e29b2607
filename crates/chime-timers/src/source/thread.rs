use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chime_time::{ns_from_duration, Clock};

use super::{ExpiryHandler, TimerControl, TimerSource};
use crate::{Result, TimerError};

#[derive(Debug, Default)]
struct Program {
    deadline: Option<u64>,
    shutdown: bool,
}

struct Shared {
    clock: Arc<dyn Clock>,
    spin_threshold: Duration,
    program: Mutex<Program>,
    wake: Condvar,
}

impl Shared {
    fn program(&self) -> MutexGuard<'_, Program> {
        self.program.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimerControl for Shared {
    fn arm_at(&self, deadline_ns: u64) -> Result<()> {
        let mut program = self.program();
        if program.shutdown {
            return Err(TimerError::TimerSourceUnavailable(
                "timer thread has shut down".into(),
            ));
        }
        program.deadline = Some(deadline_ns);
        drop(program);
        self.wake.notify_one();
        Ok(())
    }

    fn disarm(&self) {
        self.program().deadline = None;
        self.wake.notify_one();
    }
}

/// Timer source backed by one dedicated background thread.
///
/// The thread sleeps on a condition variable until shortly before the programmed deadline, then
/// busy-waits the remaining `spin_threshold` to keep wake-up skew in the microsecond range. The
/// expiry handler runs on this thread, concurrently with the host's normal context.
pub struct ThreadTimerSource {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimerSource {
    pub fn new(clock: Arc<dyn Clock>, spin_threshold: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                spin_threshold,
                program: Mutex::new(Program::default()),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn program(&self) -> Option<u64> {
        self.shared.program().deadline
    }
}

impl TimerControl for ThreadTimerSource {
    fn arm_at(&self, deadline_ns: u64) -> Result<()> {
        self.shared.arm_at(deadline_ns)
    }

    fn disarm(&self) {
        self.shared.disarm();
    }
}

impl TimerSource for ThreadTimerSource {
    fn start(&self, handler: Arc<dyn ExpiryHandler>) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Err(TimerError::TimerSourceUnavailable(
                "timer thread already started".into(),
            ));
        }
        if self.shared.program().shutdown {
            return Err(TimerError::TimerSourceUnavailable(
                "timer thread has shut down".into(),
            ));
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("chime-timer".into())
            .spawn(move || run(&shared, handler.as_ref()))
            .map_err(|err| {
                TimerError::TimerSourceUnavailable(format!("failed to spawn timer thread: {err}"))
            })?;
        *thread = Some(handle);
        tracing::debug!(
            spin_threshold_us = self.shared.spin_threshold.as_micros() as u64,
            "timer thread started"
        );
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut program = self.shared.program();
            program.shutdown = true;
            program.deadline = None;
        }
        self.shared.wake.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("timer thread panicked");
            } else {
                tracing::debug!("timer thread stopped");
            }
        }
    }
}

impl Drop for ThreadTimerSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, handler: &dyn ExpiryHandler) {
    let spin_ns = ns_from_duration(shared.spin_threshold);
    let mut program = shared.program();
    loop {
        if program.shutdown {
            return;
        }
        let Some(deadline) = program.deadline else {
            program = shared
                .wake
                .wait(program)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now = shared.clock.now_ns();
        if now < deadline {
            let remaining = deadline - now;
            if remaining > spin_ns {
                let sleep = Duration::from_nanos(remaining - spin_ns);
                program = shared
                    .wake
                    .wait_timeout(program, sleep)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            // Busy-wait the final stretch without holding the program lock, so normal context can
            // still reprogram. Bounded by real time in case the clock is not advancing.
            drop(program);
            let spin_started = Instant::now();
            while shared.clock.now_ns() < deadline && spin_started.elapsed() <= shared.spin_threshold
            {
                std::hint::spin_loop();
            }
            program = shared.program();
            continue;
        }

        // Latch: the program is consumed before the handler runs. A reprogram from here on
        // schedules the next firing and cannot cancel this one.
        program.deadline = None;
        drop(program);
        handler.on_expiry(shared);
        program = shared.program();
    }
}
