use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ExpiryHandler, TimerControl, TimerSource};
use crate::{Result, TimerError};

#[derive(Debug, Default)]
struct ManualState {
    program: Option<u64>,
    arm_calls: u64,
    disarm_calls: u64,
    unavailable: bool,
    shut_down: bool,
}

/// Deterministic timer source driven explicitly by the caller.
///
/// Tests pair it with a `FakeClock`: advance the clock, then call [`ManualTimerSource::fire_due`]
/// to deliver the expiry the way a real source would.
#[derive(Default)]
pub struct ManualTimerSource {
    state: Mutex<ManualState>,
    handler: Mutex<Option<Arc<dyn ExpiryHandler>>>,
}

impl ManualTimerSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn program(&self) -> Option<u64> {
        self.state().program
    }

    pub fn is_armed(&self) -> bool {
        self.program().is_some()
    }

    pub fn arm_calls(&self) -> u64 {
        self.state().arm_calls
    }

    pub fn disarm_calls(&self) -> u64 {
        self.state().disarm_calls
    }

    /// Make subsequent `arm_at` calls fail with [`TimerError::TimerSourceUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fire if the programmed deadline is at or before `now_ns`. Returns whether it fired.
    pub fn fire_due(&self, now_ns: u64) -> bool {
        {
            let mut state = self.state();
            match state.program {
                Some(deadline) if deadline <= now_ns && !state.shut_down => {
                    state.program = None;
                }
                _ => return false,
            }
        }
        self.deliver();
        true
    }

    /// Fire unconditionally, as if an expiry raced with a reprogram.
    pub fn fire_now(&self) {
        {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.program = None;
        }
        self.deliver();
    }

    fn deliver(&self) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler.on_expiry(self);
        }
    }
}

impl TimerControl for ManualTimerSource {
    fn arm_at(&self, deadline_ns: u64) -> Result<()> {
        let mut state = self.state();
        if state.unavailable || state.shut_down {
            return Err(TimerError::TimerSourceUnavailable(
                "manual source unavailable".into(),
            ));
        }
        state.arm_calls += 1;
        state.program = Some(deadline_ns);
        Ok(())
    }

    fn disarm(&self) {
        let mut state = self.state();
        state.disarm_calls += 1;
        state.program = None;
    }
}

impl TimerSource for ManualTimerSource {
    fn start(&self, handler: Arc<dyn ExpiryHandler>) -> Result<()> {
        let mut slot = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(TimerError::TimerSourceUnavailable(
                "source already started".into(),
            ));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn shutdown(&self) {
        self.state().shut_down = true;
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for ManualTimerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimerSource")
            .field("state", &*self.state())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicU64,
        rearm_to: Option<u64>,
    }

    impl ExpiryHandler for CountingHandler {
        fn on_expiry(&self, control: &dyn TimerControl) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.rearm_to {
                control.arm_at(next).unwrap();
            }
        }
    }

    #[test]
    fn fires_only_once_deadline_has_passed() {
        let source = ManualTimerSource::new();
        let handler = Arc::new(CountingHandler::default());
        source.start(handler.clone()).unwrap();

        source.arm_at(100).unwrap();
        assert!(!source.fire_due(99));
        assert!(source.fire_due(100));
        // Latched: the program is consumed by the firing.
        assert!(!source.is_armed());
        assert!(!source.fire_due(1_000));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_can_reprogram_from_expiry() {
        let source = ManualTimerSource::new();
        let handler = Arc::new(CountingHandler {
            rearm_to: Some(500),
            ..Default::default()
        });
        source.start(handler).unwrap();

        source.arm_at(10).unwrap();
        assert!(source.fire_due(10));
        assert_eq!(source.program(), Some(500));
        assert_eq!(source.arm_calls(), 2);
    }

    #[test]
    fn unavailable_source_rejects_programs() {
        let source = ManualTimerSource::new();
        source.set_unavailable(true);
        assert!(matches!(
            source.arm_at(1),
            Err(TimerError::TimerSourceUnavailable(_))
        ));
        assert_eq!(source.program(), None);
    }

    #[test]
    fn shutdown_stops_delivery() {
        let source = ManualTimerSource::new();
        let handler = Arc::new(CountingHandler::default());
        source.start(handler.clone()).unwrap();
        source.arm_at(1).unwrap();
        source.shutdown();
        assert!(!source.fire_due(10));
        assert!(source.arm_at(5).is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
