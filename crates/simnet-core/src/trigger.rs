//! Close-coordination latch.
//!
//! A [`TriggerVariable`] rendezvouses a synchronous caller with an
//! asynchronous completion running on an event loop thread. The latch is
//! *activated* when an operation starts and *triggered* when its completion
//! has finished touching shared state. Waiters block until the latch is either
//! triggered or was never activated.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LatchState {
    activated: bool,
    triggered: bool,
}

/// Activation/trigger latch built on a mutex and two condition variables.
#[derive(Debug, Default)]
pub struct TriggerVariable {
    state: Mutex<LatchState>,
    active_cv: Condvar,
    trigger_cv: Condvar,
}

impl TriggerVariable {
    /// Creates an inactive latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the latch active.
    ///
    /// Returns false if the latch is already active and not yet triggered.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if state.activated && !state.triggered {
            return false;
        }
        state.activated = true;
        state.triggered = false;
        self.active_cv.notify_all();
        true
    }

    /// Triggers an active latch, waking every waiter.
    ///
    /// Idempotent. Returns false if the latch was never activated.
    pub fn trigger(&self) -> bool {
        let mut state = self.state.lock();
        if !state.activated {
            return false;
        }
        state.triggered = true;
        self.trigger_cv.notify_all();
        true
    }

    /// Returns the latch to its inactive state and releases all waiters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.activated = false;
        state.triggered = false;
        self.trigger_cv.notify_all();
    }

    /// Blocks until the latch is triggered or inactive.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.activated && !state.triggered {
            self.trigger_cv.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`; returns true if the latch fired (or was
    /// not active) within the window.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.activated && !state.triggered {
            if self
                .trigger_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        !state.activated || state.triggered
    }

    /// Blocks until the latch has been activated.
    pub fn wait_activation(&self) {
        let mut state = self.state.lock();
        while !state.activated {
            self.active_cv.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout` waiting for activation.
    pub fn wait_for_activation(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.activated {
            if self.active_cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.activated
    }

    /// True while activated and not yet triggered.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.activated && !state.triggered
    }

    /// True once an activated latch has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.state.lock().triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_activate_twice_fails() {
        let latch = TriggerVariable::new();
        assert!(latch.activate());
        assert!(!latch.activate());
        assert!(latch.is_active());

        latch.trigger();
        assert!(!latch.is_active());
        assert!(latch.activate());
    }

    #[test]
    fn test_trigger_requires_activation() {
        let latch = TriggerVariable::new();
        assert!(!latch.trigger());
        assert!(!latch.is_triggered());

        latch.activate();
        assert!(latch.trigger());
        assert!(latch.trigger());
        assert!(latch.is_triggered());
    }

    #[test]
    fn test_wait_on_inactive_returns_immediately() {
        let latch = TriggerVariable::new();
        latch.wait();
        assert!(latch.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_for_times_out() {
        let latch = TriggerVariable::new();
        latch.activate();
        assert!(!latch.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let latch = Arc::new(TriggerVariable::new());
        latch.activate();

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_for(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        latch.trigger();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_reset_releases_waiter() {
        let latch = Arc::new(TriggerVariable::new());
        latch.activate();

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(20));
        latch.reset();
        waiter.join().unwrap();
        assert!(!latch.is_active());
    }

    #[test]
    fn test_wait_for_activation() {
        let latch = Arc::new(TriggerVariable::new());
        assert!(!latch.wait_for_activation(Duration::from_millis(5)));

        let activator = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                latch.activate();
            })
        };
        latch.wait_activation();
        activator.join().unwrap();
        assert!(latch.wait_for_activation(Duration::from_millis(1)));
    }
}
