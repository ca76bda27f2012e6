use std::sync::atomic::{AtomicU8, Ordering};

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Single-use Created -> Started -> Stopped state machine. Each transition
/// succeeds at most once, so repeated `start`/`stop` calls are no-ops.
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(CREATED))
    }

    /// Returns `true` for the one caller that moved Created -> Started.
    pub fn start(&self) -> bool {
        self.0
            .compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves Started back to Created after a failed start, so a later
    /// `start` can try again. Does nothing once stopped.
    pub fn abort_start(&self) {
        let _ = self
            .0
            .compare_exchange(STARTED, CREATED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Returns `true` for the one caller that moved Started -> Stopped.
    /// Stopping a never-started component also marks it stopped, but
    /// reports `false` since there is nothing to tear down.
    pub fn stop(&self) -> bool {
        match self
            .0
            .compare_exchange(STARTED, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(_) => {
                let _ = self
                    .0
                    .compare_exchange(CREATED, STOPPED, Ordering::SeqCst, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STARTED
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STOPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_happen_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert!(lifecycle.is_started());
        assert!(lifecycle.stop());
        assert!(!lifecycle.stop());
        assert!(lifecycle.is_stopped());
        assert!(!lifecycle.start());
    }

    #[test]
    fn stop_before_start() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.stop());
        assert!(lifecycle.is_stopped());
        assert!(!lifecycle.start());
    }

    #[test]
    fn aborted_start_can_be_retried() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.start());
        lifecycle.abort_start();
        assert!(!lifecycle.is_started());
        assert!(lifecycle.start());

        assert!(lifecycle.stop());
        lifecycle.abort_start();
        assert!(lifecycle.is_stopped());
    }
}
