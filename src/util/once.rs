//! Atomic single-fire gate.
//!
//! [`OnceFlag`] is the guard behind every "idempotent" operation in cordon:
//! dispose, cleanup, the cancel watcher's terminal transition. Exactly one
//! caller of [`OnceFlag::fire`] ever observes `true`.

use std::sync::atomic::{AtomicBool, Ordering};

/// A flag that can be fired exactly once.
#[derive(Debug, Default)]
pub struct OnceFlag {
    fired: AtomicBool,
}

impl OnceFlag {
    /// Creates an unfired flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Fires the flag. Returns `true` only for the first caller.
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true once the flag has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn only_first_fire_wins() {
        let flag = OnceFlag::new();
        assert!(!flag.is_fired());
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.is_fired());
    }

    #[test]
    fn concurrent_fire_has_single_winner() {
        let flag = Arc::new(OnceFlag::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let flag = Arc::clone(&flag);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if flag.fire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
