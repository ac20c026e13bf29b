//! The client-lock counter: the load-bearing asynchronous fan-out idiom
//! described in spec.md §9.
//!
//! On the donor's cooperative single-threaded event loop this would be
//! a plain `gint`. Here the dispatcher's phases run as concurrent
//! tokio tasks, so the counter needs to be shared and mutated safely;
//! a `Mutex<u32>` is enough since every release is a short,
//! non-blocking decrement-and-maybe-trigger.

use std::sync::Arc;

use parking_lot::Mutex;

/// Counts outstanding reasons a [`crate::dispatch::DispatchContext`]
/// must not yet invoke its handler: the structural lock taken at the
/// start of the run, one per in-flight observer call, and one for the
/// approver phase as a whole.
#[derive(Clone)]
pub struct ClientLockCounter {
    count: Arc<Mutex<u32>>,
}

impl ClientLockCounter {
    /// Starts at 1: the structural lock released at the bottom of
    /// `run_clients`.
    pub fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(1)),
        }
    }

    pub fn take(&self) {
        *self.count.lock() += 1;
    }

    /// Release one lock. Returns `true` if this release brought the
    /// counter to zero (the handler phase should now run).
    pub fn release(&self) -> bool {
        let mut count = self.count.lock();
        assert!(*count > 0, "client lock counter released past zero");
        *count -= 1;
        *count == 0
    }

    pub fn current(&self) -> u32 {
        *self.count.lock()
    }
}

impl Default for ClientLockCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_releasing_it_reaches_zero() {
        let lock = ClientLockCounter::new();
        assert_eq!(lock.current(), 1);
        assert!(lock.release());
    }

    #[test]
    fn observers_and_approver_phase_each_add_a_lock() {
        let lock = ClientLockCounter::new();
        lock.take(); // observer 1
        lock.take(); // observer 2
        lock.take(); // approver phase
        assert_eq!(lock.current(), 4);

        assert!(!lock.release()); // structural lock
        assert!(!lock.release()); // observer 1 reply
        assert!(!lock.release()); // observer 2 reply
        assert!(lock.release()); // approver phase concludes -> zero
    }

    #[test]
    #[should_panic(expected = "released past zero")]
    fn releasing_past_zero_panics() {
        let lock = ClientLockCounter::new();
        lock.release();
        lock.release();
    }
}
