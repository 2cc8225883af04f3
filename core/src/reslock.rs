//! Block-then-drain resource latch.
//!
//! A `ResLock` counts in-flight operations on a resource. Blocking the lock
//! makes new guards fail while the owner waits for the counter to drain to
//! zero, acts on the resource exclusively, then unblocks. Used to pause a
//! table for compaction or drop, and the whole page cache for a journal.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct ResLockState {
    blocked: bool,
    counter: u16,
    blocked_since: Option<Instant>,
    blocked_time: Duration,
}

pub struct ResLock {
    state: Mutex<ResLockState>,
    cond: Condvar,
}

impl ResLock {
    pub fn new(starts_blocked: bool) -> Self {
        Self {
            state: Mutex::new(ResLockState {
                blocked: starts_blocked,
                counter: 0,
                blocked_since: if starts_blocked { Some(Instant::now()) } else { None },
                blocked_time: Duration::ZERO,
            }),
            cond: Condvar::new(),
        }
    }

    /// Registers an operation. Fails if the resource is blocked.
    pub fn avail_guard_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.blocked {
            return false;
        }
        state.counter += 1;
        true
    }

    /// Ends an operation previously admitted by `avail_guard_begin`.
    pub fn avail_guard_end(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.counter > 0, "unbalanced avail guard");
        state.counter -= 1;
        if state.counter == 0 {
            self.cond.notify_all();
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().unwrap().blocked
    }

    /// Blocks the resource: subsequent guards fail until `unblock`.
    pub fn block(&self) {
        let mut state = self.state.lock().unwrap();
        state.blocked = true;
        state.blocked_since = Some(Instant::now());
    }

    /// Unblocks the resource and publishes the elapsed blocked time.
    pub fn unblock(&self) {
        let mut state = self.state.lock().unwrap();
        state.blocked = false;
        if let Some(since) = state.blocked_since.take() {
            state.blocked_time = since.elapsed();
        }
        self.cond.notify_all();
    }

    /// Waits until every in-flight operation has drained.
    pub fn wait_unused(&self) {
        let mut state = self.state.lock().unwrap();
        while state.counter > 0 {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn counter(&self) -> u16 {
        self.state.lock().unwrap().counter
    }

    /// Duration of the most recent blocked interval.
    pub fn blocked_time(&self) -> Duration {
        self.state.lock().unwrap().blocked_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guards_count_and_fail_when_blocked() {
        let lock = ResLock::new(false);
        assert!(lock.avail_guard_begin());
        assert!(lock.avail_guard_begin());
        assert_eq!(lock.counter(), 2);

        lock.block();
        assert!(!lock.avail_guard_begin());
        assert_eq!(lock.counter(), 2);

        lock.avail_guard_end();
        lock.avail_guard_end();
        lock.unblock();
        assert!(lock.avail_guard_begin());
        lock.avail_guard_end();
    }

    #[test]
    fn starts_blocked() {
        let lock = ResLock::new(true);
        assert!(!lock.avail_guard_begin());
        lock.unblock();
        assert!(lock.avail_guard_begin());
        lock.avail_guard_end();
    }

    #[test]
    fn wait_unused_drains_in_flight_guards() {
        let lock = Arc::new(ResLock::new(false));
        for _ in 0..3 {
            assert!(lock.avail_guard_begin());
        }
        lock.block();

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    lock.avail_guard_end();
                })
            })
            .collect();

        lock.wait_unused();
        assert_eq!(lock.counter(), 0);
        lock.unblock();
        assert!(lock.blocked_time() >= Duration::from_millis(20));

        for w in workers {
            w.join().unwrap();
        }
    }
}
