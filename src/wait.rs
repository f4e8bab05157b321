//! A small wake-queue: threads wait for a predicate over shared atomics,
//! wakers flip the atomics and notify.
//!
//! Notification takes the internal lock so a waiter that has checked its
//! predicate but not yet parked cannot miss the wake-up.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue::default()
    }

    /// Block until `cond()` is true. The predicate is evaluated under the
    /// queue lock.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        let mut guard = self.lock.lock();
        while !cond() {
            self.cond.wait(&mut guard);
        }
    }

    /// Block until `cond()` is true or `timeout` elapses. Returns whether the
    /// predicate held on exit.
    pub fn wait_timeout_until<F: Fn() -> bool>(&self, timeout: Duration, cond: F) -> bool {
        let mut guard = self.lock.lock();
        if cond() {
            return true;
        }
        let _ = self.cond.wait_for(&mut guard, timeout);
        cond()
    }

    /// Wake every waiter so it re-evaluates its predicate.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}
