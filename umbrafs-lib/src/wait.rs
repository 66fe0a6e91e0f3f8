//! Wait/wake endpoint pairing a condition with a notification
//!
//! State bits live on atomics next to the queue; the queue's lock only
//! brackets the condition re-check so that a wake arriving between the check
//! and the sleep cannot be missed.

use std::sync::{Condvar, Mutex};

pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Block until `cond()` returns true. The condition is evaluated under
    /// the queue lock, so a state change published before `wake_all` is
    /// always observed.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        let mut guard = self.lock.lock().unwrap();
        while !cond() {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Wake every waiter. Must be called after the condition-relevant state
    /// has been published.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_no_missed_wake() {
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = queue.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                queue.wait_until(|| flag.load(Ordering::Acquire));
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        queue.wake_all();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_returns_immediately_when_true() {
        let queue = WaitQueue::new();
        queue.wait_until(|| true);
    }
}
