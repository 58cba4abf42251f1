// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service-thread wakeup.
//!
//! The receive path queues completions and multicast work under its own
//! locks, then pokes the service thread here. A poke sets an atomic flag;
//! the condvar is only touched when the service thread is actually asleep.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Flag + condvar wakeup for the service thread.
#[derive(Debug)]
pub struct WakeNotifier {
    work_ready: AtomicBool,
    stopping: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            work_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signal that completions or timer work are queued.
    #[inline]
    pub fn notify(&self) {
        self.work_ready.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Consume a pending signal without blocking.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.work_ready.swap(false, Ordering::Acquire)
    }

    /// Ask the service thread to exit; wakes it if asleep.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _guard = self.sleeping.lock();
        self.condvar.notify_all();
    }

    #[inline]
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Sleep until notified, stopped, or `timeout` elapses. Returns true
    /// when woken by a signal.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.check_and_clear() {
            return true;
        }
        let mut sleeping = self.sleeping.lock();
        if self.check_and_clear() || self.is_stopping() {
            return !self.is_stopping();
        }
        *sleeping = true;
        let _ = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;
        self.check_and_clear()
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pending_signal_returns_immediately() {
        let wake = WakeNotifier::new();
        wake.notify();
        let start = Instant::now();
        assert!(wake.wait_timeout(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!wake.check_and_clear());
    }

    #[test]
    fn test_notify_wakes_sleeper() {
        let wake = Arc::new(WakeNotifier::new());
        let w = Arc::clone(&wake);
        let poker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            w.notify();
        });
        assert!(wake.wait_timeout(Duration::from_secs(2)));
        poker.join().unwrap();
    }

    #[test]
    fn test_timeout_without_signal() {
        let wake = WakeNotifier::new();
        let start = Instant::now();
        assert!(!wake.wait_timeout(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn test_stop_interrupts_wait() {
        let wake = Arc::new(WakeNotifier::new());
        let w = Arc::clone(&wake);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            w.stop();
        });
        let start = Instant::now();
        wake.wait_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(wake.is_stopping());
        stopper.join().unwrap();
    }
}
