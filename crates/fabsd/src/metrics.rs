// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Driver counters.
//!
//! Relaxed atomics only; a snapshot is a best-effort view and individual
//! counters may be read at slightly different instants.

use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction engine counters.
#[derive(Debug, Default)]
pub struct SdMetrics {
    /// Datagrams handed to the transport (first sends and retries).
    sent: AtomicU64,
    /// Re-sends after a timeout, busy backoff or send failure.
    retries: AtomicU64,
    /// Attempts that expired without a response.
    timeouts: AtomicU64,
    /// Responses carrying a BUSY status.
    busy: AtomicU64,
    /// Responses matching no pending transaction.
    discarded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    /// High-water mark of the in-flight counter.
    max_in_flight: AtomicU64,
}

/// Point-in-time copy of [`SdMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub busy: u64,
    pub discarded: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub max_in_flight: u64,
}

impl SdMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, count: u64) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    /// Raise the in-flight high-water mark.
    ///
    /// Compare-exchange loop so concurrent updates never lower it.
    pub fn observe_in_flight(&self, in_flight: usize) {
        let value = in_flight as u64;
        let mut current = self.max_in_flight.load(Ordering::Relaxed);
        while value > current {
            match self.max_in_flight.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }
}
