// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client registry.
//!
//! Tracks the logical consumers of the driver and their retry policy.
//! Handles come from a monotonic counter and are never reissued, so a stale
//! handle can only ever miss.
//!
//! Every callback for a client runs under a [`DeliveryGuard`] taken from
//! that client's entry. Deregistering removes the entry first, so no new
//! guard can be taken, and the caller then waits on the gate for guards
//! already out.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SdError};
use crate::types::{ClientHandle, RetryPolicy};

thread_local! {
    /// Delivery guards held by the current thread.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Callbacks currently running for one client.
#[derive(Debug, Default)]
pub struct DeliveryGate {
    active: Mutex<usize>,
    idle: Condvar,
}

impl DeliveryGate {
    /// Block until no callback of this client is running. Returns at once
    /// when called from inside any callback, since the caller may be the
    /// delivery being waited for.
    pub fn wait_idle(&self) {
        if DELIVERING.with(Cell::get) > 0 {
            return;
        }
        let mut active = self.active.lock();
        while *active > 0 {
            self.idle.wait(&mut active);
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}

/// Held for the duration of one callback.
#[derive(Debug)]
pub struct DeliveryGuard {
    gate: Arc<DeliveryGate>,
}

impl DeliveryGuard {
    fn enter(gate: Arc<DeliveryGate>) -> Self {
        *gate.active.lock() += 1;
        DELIVERING.with(|d| d.set(d.get() + 1));
        Self { gate }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(d.get().saturating_sub(1)));
        let mut active = self.gate.active.lock();
        *active -= 1;
        if *active == 0 {
            self.gate.idle.notify_all();
        }
    }
}

#[derive(Clone, Debug)]
struct ClientEntry {
    policy: RetryPolicy,
    /// Registered by the driver itself (multicast manager).
    internal: bool,
    gate: Arc<DeliveryGate>,
}

/// Concurrent handle -> client table.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<u64, ClientEntry>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client with the given retry policy.
    pub fn register(&self, policy: RetryPolicy) -> Result<ClientHandle> {
        check_policy(&policy)?;
        Ok(self.insert(policy, false))
    }

    /// Register one of the driver's own components.
    pub(crate) fn register_internal(&self, policy: RetryPolicy) -> ClientHandle {
        self.insert(policy, true)
    }

    fn insert(&self, policy: RetryPolicy, internal: bool) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(
            id,
            ClientEntry {
                policy,
                internal,
                gate: Arc::new(DeliveryGate::default()),
            },
        );
        log::debug!(
            "[SD] registered client#{} retries={} timeout={:?}{}",
            id,
            policy.retry_count,
            policy.timeout,
            if internal { " (internal)" } else { "" }
        );
        ClientHandle(id)
    }

    /// Remove a client. Later calls with the handle fail with `NotFound`
    /// and no new delivery for it can start. The returned gate tracks the
    /// deliveries that had already started.
    pub fn deregister(&self, handle: ClientHandle) -> Result<Arc<DeliveryGate>> {
        match self.clients.remove(&handle.0) {
            Some((_, entry)) => {
                log::debug!("[SD] deregistered {}", handle);
                Ok(entry.gate)
            }
            None => Err(SdError::NotFound),
        }
    }

    /// Start a callback for `handle`. `None` once the client is gone.
    #[must_use]
    pub fn begin_delivery(&self, handle: ClientHandle) -> Option<DeliveryGuard> {
        // The shard read lock is held while the guard is counted, so a
        // concurrent deregister either sees the count or wins the race.
        let entry = self.clients.get(&handle.0)?;
        Some(DeliveryGuard::enter(Arc::clone(&entry.gate)))
    }

    pub fn validate(&self, handle: ClientHandle) -> Result<()> {
        if self.clients.contains_key(&handle.0) {
            Ok(())
        } else {
            Err(SdError::NotFound)
        }
    }

    #[must_use]
    pub fn is_live(&self, handle: ClientHandle) -> bool {
        self.clients.contains_key(&handle.0)
    }

    /// True when the handle belongs to a driver component.
    #[must_use]
    pub fn is_internal(&self, handle: ClientHandle) -> bool {
        self.clients
            .get(&handle.0)
            .map(|entry| entry.internal)
            .unwrap_or(false)
    }

    pub fn control_params(&self, handle: ClientHandle) -> Result<RetryPolicy> {
        self.clients
            .get(&handle.0)
            .map(|entry| entry.policy)
            .ok_or(SdError::NotFound)
    }

    /// Change a client's policy. Affects transactions started afterwards.
    pub fn set_control_params(&self, handle: ClientHandle, policy: RetryPolicy) -> Result<()> {
        check_policy(&policy)?;
        let mut entry = self.clients.get_mut(&handle.0).ok_or(SdError::NotFound)?;
        entry.policy = policy;
        Ok(())
    }

    /// Number of registered clients, internal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.timeout.is_zero() {
        return Err(SdError::InvalidParameter("retry timeout must be non-zero".into()));
    }
    Ok(())
}
