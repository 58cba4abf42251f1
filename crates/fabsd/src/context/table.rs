// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transaction table.
//!
//! Every transaction lives in exactly one place: the pending set, the
//! completion queue, or in the hands of the one execution context that
//! claimed it. A claimed record leaves a marker behind so cancellation can
//! flag it; whoever holds the box frees it when it hands it back.
//!
//! All mutation happens under one mutex. Nothing in here calls out of the
//! crate; boxes that must be dropped are returned to the caller so that
//! callbacks captured inside them are dropped after the lock is released.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::transaction::{Transaction, TxKind, TxState};
use crate::config::{RuntimeConfig, TID_SHIFT, TID_SPACE_BITS};
use crate::error::{Result, SdError};
use crate::transport::{Response, ResponseKind};
use crate::types::{ClientHandle, Deadline, PortGuid, Reply, TransactionId};

/// Where a transaction currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Pending,
    InUse,
    Completed,
    Absent,
}

/// Result of matching an inbound message.
#[derive(Debug)]
pub enum Match {
    /// Nothing waiting for it. Carries the reason for logging.
    Discarded(&'static str),
    /// Peer busy; the transaction now sits in `BusyRetryDelay`.
    Busy { tid: TransactionId, retries_left: u32 },
    /// Claimed for processing; must be handed back to the table.
    Claimed(Box<Transaction>),
}

/// What [`ContextTable::cancel_client`] did.
#[derive(Debug, Default)]
pub struct Cancelled {
    /// Removed from the table; drop outside any lock.
    pub removed: Vec<Box<Transaction>>,
    /// Claimed or already completed; freed later without a callback.
    pub flagged: usize,
}

/// Occupancy snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub pending: usize,
    pub in_use: usize,
    pub completed: usize,
    pub ready: usize,
    pub in_flight: usize,
}

enum Record {
    Pending(Box<Transaction>),
    InUse(Claim),
    Completed,
}

struct Claim {
    client: Option<ClientHandle>,
    port: PortGuid,
    self_command: bool,
    destroy_pending: bool,
}

impl Claim {
    fn of(tx: &Transaction) -> Self {
        Self {
            client: tx.client,
            port: tx.port,
            self_command: tx.kind.is_self_command(),
            destroy_pending: false,
        }
    }
}

struct Inner {
    records: HashMap<TransactionId, Record>,
    completed: VecDeque<Box<Transaction>>,
    /// Lazily invalidated: an entry counts only while it equals the pending
    /// transaction's current deadline.
    deadlines: BinaryHeap<Reverse<(Instant, TransactionId)>>,
    /// FIFO of `ReadyToSend` transactions, also lazily invalidated.
    ready: VecDeque<TransactionId>,
    next_tid: u64,
    in_flight: usize,
    closed: bool,
}

impl Inner {
    fn release_slot(&mut self, tx: &mut Transaction) {
        if tx.holds_slot {
            tx.holds_slot = false;
            self.in_flight -= 1;
        }
    }

    /// Only `WaitingForResult` and `BusyRetryDelay` occupy a slot.
    fn settle_slot(&mut self, tx: &mut Transaction) {
        if !matches!(tx.state, TxState::WaitingForResult | TxState::BusyRetryDelay) {
            self.release_slot(tx);
        }
    }

    fn deadline_is_live(&self, instant: Instant, tid: TransactionId) -> bool {
        match self.records.get(&tid) {
            Some(Record::Pending(tx)) => {
                tx.deadline == Some(Deadline::at(instant))
                    && matches!(
                        tx.state,
                        TxState::WaitingForResult | TxState::NotAbleToSend | TxState::BusyRetryDelay
                    )
            }
            _ => false,
        }
    }

    fn ready_is_live(&self, tid: TransactionId) -> bool {
        matches!(self.records.get(&tid), Some(Record::Pending(tx)) if tx.state == TxState::ReadyToSend)
    }

    fn drop_stale_ready(&mut self) {
        while let Some(&tid) = self.ready.front() {
            if self.ready_is_live(tid) {
                break;
            }
            self.ready.pop_front();
        }
    }

    fn park(&mut self, tx: Box<Transaction>) {
        if tx.state == TxState::ReadyToSend {
            self.ready.push_back(tx.tid);
        }
        if let Some(deadline) = tx.deadline {
            if matches!(
                tx.state,
                TxState::WaitingForResult | TxState::NotAbleToSend | TxState::BusyRetryDelay
            ) {
                self.deadlines.push(Reverse((deadline.instant(), tx.tid)));
            }
        }
        self.records.insert(tx.tid, Record::Pending(tx));
    }

    fn claim(&mut self, tid: TransactionId) -> Option<Box<Transaction>> {
        match self.records.remove(&tid) {
            Some(Record::Pending(tx)) => {
                self.records.insert(tid, Record::InUse(Claim::of(&tx)));
                Some(tx)
            }
            Some(other) => {
                self.records.insert(tid, other);
                None
            }
            None => None,
        }
    }

    /// Remove the claim marker of `tid`. Returns whether it was flagged for
    /// destruction; `None` when the record was not claimed at all.
    fn unclaim(&mut self, tid: TransactionId) -> Option<bool> {
        match self.records.remove(&tid) {
            Some(Record::InUse(claim)) => Some(claim.destroy_pending),
            Some(other) => {
                self.records.insert(tid, other);
                None
            }
            None => None,
        }
    }
}

/// Correlation table for outstanding transactions.
pub struct ContextTable {
    inner: Mutex<Inner>,
    config: Arc<RuntimeConfig>,
}

impl ContextTable {
    #[must_use]
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                completed: VecDeque::new(),
                deadlines: BinaryHeap::new(),
                ready: VecDeque::new(),
                next_tid: 1,
                in_flight: 0,
                closed: false,
            }),
            config,
        }
    }

    // ====================================================================
    // Allocation & hand-back
    // ====================================================================

    /// Reserve a fresh transaction id. The caller owns the transaction from
    /// the start (the id is recorded as claimed) and must hand it back with
    /// [`restore`](Self::restore), [`complete`](Self::complete) or
    /// [`retire`](Self::retire).
    pub fn allocate(
        &self,
        client: Option<ClientHandle>,
        port: PortGuid,
        kind: &TxKind,
    ) -> Result<TransactionId> {
        let capacity = self.config.params().max_contexts;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SdError::Shutdown);
        }
        if inner.records.len() >= capacity {
            log::warn!("[CTX] table full ({} records)", capacity);
            return Err(SdError::InsufficientResources);
        }
        let space = 1u64 << TID_SPACE_BITS;
        loop {
            let raw = inner.next_tid;
            inner.next_tid = (inner.next_tid + 1) % space;
            if raw == 0 {
                continue;
            }
            let tid = TransactionId(raw << TID_SHIFT);
            if inner.records.contains_key(&tid) {
                continue;
            }
            inner.records.insert(
                tid,
                Record::InUse(Claim {
                    client,
                    port,
                    self_command: kind.is_self_command(),
                    destroy_pending: false,
                }),
            );
            return Ok(tid);
        }
    }

    /// Put a claimed transaction back in the pending set. Returns the box
    /// when it was cancelled while claimed; the caller drops it.
    #[must_use]
    pub fn restore(&self, mut tx: Box<Transaction>) -> Option<Box<Transaction>> {
        let mut inner = self.inner.lock();
        match inner.unclaim(tx.tid) {
            Some(false) if inner.closed => {
                inner.release_slot(&mut tx);
                tx.state = TxState::QueryComplete;
                tx.outcome = Some(Err(SdError::Shutdown));
                inner.records.insert(tx.tid, Record::Completed);
                inner.completed.push_back(tx);
                None
            }
            Some(false) => {
                inner.settle_slot(&mut tx);
                inner.park(tx);
                None
            }
            Some(true) => {
                inner.release_slot(&mut tx);
                tx.state = TxState::QueryDestroy;
                Some(tx)
            }
            None => {
                log::error!("[CTX] restore of unclaimed {}", tx.tid);
                inner.release_slot(&mut tx);
                Some(tx)
            }
        }
    }

    /// Queue a claimed transaction for delivery. Returns the box when it
    /// was cancelled while claimed.
    #[must_use]
    pub fn complete(&self, mut tx: Box<Transaction>) -> Option<Box<Transaction>> {
        let mut inner = self.inner.lock();
        inner.release_slot(&mut tx);
        match inner.unclaim(tx.tid) {
            Some(false) => {
                tx.state = TxState::QueryComplete;
                inner.records.insert(tx.tid, Record::Completed);
                inner.completed.push_back(tx);
                None
            }
            Some(true) => {
                tx.state = TxState::QueryDestroy;
                Some(tx)
            }
            None => {
                log::error!("[CTX] complete of unclaimed {}", tx.tid);
                Some(tx)
            }
        }
    }

    /// Remove a claimed transaction without delivering anything.
    pub fn retire(&self, mut tx: Box<Transaction>) -> Box<Transaction> {
        let mut inner = self.inner.lock();
        inner.release_slot(&mut tx);
        inner.unclaim(tx.tid);
        tx.state = TxState::QueryDestroy;
        tx
    }

    /// Record a child's terminal result in its batch parent. The parent
    /// moves to the completion queue once every child is in. Returns the
    /// child box for dropping.
    pub fn complete_child(&self, mut child: Box<Transaction>, result: Result<Reply>) -> Box<Transaction> {
        let mut inner = self.inner.lock();
        inner.release_slot(&mut child);
        inner.unclaim(child.tid);
        child.state = TxState::QueryDestroy;
        let TxKind::Child { parent, index } = child.kind else {
            log::error!("[CTX] complete_child on non-child {}", child.tid);
            return child;
        };
        let parent_done = match inner.records.get_mut(&parent) {
            Some(Record::Pending(ptx)) => match &mut ptx.kind {
                TxKind::Batch {
                    remaining, results, ..
                } => {
                    if let Some(slot) = results.get_mut(index) {
                        if slot.is_none() {
                            *slot = Some(result);
                            *remaining = remaining.saturating_sub(1);
                        }
                    }
                    *remaining == 0
                }
                _ => false,
            },
            _ => {
                log::debug!("[CTX] parent {} gone, dropping child {}", parent, child.tid);
                false
            }
        };
        if parent_done {
            if let Some(Record::Pending(mut ptx)) = inner.records.remove(&parent) {
                ptx.state = TxState::QueryComplete;
                inner.records.insert(parent, Record::Completed);
                inner.completed.push_back(ptx);
            }
        }
        child
    }

    // ====================================================================
    // Inbound correlation
    // ====================================================================

    /// Match an inbound message to the transaction awaiting it.
    pub fn find_and_release(&self, response: &Response, now: Instant) -> Match {
        let busy_backoff = self.config.params().busy_backoff;
        let mut inner = self.inner.lock();
        let tx = match inner.records.get_mut(&response.tid) {
            Some(Record::Pending(tx)) => tx,
            Some(_) => return Match::Discarded("transaction not pending"),
            None => return Match::Discarded("unknown transaction"),
        };
        if tx.port != response.port {
            return Match::Discarded("port mismatch");
        }
        if tx.state != TxState::WaitingForResult {
            return Match::Discarded("not awaiting a response");
        }
        if let ResponseKind::Reply { status, .. } = response.kind {
            if status.is_busy() && tx.retries_left > 0 {
                tx.state = TxState::BusyRetryDelay;
                let deadline = Deadline::after(now, busy_backoff);
                tx.deadline = Some(deadline);
                let (tid, retries_left) = (tx.tid, tx.retries_left);
                inner.deadlines.push(Reverse((deadline.instant(), tid)));
                return Match::Busy { tid, retries_left };
            }
        }
        match inner.claim(response.tid) {
            Some(mut tx) => {
                tx.state = TxState::ProcessingResponse;
                Match::Claimed(tx)
            }
            None => Match::Discarded("transaction not pending"),
        }
    }

    /// A send handed to the transport failed after the transaction was
    /// already parked as `WaitingForResult`. `buffer_busy` sends it back to
    /// the ready queue; anything else parks it until its deadline.
    pub fn send_failed(&self, tid: TransactionId, attempt: u32, buffer_busy: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(Record::Pending(mut tx)) = inner.records.remove(&tid) else {
            return false;
        };
        if tx.state != TxState::WaitingForResult || tx.attempt != attempt {
            inner.records.insert(tid, Record::Pending(tx));
            return false;
        }
        inner.release_slot(&mut tx);
        if buffer_busy {
            tx.state = TxState::ReadyToSend;
            tx.deadline = None;
        } else {
            tx.state = TxState::NotAbleToSend;
        }
        inner.park(tx);
        true
    }

    // ====================================================================
    // Aging & backpressure
    // ====================================================================

    /// Claim every transaction whose deadline has passed. The state they
    /// expired in is left untouched. A busy backoff keeps its in-flight
    /// slot for the resend; every other expiry releases it.
    pub fn age(&self, now: Instant) -> Vec<Box<Transaction>> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        while let Some(&Reverse((instant, tid))) = inner.deadlines.peek() {
            if instant > now {
                break;
            }
            inner.deadlines.pop();
            if !inner.deadline_is_live(instant, tid) {
                continue;
            }
            if let Some(mut tx) = inner.claim(tid) {
                if tx.state != TxState::BusyRetryDelay {
                    inner.release_slot(&mut tx);
                }
                expired.push(tx);
            }
        }
        expired
    }

    /// Wait until the earliest live deadline, clamped to the configured
    /// receive-wait bounds.
    pub fn next_wait(&self, now: Instant) -> Duration {
        let params = self.config.params();
        let mut inner = self.inner.lock();
        while let Some(&Reverse((instant, tid))) = inner.deadlines.peek() {
            if inner.deadline_is_live(instant, tid) {
                return params.clamp_wait(instant.saturating_duration_since(now));
            }
            inner.deadlines.pop();
        }
        params.max_receive_wait
    }

    /// Forget an id returned by [`allocate`](Self::allocate) that never got
    /// a transaction.
    pub fn abandon(&self, tid: TransactionId) {
        let mut inner = self.inner.lock();
        if let Some(Record::InUse(_)) = inner.records.get(&tid) {
            inner.records.remove(&tid);
        }
    }

    /// Claim the oldest `ReadyToSend` transaction if a slot is free. The
    /// slot is taken on its behalf.
    pub fn claim_next_ready(&self) -> Option<Box<Transaction>> {
        let ceiling = self.config.params().max_outstanding;
        let mut inner = self.inner.lock();
        if inner.in_flight >= ceiling {
            return None;
        }
        while let Some(tid) = inner.ready.pop_front() {
            if !inner.ready_is_live(tid) {
                continue;
            }
            if let Some(mut tx) = inner.claim(tid) {
                tx.holds_slot = true;
                inner.in_flight += 1;
                return Some(tx);
            }
        }
        None
    }

    /// Take an in-flight slot for a claimed transaction. Fails while at the
    /// ceiling or while older transactions are queued.
    pub fn try_acquire_slot(&self, tx: &mut Transaction) -> bool {
        if tx.holds_slot {
            return true;
        }
        let ceiling = self.config.params().max_outstanding;
        let mut inner = self.inner.lock();
        inner.drop_stale_ready();
        if inner.in_flight >= ceiling || !inner.ready.is_empty() {
            return false;
        }
        tx.holds_slot = true;
        inner.in_flight += 1;
        true
    }

    /// Claim every transaction parked for missing addressing on `port`.
    pub fn claim_parked(&self, port: PortGuid) -> Vec<Box<Transaction>> {
        let mut inner = self.inner.lock();
        let tids: Vec<TransactionId> = inner
            .records
            .iter()
            .filter_map(|(tid, record)| match record {
                Record::Pending(tx) if tx.port == port && tx.state == TxState::NotAbleToSend => {
                    Some(*tid)
                }
                _ => None,
            })
            .collect();
        tids.into_iter().filter_map(|tid| inner.claim(tid)).collect()
    }

    /// True while a driver-issued command for `port` exists.
    #[must_use]
    pub fn has_self_command(&self, port: PortGuid) -> bool {
        self.inner.lock().records.values().any(|record| match record {
            Record::Pending(tx) => tx.port == port && tx.kind.is_self_command(),
            Record::InUse(claim) => claim.port == port && claim.self_command,
            Record::Completed => false,
        })
    }

    // ====================================================================
    // Cancellation & delivery
    // ====================================================================

    /// Detach every transaction of `client`. Pending ones are removed;
    /// claimed ones are flagged and freed by their holder; completed ones
    /// are delivered to nobody. Idempotent.
    pub fn cancel_client(&self, client: ClientHandle) -> Cancelled {
        let mut inner = self.inner.lock();
        let mut out = Cancelled::default();
        let tids: Vec<TransactionId> = inner
            .records
            .iter()
            .filter_map(|(tid, record)| match record {
                Record::Pending(tx) if tx.client == Some(client) => Some(*tid),
                Record::InUse(claim) if claim.client == Some(client) && !claim.destroy_pending => {
                    Some(*tid)
                }
                _ => None,
            })
            .collect();
        for tid in tids {
            match inner.records.remove(&tid) {
                Some(Record::Pending(mut tx)) => {
                    inner.release_slot(&mut tx);
                    tx.state = TxState::QueryDestroy;
                    tx.client = None;
                    out.removed.push(tx);
                }
                Some(Record::InUse(mut claim)) => {
                    claim.destroy_pending = true;
                    claim.client = None;
                    inner.records.insert(tid, Record::InUse(claim));
                    out.flagged += 1;
                }
                Some(other) => {
                    inner.records.insert(tid, other);
                }
                None => {}
            }
        }
        for tx in inner.completed.iter_mut() {
            if tx.client == Some(client) {
                tx.client = None;
                tx.state = TxState::QueryDestroy;
                out.flagged += 1;
            }
        }
        out
    }

    /// Drain the completion queue.
    pub fn take_completions(&self) -> Vec<Box<Transaction>> {
        let mut inner = self.inner.lock();
        let drained: Vec<Box<Transaction>> = inner.completed.drain(..).collect();
        for tx in &drained {
            inner.records.remove(&tx.tid);
        }
        drained
    }

    /// Close the table and take every pending and completed transaction.
    /// Claimed ones are completed with `Shutdown` when handed back.
    pub fn drain_for_shutdown(&self) -> Vec<Box<Transaction>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let tids: Vec<TransactionId> = inner
            .records
            .iter()
            .filter_map(|(tid, record)| matches!(record, Record::Pending(_)).then_some(*tid))
            .collect();
        let mut drained = Vec::with_capacity(tids.len() + inner.completed.len());
        for tid in tids {
            if let Some(Record::Pending(mut tx)) = inner.records.remove(&tid) {
                inner.release_slot(&mut tx);
                drained.push(tx);
            }
        }
        let completed: Vec<Box<Transaction>> = inner.completed.drain(..).collect();
        for tx in completed {
            inner.records.remove(&tx.tid);
            drained.push(tx);
        }
        inner.deadlines.clear();
        inner.ready.clear();
        drained
    }

    // ====================================================================
    // Introspection
    // ====================================================================

    #[must_use]
    pub fn location(&self, tid: TransactionId) -> Location {
        match self.inner.lock().records.get(&tid) {
            Some(Record::Pending(_)) => Location::Pending,
            Some(Record::InUse(_)) => Location::InUse,
            Some(Record::Completed) => Location::Completed,
            None => Location::Absent,
        }
    }

    /// State of a pending transaction.
    #[must_use]
    pub fn state_of(&self, tid: TransactionId) -> Option<TxState> {
        match self.inner.lock().records.get(&tid) {
            Some(Record::Pending(tx)) => Some(tx.state),
            _ => None,
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        let inner = self.inner.lock();
        let mut stats = TableStats {
            completed: inner.completed.len(),
            in_flight: inner.in_flight,
            ..TableStats::default()
        };
        for record in inner.records.values() {
            match record {
                Record::Pending(tx) => {
                    stats.pending += 1;
                    if tx.state == TxState::ReadyToSend {
                        stats.ready += 1;
                    }
                }
                Record::InUse(_) => stats.in_use += 1,
                Record::Completed => {}
            }
        }
        stats
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
