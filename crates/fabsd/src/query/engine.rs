// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Query engine: submission, response processing, aging and delivery.
//!
//! Execution contexts:
//! - client threads call [`QueryEngine::submit`] / [`QueryEngine::submit_batch`]
//! - the receive thread calls [`QueryEngine::on_response`] and
//!   [`QueryEngine::on_timer`]
//! - the service thread calls [`QueryEngine::process_completions`]
//!
//! None of them holds the table lock while talking to the transport or to
//! client code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Disposition, Submitted};
use crate::config::{RuntimeConfig, CLASS_PORT_INFO_LEN, SEGMENT_PAYLOAD_SIZE};
use crate::context::{
    BatchCallback, ContextTable, Location, Match, ReplyCallback, TableStats, Transaction, TxKind,
    TxState,
};
use crate::error::{Result, SdError};
use crate::metrics::SdMetrics;
use crate::port::{Addressing, CaPortCache, ClassPortInfo};
use crate::registry::ClientRegistry;
use crate::transport::{Response, ResponseKind, Transport};
use crate::types::{
    attr, ClientHandle, MadStatus, Method, PortGuid, Reply, Request, TransactionId,
};
use crate::wake::WakeNotifier;

/// Outcome of one handoff to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    /// Transport out of buffers; transaction is queued again.
    NoBuffer,
    /// Parked until its deadline, or cancelled meanwhile.
    Parked,
}

/// Correlates requests with responses for every local port.
pub struct QueryEngine {
    table: ContextTable,
    ports: Arc<CaPortCache>,
    clients: Arc<ClientRegistry>,
    transport: Arc<dyn Transport>,
    config: Arc<RuntimeConfig>,
    metrics: Arc<SdMetrics>,
    wake: Arc<WakeNotifier>,
}

impl QueryEngine {
    #[must_use]
    pub fn new(
        ports: Arc<CaPortCache>,
        clients: Arc<ClientRegistry>,
        transport: Arc<dyn Transport>,
        config: Arc<RuntimeConfig>,
        metrics: Arc<SdMetrics>,
        wake: Arc<WakeNotifier>,
    ) -> Self {
        Self {
            table: ContextTable::new(Arc::clone(&config)),
            ports,
            clients,
            transport,
            config,
            metrics,
            wake,
        }
    }

    // ====================================================================
    // Submission
    // ====================================================================

    /// Submit one request on behalf of `client`. The callback runs exactly
    /// once from [`process_completions`](Self::process_completions), unless
    /// the client deregisters first.
    pub fn submit(
        &self,
        client: ClientHandle,
        port: PortGuid,
        request: Request,
        callback: ReplyCallback,
    ) -> Result<Submitted> {
        let policy = self.clients.control_params(client)?;
        if !self.ports.is_known(port) {
            return Err(SdError::NotFound);
        }
        let kind = TxKind::User(Some(callback));
        let tid = self.table.allocate(Some(client), port, &kind)?;
        let tx = Box::new(Transaction::new(tid, port, Some(client), kind, request, policy));
        log::trace!("[SD] {} submitted {} on {}", client, tid, port);
        let disposition = self.dispatch(tx, Instant::now());
        Ok(Submitted { tid, disposition })
    }

    /// Submit several requests as one unit. The callback receives one result
    /// per request, in order, once every request is terminal. A failed
    /// request does not fail the batch.
    pub fn submit_batch(
        &self,
        client: ClientHandle,
        port: PortGuid,
        requests: Vec<Request>,
        callback: BatchCallback,
    ) -> Result<TransactionId> {
        let policy = self.clients.control_params(client)?;
        if !self.ports.is_known(port) {
            return Err(SdError::NotFound);
        }
        let Some(first) = requests.first().cloned() else {
            return Err(SdError::InvalidParameter("empty batch".into()));
        };
        let count = requests.len();
        let parent_kind = TxKind::Batch {
            callback: Some(callback),
            remaining: count,
            results: (0..count).map(|_| None).collect(),
        };
        let parent_tid = self.table.allocate(Some(client), port, &parent_kind)?;

        // Reserve every id up front so the batch is all-or-nothing.
        let mut children = Vec::with_capacity(count);
        for (index, request) in requests.into_iter().enumerate() {
            let kind = TxKind::Child {
                parent: parent_tid,
                index,
            };
            match self.table.allocate(Some(client), port, &kind) {
                Ok(tid) => children.push(Box::new(Transaction::new(
                    tid,
                    port,
                    Some(client),
                    kind,
                    request,
                    policy,
                ))),
                Err(e) => {
                    for child in &children {
                        self.table.abandon(child.tid);
                    }
                    self.table.abandon(parent_tid);
                    return Err(e);
                }
            }
        }

        // The parent never goes on the wire; it carries the first request
        // only for diagnostics.
        let mut parent = Box::new(Transaction::new(
            parent_tid,
            port,
            Some(client),
            parent_kind,
            first,
            policy,
        ));
        parent.state = TxState::WaitingForChildren;
        if !self.hand_back(parent) {
            for child in &children {
                self.table.abandon(child.tid);
            }
            return Err(SdError::InvalidState("batch cancelled during submit".into()));
        }
        log::debug!("[SD] {} batch {} with {} requests", client, parent_tid, count);

        let now = Instant::now();
        for child in children {
            self.dispatch(child, now);
        }
        Ok(parent_tid)
    }

    /// Learn the administrator's redirection for `port` if it is valid, not
    /// yet initialized and no learn is already in flight.
    pub fn learn_class_port_info(&self, port: PortGuid) -> Result<Option<TransactionId>> {
        let entry = self.ports.get(port).ok_or(SdError::NotFound)?;
        if !entry.valid || entry.initialized || self.table.has_self_command(port) {
            return Ok(None);
        }
        let kind = TxKind::ClassPortInfo;
        let tid = self.table.allocate(None, port, &kind)?;
        let request = Request::new(
            Method::Get,
            attr::CLASS_PORT_INFO,
            vec![0u8; CLASS_PORT_INFO_LEN],
        );
        let policy = self.config.params().default_policy;
        let tx = Box::new(Transaction::new(tid, port, None, kind, request, policy));
        log::debug!("[SD] learning class-port-info on {} ({})", port, tid);
        self.dispatch(tx, Instant::now());
        Ok(Some(tid))
    }

    // ====================================================================
    // Send path
    // ====================================================================

    fn addressing(&self, tx: &Transaction) -> Result<Addressing> {
        if tx.kind.is_self_command() {
            self.ports.default_addressing_for(tx.port)
        } else {
            self.ports.addressing_for(tx.port)
        }
    }

    /// Route a claimed transaction: send it, queue it behind the ceiling,
    /// or park it until addressing shows up.
    fn dispatch(&self, mut tx: Box<Transaction>, now: Instant) -> Disposition {
        let addressing = match self.addressing(&tx) {
            Ok(addressing) => addressing,
            Err(e) => {
                log::debug!("[SD] {} parked on {}: {}", tx.tid, tx.port, e);
                tx.state = TxState::NotAbleToSend;
                tx.arm(now);
                self.hand_back(tx);
                return Disposition::AddressingUnavailable;
            }
        };
        if !self.table.try_acquire_slot(&mut tx) {
            tx.state = TxState::ReadyToSend;
            tx.deadline = None;
            log::trace!("[SD] {} queued behind the ceiling", tx.tid);
            self.hand_back(tx);
            return Disposition::Queued;
        }
        match self.transmit(tx, addressing, now) {
            SendOutcome::Sent => Disposition::Sent,
            SendOutcome::NoBuffer => Disposition::Queued,
            SendOutcome::Parked => Disposition::AddressingUnavailable,
        }
    }

    /// Put a slot holder on the wire. The transaction is parked as
    /// `WaitingForResult` before the transport sees it, so a fast reply
    /// always finds it.
    fn transmit(&self, mut tx: Box<Transaction>, addressing: Addressing, now: Instant) -> SendOutcome {
        tx.state = TxState::WaitingForResult;
        tx.attempt = tx.attempt.wrapping_add(1);
        tx.sent_at = Some(now);
        tx.arm(now);
        let (tid, port, attempt) = (tx.tid, tx.port, tx.attempt);
        let datagram = tx.datagram();
        if !self.hand_back(tx) {
            return SendOutcome::Parked;
        }

        self.metrics.record_sent();
        match self.transport.send(port, &addressing, &datagram) {
            Ok(()) => {
                log::trace!("[SD] sent {} attempt {} on {}", tid, attempt, port);
                self.metrics.observe_in_flight(self.table.in_flight());
                SendOutcome::Sent
            }
            Err(e) => {
                let no_buffer = matches!(e, SdError::Busy | SdError::InsufficientResources);
                log::debug!("[SD] send of {} on {} failed: {}", tid, port, e);
                self.table.send_failed(tid, attempt, no_buffer);
                if no_buffer {
                    SendOutcome::NoBuffer
                } else {
                    SendOutcome::Parked
                }
            }
        }
    }

    /// Send queued transactions in FIFO order while slots are free.
    fn send_next_outstanding(&self, now: Instant) {
        while let Some(mut tx) = self.table.claim_next_ready() {
            match self.addressing(&tx) {
                Ok(addressing) => {
                    if self.transmit(tx, addressing, now) == SendOutcome::NoBuffer {
                        break;
                    }
                }
                Err(_) => {
                    tx.state = TxState::NotAbleToSend;
                    tx.arm(now);
                    self.hand_back(tx);
                }
            }
        }
    }

    /// Return a claimed transaction to the table. False when it had been
    /// cancelled meanwhile and was freed.
    fn hand_back(&self, tx: Box<Transaction>) -> bool {
        match self.table.restore(tx) {
            None => true,
            Some(dead) => {
                log::debug!("[SD] {} freed after cancellation", dead.tid);
                self.metrics.record_cancelled(1);
                false
            }
        }
    }

    /// Resend every transaction parked for addressing on `port`. Retries
    /// are not consumed.
    pub fn kick_port(&self, port: PortGuid) -> usize {
        let now = Instant::now();
        let parked = self.table.claim_parked(port);
        let count = parked.len();
        for mut tx in parked {
            tx.reassembly.reset();
            self.dispatch(tx, now);
        }
        if count > 0 {
            log::debug!("[SD] kicked {} parked transactions on {}", count, port);
        }
        self.send_next_outstanding(now);
        count
    }

    // ====================================================================
    // Receive path
    // ====================================================================

    /// Process one inbound message.
    pub fn on_response(&self, response: Response, now: Instant) {
        match self.table.find_and_release(&response, now) {
            Match::Discarded(reason) => {
                self.metrics.record_discarded();
                log::warn!(
                    "[SD] discarded response {} on {}: {}",
                    response.tid,
                    response.port,
                    reason
                );
            }
            Match::Busy { tid, retries_left } => {
                self.metrics.record_busy();
                log::debug!("[SD] {} busy, {} retries left", tid, retries_left);
            }
            Match::Claimed(tx) => self.process_claimed(tx, response, now),
        }
    }

    fn process_claimed(&self, mut tx: Box<Transaction>, response: Response, now: Instant) {
        let (status, segment) = match response.kind {
            ResponseKind::SendError => {
                log::debug!("[SD] transport reported send error for {}", tx.tid);
                tx.state = TxState::NotAbleToSend;
                tx.reassembly.reset();
                self.hand_back(tx);
                self.send_next_outstanding(now);
                return;
            }
            ResponseKind::Reply { status, segment } => (status, segment),
        };

        let result = match segment {
            Some(segment) if status.is_success() => {
                let total_limit = self.config.params().max_response_bytes;
                match tx.reassembly.push(
                    segment,
                    &response.payload,
                    SEGMENT_PAYLOAD_SIZE,
                    total_limit,
                ) {
                    Ok(None) => {
                        // More parts to come: keep the slot, refresh the deadline.
                        tx.state = TxState::WaitingForResult;
                        tx.arm(now);
                        self.hand_back(tx);
                        return;
                    }
                    Ok(Some(payload)) => Ok(Reply { status, payload }),
                    Err(e) => {
                        log::warn!("[SD] {} reassembly failed: {}", tx.tid, e);
                        Err(e)
                    }
                }
            }
            _ => classify(tx.request.method, status, response.payload),
        };
        self.finish(tx, result);
        self.send_next_outstanding(now);
    }

    /// Record a terminal result according to who the transaction reports to.
    fn finish(&self, mut tx: Box<Transaction>, result: Result<Reply>) {
        match tx.kind {
            TxKind::ClassPortInfo => {
                match result.and_then(|reply| ClassPortInfo::decode(&reply.payload)) {
                    Ok(info) => {
                        if let Err(e) = self.ports.apply_class_port_info(tx.port, &info) {
                            log::debug!("[SD] class-port-info for vanished {}: {}", tx.port, e);
                        }
                    }
                    Err(e) => log::warn!("[SD] class-port-info on {} failed: {}", tx.port, e),
                }
                drop(self.table.retire(tx));
            }
            TxKind::Child { .. } => {
                self.record_outcome(&result);
                drop(self.table.complete_child(tx, result));
                self.wake.notify();
            }
            TxKind::User(_) | TxKind::Batch { .. } => {
                self.record_outcome(&result);
                tx.outcome = Some(result);
                match self.table.complete(tx) {
                    None => self.wake.notify(),
                    Some(dead) => {
                        log::debug!("[SD] {} finished after cancellation", dead.tid);
                        self.metrics.record_cancelled(1);
                    }
                }
            }
        }
    }

    fn record_outcome(&self, result: &Result<Reply>) {
        if result.is_ok() {
            self.metrics.record_completed();
        } else {
            self.metrics.record_failed();
        }
    }

    // ====================================================================
    // Aging
    // ====================================================================

    /// Retry or fail every transaction whose deadline passed, push queued
    /// work, and return how long the receive loop may block.
    pub fn on_timer(&self, now: Instant) -> Duration {
        for tx in self.table.age(now) {
            self.expire(tx, now);
        }
        self.send_next_outstanding(now);
        self.table.next_wait(now)
    }

    fn expire(&self, mut tx: Box<Transaction>, now: Instant) {
        match tx.state {
            TxState::BusyRetryDelay => {
                tx.retries_left = tx.retries_left.saturating_sub(1);
                self.metrics.record_retry();
                log::debug!("[SD] {} busy backoff over, resending", tx.tid);
                self.dispatch(tx, now);
            }
            TxState::WaitingForResult | TxState::NotAbleToSend => {
                if tx.retries_left > 0 {
                    tx.retries_left -= 1;
                    tx.reassembly.reset();
                    self.metrics.record_retry();
                    log::debug!(
                        "[SD] {} timed out in {}, {} retries left",
                        tx.tid,
                        tx.state,
                        tx.retries_left
                    );
                    self.dispatch(tx, now);
                } else {
                    self.metrics.record_timeout();
                    if tx.kind.is_self_command() {
                        log::debug!("[SD] class-port-info on {} gave up", tx.port);
                        drop(self.table.retire(tx));
                    } else {
                        log::warn!(
                            "[SD] {} on {} timed out after {} attempts",
                            tx.tid,
                            tx.port,
                            tx.policy.max_attempts()
                        );
                        self.finish(tx, Err(SdError::Timeout));
                    }
                }
            }
            other => {
                log::error!("[SD] {} aged in unexpected state {}", tx.tid, other);
                self.hand_back(tx);
            }
        }
    }

    // ====================================================================
    // Cancellation & delivery
    // ====================================================================

    /// Cancel everything `client` has outstanding. Idempotent. Returns the
    /// number of transactions affected.
    pub fn cancel_all(&self, client: ClientHandle) -> usize {
        let cancelled = self.table.cancel_client(client);
        let removed = cancelled.removed.len();
        self.metrics.record_cancelled(removed as u64);
        // Callbacks captured in the removed boxes drop here, outside the lock.
        drop(cancelled.removed);
        if removed + cancelled.flagged > 0 {
            log::debug!(
                "[SD] cancelled {} transactions of {} ({} in use)",
                removed + cancelled.flagged,
                client,
                cancelled.flagged
            );
            self.send_next_outstanding(Instant::now());
        }
        removed + cancelled.flagged
    }

    /// Deliver queued completions to their clients. Returns how many
    /// callbacks ran.
    pub fn process_completions(&self) -> usize {
        let mut delivered = 0;
        for tx in self.table.take_completions() {
            if self.deliver(tx) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&self, mut tx: Box<Transaction>) -> bool {
        if tx.state == TxState::QueryDestroy {
            return false;
        }
        let Some(client) = tx.client else {
            return false;
        };
        let Some(_delivery) = self.clients.begin_delivery(client) else {
            log::debug!("[SD] dropping result of {} for departed {}", tx.tid, client);
            return false;
        };
        let outcome = tx.outcome.take();
        match &mut tx.kind {
            TxKind::User(callback) => match callback.take() {
                Some(callback) => {
                    callback(outcome.unwrap_or_else(|| {
                        Err(SdError::InvalidState("completed without outcome".into()))
                    }));
                    true
                }
                None => false,
            },
            TxKind::Batch {
                callback, results, ..
            } => match callback.take() {
                Some(callback) => {
                    match outcome {
                        Some(Err(e)) => callback(Err(e)),
                        _ => callback(Ok(results
                            .drain(..)
                            .map(|r| {
                                r.unwrap_or_else(|| {
                                    Err(SdError::InvalidState("missing batch result".into()))
                                })
                            })
                            .collect())),
                    }
                    true
                }
                None => false,
            },
            TxKind::Child { .. } | TxKind::ClassPortInfo => false,
        }
    }

    /// Fail everything with `Shutdown` and refuse new work.
    pub fn shutdown(&self) -> usize {
        let drained = self.table.drain_for_shutdown();
        let mut delivered = 0;
        for mut tx in drained {
            if tx.state != TxState::QueryComplete {
                tx.outcome = Some(Err(SdError::Shutdown));
            }
            if self.deliver(tx) {
                delivered += 1;
            }
        }
        log::info!("[SD] shut down, {} transactions failed over", delivered);
        delivered
    }

    // ====================================================================
    // Introspection
    // ====================================================================

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table.in_flight()
    }

    #[must_use]
    pub fn location(&self, tid: TransactionId) -> Location {
        self.table.location(tid)
    }

    /// State of a transaction sitting in the pending set.
    #[must_use]
    pub fn state_of(&self, tid: TransactionId) -> Option<TxState> {
        self.table.state_of(tid)
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    #[must_use]
    pub fn metrics(&self) -> &SdMetrics {
        &self.metrics
    }
}

/// Map a final status to the client-visible result.
fn classify(method: Method, status: MadStatus, payload: Vec<u8>) -> Result<Reply> {
    if status.is_success() || (status == MadStatus::NO_RECORDS && method.is_query()) {
        Ok(Reply { status, payload })
    } else if status.is_busy() {
        Err(SdError::Busy)
    } else {
        Err(SdError::Rejected(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SdParams;
    use crate::port::PortAttributes;
    use crate::transport::{LoopbackTransport, Segment};
    use crate::types::{Lid, RetryPolicy};
    use parking_lot::Mutex;

    const PORT: PortGuid = PortGuid(0x0002_c903_0000_0001);

    struct Fixture {
        engine: QueryEngine,
        transport: Arc<LoopbackTransport>,
        ports: Arc<CaPortCache>,
        clients: Arc<ClientRegistry>,
    }

    fn attrs(base_lid: u16) -> PortAttributes {
        PortAttributes {
            ca_guid: 0x0002_c903_0000_0000,
            subnet_prefix: 0xfe80_0000_0000_0000,
            base_lid: Lid(base_lid),
            sm_lid: Lid(1),
            sm_sl: 0,
            static_rate: 0,
            pkey_index: 0,
            active: true,
        }
    }

    fn fixture(max_outstanding: usize) -> Fixture {
        let mut params = SdParams::new();
        params.max_outstanding = max_outstanding;
        params.busy_backoff = Duration::from_millis(20);
        let config = Arc::new(RuntimeConfig::new(params).unwrap());
        let ports = Arc::new(CaPortCache::new());
        ports.update(PORT, &attrs(5));
        let clients = Arc::new(ClientRegistry::new());
        let transport = Arc::new(LoopbackTransport::new());
        let engine = QueryEngine::new(
            Arc::clone(&ports),
            Arc::clone(&clients),
            transport.clone(),
            config,
            Arc::new(SdMetrics::new()),
            Arc::new(WakeNotifier::new()),
        );
        Fixture {
            engine,
            transport,
            ports,
            clients,
        }
    }

    type Sink = Arc<Mutex<Vec<Result<Reply>>>>;

    fn sink() -> (Sink, ReplyCallback) {
        let results: Sink = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&results);
        (results, Box::new(move |res| r.lock().push(res)))
    }

    fn policy(retries: u32, ms: u64) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(ms))
    }

    fn get() -> Request {
        Request::new(Method::Get, attr::NODE_RECORD, vec![0; 8])
    }

    #[test]
    fn test_submit_and_complete() {
        let f = fixture(4);
        let client = f.clients.register(policy(1, 100)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(sub.disposition, Disposition::Sent);

        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addressing.lid, Lid(1));
        f.engine
            .on_response(sent[0].reply(MadStatus::SUCCESS, vec![42]), Instant::now());
        assert_eq!(f.engine.in_flight(), 0);
        assert_eq!(f.engine.location(sub.tid), Location::Completed);

        assert_eq!(f.engine.process_completions(), 1);
        let got = results.lock();
        assert_eq!(got[0].as_ref().unwrap().payload, vec![42]);
    }

    #[test]
    fn test_no_records_is_success_for_queries_only() {
        assert!(classify(Method::GetTable, MadStatus::NO_RECORDS, vec![]).is_ok());
        assert!(matches!(
            classify(Method::Set, MadStatus::NO_RECORDS, vec![]),
            Err(SdError::Rejected(MadStatus::NO_RECORDS))
        ));
        assert!(matches!(
            classify(Method::Get, MadStatus::BUSY, vec![]),
            Err(SdError::Busy)
        ));
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let f = fixture(4);
        let client = f.clients.register(policy(2, 10)).unwrap();
        let (results, cb) = sink();
        f.engine.submit(client, PORT, get(), cb).unwrap();

        let mut now = Instant::now();
        for _ in 0..3 {
            now += Duration::from_millis(11);
            f.engine.on_timer(now);
        }
        assert_eq!(f.transport.take_sent().len(), 3, "first send plus two retries");
        f.engine.process_completions();
        assert!(matches!(results.lock()[0], Err(SdError::Timeout)));
        let m = f.engine.metrics().snapshot();
        assert_eq!((m.retries, m.timeouts, m.failed), (2, 1, 1));
    }

    #[test]
    fn test_busy_backoff_consumes_one_retry() {
        let f = fixture(4);
        let client = f.clients.register(policy(1, 1000)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        let start = Instant::now();

        let first = f.transport.take_sent().remove(0);
        f.engine.on_response(first.reply(MadStatus::BUSY, vec![]), start);
        assert_eq!(f.engine.state_of(sub.tid), Some(TxState::BusyRetryDelay));
        assert_eq!(f.engine.in_flight(), 1);

        f.engine.on_timer(start + Duration::from_millis(25));
        let second = f.transport.take_sent().remove(0);
        assert_eq!(second.datagram.tid, sub.tid);

        // No retries left: busy is now terminal.
        f.engine.on_response(second.reply(MadStatus::BUSY, vec![]), start);
        f.engine.process_completions();
        assert!(matches!(results.lock()[0], Err(SdError::Busy)));
    }

    #[test]
    fn test_busy_resend_keeps_its_slot_ahead_of_backlog() {
        let f = fixture(1);
        let client = f.clients.register(policy(2, 1000)).unwrap();
        let (_, cb_a) = sink();
        let (_, cb_b) = sink();
        let a = f.engine.submit(client, PORT, get(), cb_a).unwrap();
        let b = f.engine.submit(client, PORT, get(), cb_b).unwrap();
        assert_eq!(b.disposition, Disposition::Queued);
        let start = Instant::now();

        let first = f.transport.take_sent().remove(0);
        assert_eq!(first.datagram.tid, a.tid);
        f.engine.on_response(first.reply(MadStatus::BUSY, vec![]), start);
        f.engine.on_timer(start + Duration::from_millis(25));

        let resent = f.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].datagram.tid, a.tid);
        assert_eq!(f.engine.state_of(a.tid), Some(TxState::WaitingForResult));
        assert_eq!(f.engine.state_of(b.tid), Some(TxState::ReadyToSend));
        assert_eq!(f.engine.in_flight(), 1);

        f.engine
            .on_response(resent[0].reply(MadStatus::SUCCESS, vec![]), start);
        let next = f.transport.take_sent();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].datagram.tid, b.tid);
    }

    #[test]
    fn test_ceiling_queues_and_drains() {
        let f = fixture(2);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        let mut subs = Vec::new();
        for _ in 0..5 {
            let (_, cb) = sink();
            subs.push(f.engine.submit(client, PORT, get(), cb).unwrap());
        }
        let dispositions: Vec<_> = subs.iter().map(|s| s.disposition).collect();
        assert_eq!(&dispositions[..2], &[Disposition::Sent, Disposition::Sent]);
        assert!(dispositions[2..].iter().all(|d| *d == Disposition::Queued));
        assert_eq!(f.engine.in_flight(), 2);

        let sent = f.transport.take_sent();
        f.engine
            .on_response(sent[0].reply(MadStatus::SUCCESS, vec![]), Instant::now());
        let next = f.transport.take_sent();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].datagram.tid, subs[2].tid, "FIFO order");
        assert_eq!(f.engine.in_flight(), 2);
    }

    #[test]
    fn test_multipart_reassembly() {
        let f = fixture(4);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        let now = Instant::now();
        for (number, last, byte) in [(1, false, 1u8), (2, false, 2), (3, true, 3)] {
            f.engine.on_response(
                Response::segment(PORT, sub.tid, Segment { number, last }, vec![byte; 4]),
                now,
            );
        }
        f.engine.process_completions();
        let got = results.lock();
        assert_eq!(
            got[0].as_ref().unwrap().payload,
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]
        );
    }

    #[test]
    fn test_out_of_order_segment_fails_transaction() {
        let f = fixture(4);
        let client = f.clients.register(policy(3, 1000)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        f.engine.on_response(
            Response::segment(PORT, sub.tid, Segment { number: 2, last: true }, vec![0; 4]),
            Instant::now(),
        );
        f.engine.process_completions();
        assert!(matches!(results.lock()[0], Err(SdError::MalformedResponse(_))));
    }

    #[test]
    fn test_addressing_unavailable_then_kick() {
        let f = fixture(4);
        f.ports.update(PORT, &attrs(0));
        let client = f.clients.register(policy(1, 1000)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(sub.disposition, Disposition::AddressingUnavailable);
        assert_eq!(f.engine.state_of(sub.tid), Some(TxState::NotAbleToSend));
        assert!(f.transport.take_sent().is_empty());

        f.ports.update(PORT, &attrs(5));
        assert_eq!(f.engine.kick_port(PORT), 1);
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        f.engine
            .on_response(sent[0].reply(MadStatus::SUCCESS, vec![]), Instant::now());
        f.engine.process_completions();
        assert!(results.lock()[0].is_ok());
    }

    #[test]
    fn test_transport_busy_queues_request() {
        let f = fixture(4);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        f.transport.fail_next_send(SdError::Busy);
        let (_, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(sub.disposition, Disposition::Queued);
        assert_eq!(f.engine.state_of(sub.tid), Some(TxState::ReadyToSend));
        assert_eq!(f.engine.in_flight(), 0);

        f.engine.on_timer(Instant::now());
        assert_eq!(f.transport.take_sent().len(), 1);
        assert_eq!(f.engine.state_of(sub.tid), Some(TxState::WaitingForResult));
    }

    #[test]
    fn test_class_port_info_applies_redirect() {
        let f = fixture(4);
        let tid = f.engine.learn_class_port_info(PORT).unwrap().expect("issued");
        assert!(f.engine.learn_class_port_info(PORT).unwrap().is_none(), "one at a time");

        let sent = f.transport.take_sent();
        assert_eq!(sent[0].datagram.attribute, attr::CLASS_PORT_INFO);
        let info = ClassPortInfo {
            redirect_lid: Lid(9),
            redirect_qp: 3,
            redirect_qkey: 0x8001_0000,
            ..ClassPortInfo::default()
        };
        f.engine
            .on_response(sent[0].reply(MadStatus::SUCCESS, info.encode()), Instant::now());
        assert_eq!(f.engine.location(tid), Location::Absent);
        assert_eq!(f.ports.addressing_for(PORT).unwrap().lid, Lid(9));

        let client = f.clients.register(policy(0, 1000)).unwrap();
        let (_, cb) = sink();
        f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(f.transport.take_sent()[0].addressing.lid, Lid(9));
    }

    #[test]
    fn test_cancel_all_suppresses_callbacks() {
        let f = fixture(4);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        let (results, cb) = sink();
        let sub = f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(f.engine.cancel_all(client), 1);
        assert_eq!(f.engine.cancel_all(client), 0);
        assert_eq!(f.engine.location(sub.tid), Location::Absent);
        assert_eq!(f.engine.in_flight(), 0);

        let sent = f.transport.take_sent();
        f.engine
            .on_response(sent[0].reply(MadStatus::SUCCESS, vec![]), Instant::now());
        f.engine.process_completions();
        assert!(results.lock().is_empty());
        assert_eq!(f.engine.metrics().snapshot().discarded, 1);
    }

    #[test]
    fn test_batch_collects_child_results() {
        let f = fixture(8);
        let client = f.clients.register(policy(0, 10)).unwrap();
        let got: Arc<Mutex<Option<Result<Vec<Result<Reply>>>>>> = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        let parent = f
            .engine
            .submit_batch(
                client,
                PORT,
                vec![get(), get(), get()],
                Box::new(move |res| *g.lock() = Some(res)),
            )
            .unwrap();
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 3);
        let now = Instant::now();
        f.engine.on_response(sent[0].reply(MadStatus::SUCCESS, vec![0]), now);
        f.engine
            .on_response(sent[2].reply(MadStatus::REQ_INVALID, vec![]), now);
        assert_eq!(f.engine.location(parent), Location::Pending);

        // second child times out
        f.engine.on_timer(now + Duration::from_millis(50));
        assert_eq!(f.engine.location(parent), Location::Completed);
        f.engine.process_completions();

        let guard = got.lock();
        let results = guard.as_ref().unwrap().as_ref().unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SdError::Timeout)));
        assert!(matches!(results[2], Err(SdError::Rejected(MadStatus::REQ_INVALID))));
    }

    #[test]
    fn test_unknown_client_and_port_rejected() {
        let f = fixture(4);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        let (_, cb) = sink();
        assert!(matches!(
            f.engine.submit(client, PortGuid(0xdead), get(), cb),
            Err(SdError::NotFound)
        ));
        f.clients.deregister(client).unwrap();
        let (_, cb) = sink();
        assert!(matches!(
            f.engine.submit(client, PORT, get(), cb),
            Err(SdError::NotFound)
        ));
    }

    #[test]
    fn test_shutdown_fails_outstanding() {
        let f = fixture(4);
        let client = f.clients.register(policy(0, 1000)).unwrap();
        let (results, cb) = sink();
        f.engine.submit(client, PORT, get(), cb).unwrap();
        assert_eq!(f.engine.shutdown(), 1);
        assert!(matches!(results.lock()[0], Err(SdError::Shutdown)));
        let (_, cb) = sink();
        assert!(matches!(
            f.engine.submit(client, PORT, get(), cb),
            Err(SdError::Shutdown)
        ));
    }
}
