// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One outstanding exchange and its lifecycle state.

use std::fmt;
use std::time::Instant;

use crate::error::{Result, SdError};
use crate::transport::{Datagram, Segment};
use crate::types::{
    ClientHandle, Deadline, PortGuid, Reply, Request, RetryPolicy, TransactionId,
};

/// Completion callback of a single request.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply>) + Send>;

/// Completion callback of a batch: one result per request, in order.
pub type BatchCallback = Box<dyn FnOnce(Result<Vec<Result<Reply>>>) + Send>;

/// Lifecycle of a transaction.
///
/// ```text
/// ReadyToSend ──> WaitingForResult ──> ProcessingResponse ──> QueryComplete
///      ^   │             │   ^                 │
///      │   v             v   │                 v
///      │ NotAbleToSend  BusyRetryDelay     QueryDestroy
///      └─────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Waiting for an in-flight slot or a transport buffer.
    ReadyToSend,
    /// Addressing or transport unavailable; retried on the timeout schedule.
    NotAbleToSend,
    /// On the wire, deadline armed.
    WaitingForResult,
    /// Peer said BUSY; resent after the backoff.
    BusyRetryDelay,
    /// Batch parent waiting on its children.
    WaitingForChildren,
    /// Claimed by exactly one execution context.
    ProcessingResponse,
    /// Outcome recorded, waiting for delivery.
    QueryComplete,
    /// Cancelled; freed without notifying anyone.
    QueryDestroy,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who the transaction reports to.
pub enum TxKind {
    /// Client request.
    User(Option<ReplyCallback>),
    /// Client batch; completes when every child is terminal.
    Batch {
        callback: Option<BatchCallback>,
        remaining: usize,
        results: Vec<Option<Result<Reply>>>,
    },
    /// One request of a batch.
    Child {
        parent: TransactionId,
        index: usize,
    },
    /// Driver-issued class-port-info query; updates the port cache.
    ClassPortInfo,
}

impl TxKind {
    #[must_use]
    pub fn is_self_command(&self) -> bool {
        matches!(self, TxKind::ClassPortInfo)
    }

    fn label(&self) -> &'static str {
        match self {
            TxKind::User(_) => "user",
            TxKind::Batch { .. } => "batch",
            TxKind::Child { .. } => "child",
            TxKind::ClassPortInfo => "class-port-info",
        }
    }
}

/// Multi-part reply accumulator.
#[derive(Debug)]
pub struct Reassembly {
    next_segment: u32,
    buf: Vec<u8>,
}

impl Reassembly {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_segment: 1,
            buf: Vec::new(),
        }
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.next_segment > 1
    }

    pub fn reset(&mut self) {
        self.next_segment = 1;
        self.buf.clear();
    }

    /// Add one segment. Returns the full payload once the last segment is in.
    pub fn push(
        &mut self,
        segment: Segment,
        payload: &[u8],
        segment_limit: usize,
        total_limit: usize,
    ) -> Result<Option<Vec<u8>>> {
        if segment.number != self.next_segment {
            return Err(SdError::MalformedResponse(format!(
                "segment {} out of order, expected {}",
                segment.number, self.next_segment
            )));
        }
        if payload.len() > segment_limit {
            return Err(SdError::MalformedResponse(format!(
                "segment {} carries {} bytes (limit {})",
                segment.number,
                payload.len(),
                segment_limit
            )));
        }
        if self.buf.len() + payload.len() > total_limit {
            return Err(SdError::MalformedResponse(format!(
                "response exceeds {} bytes",
                total_limit
            )));
        }
        self.buf.extend_from_slice(payload);
        self.next_segment += 1;
        if segment.last {
            self.next_segment = 1;
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

/// One outstanding request.
pub struct Transaction {
    pub tid: TransactionId,
    pub port: PortGuid,
    /// `None` for driver-issued commands and after cancellation.
    pub client: Option<ClientHandle>,
    pub kind: TxKind,
    pub request: Request,
    pub policy: RetryPolicy,
    pub retries_left: u32,
    pub sent_at: Option<Instant>,
    pub deadline: Option<Deadline>,
    pub state: TxState,
    /// Occupies one in-flight slot.
    pub holds_slot: bool,
    /// Bumped on every send so late send failures can be told apart.
    pub attempt: u32,
    pub reassembly: Reassembly,
    pub outcome: Option<Result<Reply>>,
}

impl Transaction {
    #[must_use]
    pub fn new(
        tid: TransactionId,
        port: PortGuid,
        client: Option<ClientHandle>,
        kind: TxKind,
        request: Request,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            tid,
            port,
            client,
            kind,
            request,
            retries_left: policy.retry_count,
            policy,
            sent_at: None,
            deadline: None,
            state: TxState::ReadyToSend,
            holds_slot: false,
            attempt: 0,
            reassembly: Reassembly::new(),
            outcome: None,
        }
    }

    #[must_use]
    pub fn datagram(&self) -> Datagram {
        Datagram {
            tid: self.tid,
            method: self.request.method,
            attribute: self.request.attribute,
            component_mask: self.request.component_mask,
            payload: self.request.payload.clone(),
        }
    }

    /// Arm the response deadline for an attempt starting at `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(Deadline::after(now, self.policy.timeout));
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("port", &self.port)
            .field("client", &self.client)
            .field("kind", &self.kind.label())
            .field("state", &self.state)
            .field("retries_left", &self.retries_left)
            .field("holds_slot", &self.holds_slot)
            .finish()
    }
}
