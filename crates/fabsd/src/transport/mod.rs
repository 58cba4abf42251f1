// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram transport seam.
//!
//! The engine only needs two things from a transport: hand off a datagram
//! to a port, and block (bounded) for the next inbound response. Two
//! implementations ship with the crate:
//!
//! - [`LoopbackTransport`]: in-memory, the caller plays the remote peer
//! - [`UdpTransport`]: frames datagrams over UDP, LIDs mapped to endpoints

mod frame;
mod loopback;
mod udp;

pub use frame::{Frame, FRAME_HEADER_LEN, FRAME_VERSION};
pub use loopback::{LoopbackTransport, SentDatagram};
pub use udp::UdpTransport;

use std::time::Duration;

use crate::error::Result;
use crate::port::Addressing;
use crate::types::{MadStatus, Method, PortGuid, TransactionId};

/// Outbound request as handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub tid: TransactionId,
    pub method: Method,
    pub attribute: u16,
    pub component_mask: u64,
    pub payload: Vec<u8>,
}

/// Position of one datagram within a multi-part reply (1-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub number: u32,
    pub last: bool,
}

/// What an inbound message is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// Answer from the peer, possibly one part of several.
    Reply {
        status: MadStatus,
        segment: Option<Segment>,
    },
    /// Local notification that an earlier send of this transaction failed.
    SendError,
}

/// Inbound message correlated by transaction id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Local port the message arrived on.
    pub port: PortGuid,
    pub tid: TransactionId,
    pub kind: ResponseKind,
    pub payload: Vec<u8>,
}

impl Response {
    /// Single-datagram reply.
    #[must_use]
    pub fn reply(port: PortGuid, tid: TransactionId, status: MadStatus, payload: Vec<u8>) -> Self {
        Self {
            port,
            tid,
            kind: ResponseKind::Reply {
                status,
                segment: None,
            },
            payload,
        }
    }

    /// One part of a multi-part reply.
    #[must_use]
    pub fn segment(port: PortGuid, tid: TransactionId, segment: Segment, payload: Vec<u8>) -> Self {
        Self {
            port,
            tid,
            kind: ResponseKind::Reply {
                status: MadStatus::SUCCESS,
                segment: Some(segment),
            },
            payload,
        }
    }

    #[must_use]
    pub fn send_error(port: PortGuid, tid: TransactionId) -> Self {
        Self {
            port,
            tid,
            kind: ResponseKind::SendError,
            payload: Vec::new(),
        }
    }
}

/// Datagram transport used by the query engine.
///
/// `send` must not block for long and must not call back into the driver.
/// Returning `Busy` or `InsufficientResources` means "no buffer right now":
/// the engine queues the transaction and tries again later. Any other error
/// parks the transaction until its next retry.
pub trait Transport: Send + Sync {
    fn send(&self, port: PortGuid, addressing: &Addressing, datagram: &Datagram) -> Result<()>;

    /// Wait at most `timeout` for the next inbound message.
    fn recv(&self, timeout: Duration) -> Option<Response>;
}
