// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transactional query engine.
//!
//! Turns client requests into correlated transactions, applies the
//! in-flight ceiling, retries on timeout and busy, and reassembles
//! multi-part replies.

mod engine;

pub use engine::QueryEngine;

use crate::types::TransactionId;

/// What happened to a request at submission time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the transport.
    Sent,
    /// Waiting for an in-flight slot or a transport buffer.
    Queued,
    /// Port addressing not yet valid; retried on the timeout schedule and
    /// on the next addressing change.
    AddressingUnavailable,
}

/// Receipt for a submitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submitted {
    pub tid: TransactionId,
    pub disposition: Disposition,
}
