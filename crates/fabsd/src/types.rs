// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identifiers and small value types shared by every layer.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config;

/// Globally unique identifier of a local port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortGuid(pub u64);

impl fmt::Display for PortGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// 128-bit fabric GID (subnet prefix + interface id, big-endian).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Build a GID from its two 64-bit halves.
    #[must_use]
    pub fn new(subnet_prefix: u64, interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&subnet_prefix.to_be_bytes());
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Self(raw)
    }

    #[must_use]
    pub fn subnet_prefix(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(half)
    }

    #[must_use]
    pub fn interface_id(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(half)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.subnet_prefix(), self.interface_id())
    }
}

/// Local identifier assigned by the subnet manager. Zero means unassigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Lid(pub u16);

impl Lid {
    #[must_use]
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

/// Correlation id carried in a request and echoed in its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Opaque handle returned by client registration. Never reissued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub(crate) u64);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Status word of a management response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MadStatus(pub u16);

impl MadStatus {
    pub const SUCCESS: MadStatus = MadStatus(0x0000);
    /// Transient: retry later.
    pub const BUSY: MadStatus = MadStatus(0x0001);
    pub const REDIRECT_REQUIRED: MadStatus = MadStatus(0x0002);
    pub const NO_RESOURCES: MadStatus = MadStatus(0x0100);
    pub const REQ_INVALID: MadStatus = MadStatus(0x0200);
    /// Query matched nothing; still a successful answer.
    pub const NO_RECORDS: MadStatus = MadStatus(0x0300);

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    #[must_use]
    pub fn is_busy(self) -> bool {
        self == Self::BUSY
    }
}

impl fmt::Display for MadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Per-client retry policy: how many re-sends after the first attempt, and
/// how long each attempt may wait for its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(retry_count: u32, timeout: Duration) -> Self {
        Self {
            retry_count,
            timeout,
        }
    }

    /// Total number of sends a transaction may make.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            config::DEFAULT_RETRY_COUNT,
            Duration::from_millis(config::DEFAULT_RETRY_TIMEOUT_MS),
        )
    }
}

/// Absolute point in time after which a pending exchange is considered lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Instant);

impl Deadline {
    #[must_use]
    pub fn after(from: Instant, wait: Duration) -> Self {
        Self(from + wait)
    }

    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    #[must_use]
    pub fn instant(self) -> Instant {
        self.0
    }

    #[must_use]
    pub fn has_passed(self, now: Instant) -> bool {
        now >= self.0
    }

    /// Time left until the deadline (zero once passed).
    #[must_use]
    pub fn remaining(self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }
}

/// Management method carried in a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Set,
    GetTable,
    Delete,
}

impl Method {
    /// Query methods treat `NO_RECORDS` as a successful empty answer.
    #[must_use]
    pub fn is_query(self) -> bool {
        matches!(self, Method::Get | Method::GetTable)
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Method::Get => 0x01,
            Method::Set => 0x02,
            Method::GetTable => 0x12,
            Method::Delete => 0x15,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Method::Get),
            0x02 => Some(Method::Set),
            0x12 => Some(Method::GetTable),
            0x15 => Some(Method::Delete),
            _ => None,
        }
    }
}

/// Attribute ids the driver itself understands.
pub mod attr {
    pub const CLASS_PORT_INFO: u16 = 0x0001;
    pub const NODE_RECORD: u16 = 0x0011;
    pub const INFORM_INFO: u16 = 0x0031;
    pub const PATH_RECORD: u16 = 0x0035;
    pub const MCMEMBER_RECORD: u16 = 0x0038;
}

/// A client request. The payload is opaque to the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub attribute: u16,
    pub component_mask: u64,
    pub payload: Vec<u8>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, attribute: u16, payload: Vec<u8>) -> Self {
        Self {
            method,
            attribute,
            component_mask: 0,
            payload,
        }
    }

    #[must_use]
    pub fn with_component_mask(mut self, mask: u64) -> Self {
        self.component_mask = mask;
        self
    }
}

/// Terminal successful answer for a request (reassembled payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: MadStatus,
    pub payload: Vec<u8>,
}
