// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group membership.
//!
//! Clients join groups through the manager; the manager keeps one fabric
//! membership per group and fans state changes out to every client that
//! asked for it.
//!
//! ```text
//!            join ok                       last client leaves
//! RequestJoin ──────> Available ─────────────────────> RequestLeave
//!   │   ^                 │  flags grew: re-join            │ done
//!   │   └─────────────────┘                                 v
//!   │ hard error          port down                     Unavailable
//!   v                                                    (deleted)
//! JoinFailed (deleted)    Available ──> Unavailable ──> RequestJoin
//!                                          addressing changed
//! ```

mod inform;
mod manager;
mod record;

pub use inform::{InformInfo, GROUP_TRAPS, INFORM_INFO_LEN, TRAP_GROUP_CREATED, TRAP_GROUP_DELETED};
pub use manager::McManager;
pub use record::{mask, JoinState, McMemberRecord, MCMEMBER_RECORD_LEN};

use std::fmt;
use std::sync::Arc;

use crate::types::{Gid, PortGuid};

/// Lifecycle of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum McGroupState {
    RequestJoin,
    Available,
    RequestLeave,
    JoinFailed,
    Unavailable,
}

impl fmt::Display for McGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            McGroupState::RequestJoin => "REQUEST_JOIN",
            McGroupState::Available => "AVAILABLE",
            McGroupState::RequestLeave => "REQUEST_LEAVE",
            McGroupState::JoinFailed => "JOIN_FAILED",
            McGroupState::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// How a membership was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinVersion {
    /// Egress port derived from the port GID; leave matches on MGID.
    V1,
    /// Explicit egress port; leave matches the full rendezvous id.
    V2,
}

/// Rendezvous id of a membership: the group, the requester and the local
/// port the membership lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId {
    pub version: JoinVersion,
    pub mgid: Gid,
    pub port_gid: Gid,
    pub egress: PortGuid,
}

impl GroupId {
    /// Same fabric membership, whatever version requested it.
    #[must_use]
    pub fn same_group(&self, other: &GroupId) -> bool {
        self.mgid == other.mgid && self.port_gid == other.port_gid && self.egress == other.egress
    }

    /// Whether a leave naming `self` targets a membership with id `held`.
    #[must_use]
    pub fn leave_matches(&self, held: &GroupId) -> bool {
        match self.version {
            JoinVersion::V1 => self.mgid == held.mgid,
            JoinVersion::V2 => self.same_group(held),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mgid={} via {}", self.mgid, self.egress)
    }
}

/// Per-membership options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct McFlags(pub u16);

impl McFlags {
    pub const NONE: McFlags = McFlags(0);
    /// Also report `Unavailable` (port down, leave done).
    pub const WANT_UNAVAILABLE: McFlags = McFlags(0x0001);

    #[must_use]
    pub fn want_unavailable(self) -> bool {
        self.0 & Self::WANT_UNAVAILABLE.0 != 0
    }
}

/// What a client is told about its group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McNotification {
    pub group: GroupId,
    pub state: McGroupState,
    /// Authoritative record once joined, the requested one before.
    pub record: McMemberRecord,
    /// Failure detail for `JoinFailed`.
    pub reason: Option<String>,
}

/// Membership callback. Runs on the service thread, never under a lock.
pub type McCallback = Arc<dyn Fn(&McNotification) + Send + Sync>;

/// Subnet-manager reports about multicast groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyTrap {
    GroupCreated(Gid),
    GroupDeleted(Gid),
}

impl TopologyTrap {
    /// Map a notice's trap number and its GID detail. Other traps are not
    /// ours.
    #[must_use]
    pub fn from_notice(trap_number: u16, mgid: Gid) -> Option<Self> {
        match trap_number {
            TRAP_GROUP_CREATED => Some(Self::GroupCreated(mgid)),
            TRAP_GROUP_DELETED => Some(Self::GroupDeleted(mgid)),
            _ => None,
        }
    }
}
