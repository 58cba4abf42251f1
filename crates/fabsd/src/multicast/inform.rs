// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inform-info record: trap (un)subscription with the subnet manager.
//!
//! ```text
//!  0                16     18     20     22   23   24     26     28               32
//! +----------------+------+------+------+----+----+------+------+----------------+----------------+
//! |      GID       |LIDBeg|LIDEnd| resv |Gen |Sub | Type | Trap | QPN:24 |resp:5 |resv:8 |Prod:24 |
//! +----------------+------+------+------+----+----+------+------+----------------+----------------+
//! ```
//!
//! 36 bytes, big-endian.

use crate::config::GSI_QP;
use crate::error::{Result, SdError};
use crate::types::Gid;

/// Encoded size of an inform-info record.
pub const INFORM_INFO_LEN: usize = 36;

/// Subnet-manager trap: a multicast group was created.
pub const TRAP_GROUP_CREATED: u16 = 66;
/// Subnet-manager trap: a multicast group was deleted.
pub const TRAP_GROUP_DELETED: u16 = 67;

/// Traps the membership manager listens for.
pub const GROUP_TRAPS: [u16; 2] = [TRAP_GROUP_CREATED, TRAP_GROUP_DELETED];

const LID_PERMISSIVE: u16 = 0xffff;
const NOTICE_TYPE_ALL: u16 = 0xffff;
const RESP_TIME_VALUE: u8 = 18;
const PRODUCER_CA: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InformInfo {
    pub gid: Gid,
    pub lid_range_begin: u16,
    pub lid_range_end: u16,
    pub is_generic: bool,
    pub subscribe: bool,
    pub notice_type: u16,
    pub trap_number: u16,
    pub qpn: u32,
    pub resp_time_value: u8,
    pub producer_type: u32,
}

impl InformInfo {
    /// Generic subscription (or its removal) for `trap_number` from any
    /// source, reported to the general services queue pair.
    #[must_use]
    pub fn generic(trap_number: u16, subscribe: bool) -> Self {
        Self {
            gid: Gid::default(),
            lid_range_begin: LID_PERMISSIVE,
            lid_range_end: 0,
            is_generic: true,
            subscribe,
            notice_type: NOTICE_TYPE_ALL,
            trap_number,
            qpn: GSI_QP,
            resp_time_value: RESP_TIME_VALUE,
            producer_type: PRODUCER_CA,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; INFORM_INFO_LEN];
        buf[0..16].copy_from_slice(&self.gid.0);
        buf[16..18].copy_from_slice(&self.lid_range_begin.to_be_bytes());
        buf[18..20].copy_from_slice(&self.lid_range_end.to_be_bytes());
        buf[22] = u8::from(self.is_generic);
        buf[23] = u8::from(self.subscribe);
        buf[24..26].copy_from_slice(&self.notice_type.to_be_bytes());
        buf[26..28].copy_from_slice(&self.trap_number.to_be_bytes());
        let qpn_resp = ((self.qpn & 0x00ff_ffff) << 8) | u32::from(self.resp_time_value & 0x1f);
        buf[28..32].copy_from_slice(&qpn_resp.to_be_bytes());
        buf[32..36].copy_from_slice(&(self.producer_type & 0x00ff_ffff).to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFORM_INFO_LEN {
            return Err(SdError::MalformedResponse(format!(
                "inform-info too short: {} bytes",
                buf.len()
            )));
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[0..16]);
        let qpn_resp = u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]);
        Ok(Self {
            gid: Gid(gid),
            lid_range_begin: u16::from_be_bytes([buf[16], buf[17]]),
            lid_range_end: u16::from_be_bytes([buf[18], buf[19]]),
            is_generic: buf[22] & 0x01 != 0,
            subscribe: buf[23] & 0x01 != 0,
            notice_type: u16::from_be_bytes([buf[24], buf[25]]),
            trap_number: u16::from_be_bytes([buf[26], buf[27]]),
            qpn: qpn_resp >> 8,
            resp_time_value: (qpn_resp & 0x1f) as u8,
            producer_type: u32::from_be_bytes([buf[32], buf[33], buf[34], buf[35]]) & 0x00ff_ffff,
        })
    }
}
