// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast member record and membership flags.
//!
//! ```text
//!  0                16               32       36     38   39    40     42   43   44          48     49
//! +----------------+----------------+--------+------+----+-----+------+----+----+-----------+------+-------+
//! |      MGID      |    PortGID     |  QKey  | MLID |MTU |TClas| PKey |Rate|Life|SL|Flow|Hop|Sc|JS|Proxy..|
//! +----------------+----------------+--------+------+----+-----+------+----+----+-----------+------+-------+
//! ```
//!
//! 52 bytes, big-endian. Selector fields take the top two bits of their
//! byte; scope and join state share byte 48 (scope high nibble).

use std::fmt;
use std::ops::BitOr;

use crate::error::{Result, SdError};
use crate::types::Gid;

/// Encoded size of a member record.
pub const MCMEMBER_RECORD_LEN: usize = 52;

/// Component-mask bits of the member record.
pub mod mask {
    pub const MGID: u64 = 1 << 0;
    pub const PORT_GID: u64 = 1 << 1;
    pub const QKEY: u64 = 1 << 2;
    pub const MLID: u64 = 1 << 3;
    pub const MTU_SELECTOR: u64 = 1 << 4;
    pub const MTU: u64 = 1 << 5;
    pub const TCLASS: u64 = 1 << 6;
    pub const PKEY: u64 = 1 << 7;
    pub const RATE_SELECTOR: u64 = 1 << 8;
    pub const RATE: u64 = 1 << 9;
    pub const PKT_LIFE_SELECTOR: u64 = 1 << 10;
    pub const PKT_LIFE: u64 = 1 << 11;
    pub const SL: u64 = 1 << 12;
    pub const FLOW_LABEL: u64 = 1 << 13;
    pub const HOP_LIMIT: u64 = 1 << 14;
    pub const SCOPE: u64 = 1 << 15;
    pub const JOIN_STATE: u64 = 1 << 16;
    pub const PROXY_JOIN: u64 = 1 << 17;

    /// Always sent: the group, the requester and the membership kind.
    pub const REQUIRED: u64 = MGID | PORT_GID | JOIN_STATE;
}

/// Membership kinds requested for a group (4-bit set).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct JoinState(u8);

impl JoinState {
    pub const FULL_MEMBER: JoinState = JoinState(0x1);
    pub const NON_MEMBER: JoinState = JoinState(0x2);
    pub const SEND_ONLY: JoinState = JoinState(0x4);

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: JoinState) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when a group holding `self` already grants everything `other`
    /// asks for. A full member implies the other two kinds.
    #[must_use]
    pub fn covers(self, other: JoinState) -> bool {
        self.contains(Self::FULL_MEMBER) || self.contains(other)
    }

    /// Fold `other` in. Returns true when the set grew.
    pub fn accumulate(&mut self, other: JoinState) -> bool {
        if self.covers(other) {
            return false;
        }
        self.0 |= other.0;
        true
    }
}

impl BitOr for JoinState {
    type Output = JoinState;

    fn bitor(self, rhs: JoinState) -> JoinState {
        JoinState(self.0 | rhs.0)
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::FULL_MEMBER) {
            names.push("full");
        }
        if self.contains(Self::NON_MEMBER) {
            names.push("non");
        }
        if self.contains(Self::SEND_ONLY) {
            names.push("send-only");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Multicast member record as exchanged with the subnet administrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct McMemberRecord {
    pub mgid: Gid,
    pub port_gid: Gid,
    pub qkey: u32,
    pub mlid: u16,
    pub mtu_selector: u8,
    pub mtu: u8,
    pub tclass: u8,
    pub pkey: u16,
    pub rate_selector: u8,
    pub rate: u8,
    pub pkt_life_selector: u8,
    pub pkt_life: u8,
    pub sl: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub scope: u8,
    pub join_state: JoinState,
    pub proxy_join: bool,
}

impl McMemberRecord {
    /// Minimal join record for `mgid` requested by `port_gid`.
    #[must_use]
    pub fn new(mgid: Gid, port_gid: Gid, join_state: JoinState) -> Self {
        Self {
            mgid,
            port_gid,
            join_state,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MCMEMBER_RECORD_LEN];
        buf[0..16].copy_from_slice(&self.mgid.0);
        buf[16..32].copy_from_slice(&self.port_gid.0);
        buf[32..36].copy_from_slice(&self.qkey.to_be_bytes());
        buf[36..38].copy_from_slice(&self.mlid.to_be_bytes());
        buf[38] = selector_byte(self.mtu_selector, self.mtu);
        buf[39] = self.tclass;
        buf[40..42].copy_from_slice(&self.pkey.to_be_bytes());
        buf[42] = selector_byte(self.rate_selector, self.rate);
        buf[43] = selector_byte(self.pkt_life_selector, self.pkt_life);
        let sl_flow_hop = (u32::from(self.sl & 0x0f) << 28)
            | ((self.flow_label & 0x000f_ffff) << 8)
            | u32::from(self.hop_limit);
        buf[44..48].copy_from_slice(&sl_flow_hop.to_be_bytes());
        buf[48] = ((self.scope & 0x0f) << 4) | self.join_state.bits();
        buf[49] = if self.proxy_join { 0x80 } else { 0 };
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MCMEMBER_RECORD_LEN {
            return Err(SdError::MalformedResponse(format!(
                "member record too short: {} bytes",
                buf.len()
            )));
        }
        let mut mgid = [0u8; 16];
        mgid.copy_from_slice(&buf[0..16]);
        let mut port_gid = [0u8; 16];
        port_gid.copy_from_slice(&buf[16..32]);
        let sl_flow_hop = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]);
        Ok(Self {
            mgid: Gid(mgid),
            port_gid: Gid(port_gid),
            qkey: u32::from_be_bytes([buf[32], buf[33], buf[34], buf[35]]),
            mlid: u16::from_be_bytes([buf[36], buf[37]]),
            mtu_selector: buf[38] >> 6,
            mtu: buf[38] & 0x3f,
            tclass: buf[39],
            pkey: u16::from_be_bytes([buf[40], buf[41]]),
            rate_selector: buf[42] >> 6,
            rate: buf[42] & 0x3f,
            pkt_life_selector: buf[43] >> 6,
            pkt_life: buf[43] & 0x3f,
            sl: (sl_flow_hop >> 28) as u8,
            flow_label: (sl_flow_hop >> 8) & 0x000f_ffff,
            hop_limit: (sl_flow_hop & 0xff) as u8,
            scope: buf[48] >> 4,
            join_state: JoinState::from_bits(buf[48]),
            proxy_join: buf[49] & 0x80 != 0,
        })
    }
}

fn selector_byte(selector: u8, value: u8) -> u8 {
    ((selector & 0x03) << 6) | (value & 0x3f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_member_covers_everything() {
        let full = JoinState::FULL_MEMBER;
        assert!(full.covers(JoinState::NON_MEMBER));
        assert!(full.covers(JoinState::SEND_ONLY));
        assert!(!JoinState::NON_MEMBER.covers(JoinState::SEND_ONLY));
        assert!(!JoinState::NON_MEMBER.covers(full));
    }

    #[test]
    fn test_accumulate_reports_growth_once() {
        let mut state = JoinState::NON_MEMBER;
        assert!(!state.accumulate(JoinState::NON_MEMBER));
        assert!(state.accumulate(JoinState::SEND_ONLY));
        assert_eq!(state, JoinState::NON_MEMBER | JoinState::SEND_ONLY);
        assert!(state.accumulate(JoinState::FULL_MEMBER));
        assert!(!state.accumulate(JoinState::SEND_ONLY));
        assert_eq!(state.to_string(), "full|non|send-only");
    }

    #[test]
    fn test_record_packed_fields() {
        let record = McMemberRecord {
            mgid: Gid::new(0xff12_401b_ffff_0000, 1),
            port_gid: Gid::new(0xfe80_0000_0000_0000, 0x0002_c903_0000_0001),
            qkey: 0x8001_0000,
            mlid: 0xc001,
            mtu_selector: 2,
            mtu: 4,
            pkey: 0xffff,
            rate_selector: 2,
            rate: 3,
            sl: 5,
            flow_label: 0xabcde,
            hop_limit: 0x40,
            scope: 2,
            join_state: JoinState::FULL_MEMBER,
            proxy_join: true,
            ..McMemberRecord::default()
        };
        let buf = record.encode();
        assert_eq!(buf.len(), MCMEMBER_RECORD_LEN);
        assert_eq!(buf[38], 0x84);
        assert_eq!(&buf[44..48], &[0x5a, 0xbc, 0xde, 0x40]);
        assert_eq!(buf[48], 0x21);
        assert_eq!(McMemberRecord::decode(&buf).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(McMemberRecord::decode(&[0u8; 51]).is_err());
    }
}
