// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CA port address cache.
//!
//! One record per local port describing how to reach the subnet
//! administrator from that port. The discovery side writes it on port
//! events; the query engine reads it for every send.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::{CLASS_PORT_INFO_LEN, GSI_QKEY, GSI_QP};
use crate::error::{Result, SdError};
use crate::types::{Gid, Lid, PortGuid};

/// Attributes of a local port as reported by discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAttributes {
    pub ca_guid: u64,
    pub subnet_prefix: u64,
    pub base_lid: Lid,
    pub sm_lid: Lid,
    pub sm_sl: u8,
    pub static_rate: u8,
    pub pkey_index: u16,
    pub active: bool,
}

/// Remote endpoint of a management exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Addressing {
    pub lid: Lid,
    pub qp: u32,
    pub qkey: u32,
    pub sl: u8,
    pub static_rate: u8,
    pub pkey_index: u16,
}

/// Cached addressing for one local port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaPort {
    pub ca_guid: u64,
    pub port_guid: PortGuid,
    pub subnet_prefix: u64,
    /// Subnet manager's well-known address.
    pub default: Addressing,
    /// Address learned from class-port-info (equals `default` until learned).
    pub redirect: Addressing,
    /// Base LID assigned and port active.
    pub valid: bool,
    /// Class-port-info learned since the last addressing change.
    pub initialized: bool,
}

impl CaPort {
    fn from_attributes(port_guid: PortGuid, attrs: &PortAttributes) -> Self {
        let default = Addressing {
            lid: attrs.sm_lid,
            qp: GSI_QP,
            qkey: GSI_QKEY,
            sl: attrs.sm_sl,
            static_rate: attrs.static_rate,
            pkey_index: attrs.pkey_index,
        };
        Self {
            ca_guid: attrs.ca_guid,
            port_guid,
            subnet_prefix: attrs.subnet_prefix,
            default,
            redirect: default,
            valid: attrs.base_lid.is_assigned() && attrs.active,
            initialized: false,
        }
    }

    /// Address used for client traffic.
    #[must_use]
    pub fn effective(&self) -> Addressing {
        if self.initialized {
            self.redirect
        } else {
            self.default
        }
    }

    /// Port GID built from the cached subnet prefix.
    #[must_use]
    pub fn gid(&self) -> Gid {
        Gid::new(self.subnet_prefix, self.port_guid.0)
    }
}

/// Outcome of [`CaPortCache::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortUpdate {
    pub valid: bool,
    /// Port was not valid (or unknown) before this update.
    pub became_valid: bool,
}

/// Redirection advertised by the subnet administrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ClassPortInfo {
    pub redirect_gid: Gid,
    pub redirect_sl: u8,
    pub redirect_lid: Lid,
    pub redirect_pkey: u16,
    pub redirect_qp: u32,
    pub redirect_qkey: u32,
}

impl ClassPortInfo {
    /// Decode the redirect block of a class-port-info payload (big-endian).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 40 {
            return Err(SdError::MalformedResponse(format!(
                "class-port-info too short: {} bytes",
                buf.len()
            )));
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[8..24]);
        let tc_sl_fl = be_u32(&buf[24..28]);
        Ok(Self {
            redirect_gid: Gid(gid),
            redirect_sl: ((tc_sl_fl >> 20) & 0x0f) as u8,
            redirect_lid: Lid(be_u16(&buf[28..30])),
            redirect_pkey: be_u16(&buf[30..32]),
            redirect_qp: be_u32(&buf[32..36]) & 0x00ff_ffff,
            redirect_qkey: be_u32(&buf[36..40]),
        })
    }

    /// Encode into a full-size attribute (used by peers and tests).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CLASS_PORT_INFO_LEN];
        buf[0] = 1;
        buf[1] = 2;
        buf[8..24].copy_from_slice(&self.redirect_gid.0);
        let tc_sl_fl = (u32::from(self.redirect_sl) & 0x0f) << 20;
        buf[24..28].copy_from_slice(&tc_sl_fl.to_be_bytes());
        buf[28..30].copy_from_slice(&self.redirect_lid.0.to_be_bytes());
        buf[30..32].copy_from_slice(&self.redirect_pkey.to_be_bytes());
        buf[32..36].copy_from_slice(&(self.redirect_qp & 0x00ff_ffff).to_be_bytes());
        buf[36..40].copy_from_slice(&self.redirect_qkey.to_be_bytes());
        buf
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Lock-protected port table.
#[derive(Debug, Default)]
pub struct CaPortCache {
    ports: RwLock<HashMap<PortGuid, CaPort>>,
}

impl CaPortCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)initialize a port from fresh attributes. Any learned redirection
    /// is dropped and must be learned again.
    pub fn update(&self, port: PortGuid, attrs: &PortAttributes) -> PortUpdate {
        let next = CaPort::from_attributes(port, attrs);
        let mut ports = self.ports.write();
        let was_valid = ports.get(&port).map(|p| p.valid).unwrap_or(false);
        ports.insert(port, next);
        log::debug!(
            "[PORT] {} base_lid={} sm_lid={} active={} valid={}",
            port,
            attrs.base_lid.0,
            attrs.sm_lid.0,
            attrs.active,
            next.valid
        );
        PortUpdate {
            valid: next.valid,
            became_valid: next.valid && !was_valid,
        }
    }

    /// Mark a port's addressing unusable (port down). Returns false when the
    /// port is unknown.
    pub fn invalidate(&self, port: PortGuid) -> bool {
        match self.ports.write().get_mut(&port) {
            Some(entry) => {
                entry.valid = false;
                entry.initialized = false;
                entry.redirect = entry.default;
                log::debug!("[PORT] {} invalidated", port);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, port: PortGuid) -> Option<CaPort> {
        self.ports.write().remove(&port)
    }

    #[must_use]
    pub fn get(&self, port: PortGuid) -> Option<CaPort> {
        self.ports.read().get(&port).copied()
    }

    #[must_use]
    pub fn is_known(&self, port: PortGuid) -> bool {
        self.ports.read().contains_key(&port)
    }

    /// Address for client traffic on `port`.
    pub fn addressing_for(&self, port: PortGuid) -> Result<Addressing> {
        let ports = self.ports.read();
        let entry = ports.get(&port).ok_or(SdError::NotFound)?;
        if !entry.valid {
            return Err(SdError::AddressingUnavailable);
        }
        Ok(entry.effective())
    }

    /// Address for the driver's own class-port-info exchange: always the
    /// well-known default.
    pub fn default_addressing_for(&self, port: PortGuid) -> Result<Addressing> {
        let ports = self.ports.read();
        let entry = ports.get(&port).ok_or(SdError::NotFound)?;
        if !entry.valid {
            return Err(SdError::AddressingUnavailable);
        }
        Ok(entry.default)
    }

    /// Record a learned redirection. A redirect LID of zero means the
    /// administrator answers on its default address.
    pub fn apply_class_port_info(&self, port: PortGuid, info: &ClassPortInfo) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(SdError::NotFound)?;
        if info.redirect_lid.is_assigned() {
            entry.redirect = Addressing {
                lid: info.redirect_lid,
                qp: info.redirect_qp,
                qkey: info.redirect_qkey,
                sl: info.redirect_sl,
                static_rate: entry.default.static_rate,
                pkey_index: entry.default.pkey_index,
            };
            log::debug!(
                "[PORT] {} redirected to lid={} qp={}",
                port,
                info.redirect_lid.0,
                info.redirect_qp
            );
        } else {
            entry.redirect = entry.default;
        }
        entry.initialized = true;
        Ok(())
    }

    /// Every known local port, in GUID order.
    #[must_use]
    pub fn local_ports(&self) -> Vec<PortGuid> {
        let mut ports: Vec<PortGuid> = self.ports.read().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// First valid port, for callers that do not name one.
    #[must_use]
    pub fn default_port(&self) -> Option<PortGuid> {
        self.ports
            .read()
            .values()
            .filter(|p| p.valid)
            .map(|p| p.port_guid)
            .min()
    }

    /// Port whose GUID equals the interface id of `gid`.
    #[must_use]
    pub fn port_for_gid(&self, gid: &Gid) -> Option<PortGuid> {
        let port = PortGuid(gid.interface_id());
        self.is_known(port).then_some(port)
    }
}
