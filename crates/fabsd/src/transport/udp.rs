// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport.
//!
//! Serves one local port. Remote management endpoints are addressed by LID;
//! each LID is mapped to a UDP endpoint with [`UdpTransport::add_route`].

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};

use super::{Datagram, Frame, Response, Transport};
use crate::error::{Result, SdError};
use crate::port::Addressing;
use crate::types::{Lid, PortGuid};

const RECV_BUFFER_SIZE: usize = 65536;

/// Datagram transport over a single UDP socket.
pub struct UdpTransport {
    port: PortGuid,
    socket: UdpSocket,
    routes: RwLock<HashMap<Lid, SocketAddr>>,
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpTransport {
    /// Bind a socket for `port` at `bind_addr`.
    pub fn bind(port: PortGuid, bind_addr: SocketAddr) -> io::Result<Self> {
        let domain = if bind_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;
        socket2.bind(&bind_addr.into())?;
        let socket: UdpSocket = socket2.into();
        log::debug!(
            "[UDP] bound port={} addr={}",
            port,
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        Ok(Self {
            port,
            socket,
            routes: RwLock::new(HashMap::new()),
            recv_buf: Mutex::new(vec![0u8; RECV_BUFFER_SIZE]),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Route datagrams addressed to `lid` to `endpoint`.
    pub fn add_route(&self, lid: Lid, endpoint: SocketAddr) {
        self.routes.write().insert(lid, endpoint);
    }

    pub fn remove_route(&self, lid: Lid) -> Option<SocketAddr> {
        self.routes.write().remove(&lid)
    }
}

impl Transport for UdpTransport {
    fn send(&self, port: PortGuid, addressing: &Addressing, datagram: &Datagram) -> Result<()> {
        if port != self.port {
            return Err(SdError::SendFailed(format!(
                "transport serves {} not {}",
                self.port, port
            )));
        }
        let dest = self
            .routes
            .read()
            .get(&addressing.lid)
            .copied()
            .ok_or_else(|| SdError::SendFailed(format!("no route to lid {}", addressing.lid.0)))?;
        let bytes = Frame::request(datagram).encode()?;
        match self.socket.send_to(&bytes, dest) {
            Ok(_) => {
                log::trace!(
                    "[UDP] sent tid={} len={} to {}",
                    datagram.tid,
                    bytes.len(),
                    dest
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SdError::Busy),
            Err(e) => Err(SdError::SendFailed(e.to_string())),
        }
    }

    fn recv(&self, timeout: Duration) -> Option<Response> {
        // A zero read timeout means "block forever" to the OS.
        let timeout = timeout.max(Duration::from_millis(1));
        if let Err(e) = self.socket.set_read_timeout(Some(timeout)) {
            log::warn!("[UDP] set_read_timeout failed: {}", e);
            return None;
        }
        let mut buf = self.recv_buf.lock();
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => match Frame::decode(&buf[..len]) {
                Ok(frame) => Some(frame.into_response(self.port)),
                Err(e) => {
                    log::debug!("[UDP] dropped frame from {}: {}", from, e);
                    None
                }
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) => {
                log::warn!("[UDP] recv failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MadStatus, Method, TransactionId};

    fn loopback_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_request_reply_over_udp() {
        let transport = UdpTransport::bind(PortGuid(1), loopback_addr()).expect("bind");
        let peer = UdpSocket::bind(loopback_addr()).expect("peer bind");
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        transport.add_route(Lid(1), peer.local_addr().unwrap());

        let addressing = Addressing {
            lid: Lid(1),
            ..Addressing::default()
        };
        let datagram = Datagram {
            tid: TransactionId(0x4200),
            method: Method::Get,
            attribute: 1,
            component_mask: 0,
            payload: vec![7; 8],
        };
        transport.send(PortGuid(1), &addressing, &datagram).expect("send");

        let mut buf = [0u8; 2048];
        let (len, from) = peer.recv_from(&mut buf).expect("peer recv");
        let request = Frame::decode(&buf[..len]).expect("decode request");
        assert_eq!(request.tid, TransactionId(0x4200));

        let reply = Frame::reply_to(&request, MadStatus::SUCCESS, vec![1, 2]);
        peer.send_to(&reply.encode().unwrap(), from).unwrap();

        let resp = transport.recv(Duration::from_secs(2)).expect("reply");
        assert_eq!(resp.tid, TransactionId(0x4200));
        assert_eq!(resp.port, PortGuid(1));
        assert_eq!(resp.payload, vec![1, 2]);
    }

    #[test]
    fn test_unrouted_lid_fails() {
        let transport = UdpTransport::bind(PortGuid(1), loopback_addr()).expect("bind");
        let datagram = Datagram {
            tid: TransactionId(1),
            method: Method::Get,
            attribute: 1,
            component_mask: 0,
            payload: Vec::new(),
        };
        assert!(matches!(
            transport.send(PortGuid(1), &Addressing::default(), &datagram),
            Err(SdError::SendFailed(_))
        ));
        assert!(transport.recv(Duration::from_millis(5)).is_none());
    }
}
