// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory transport.
//!
//! Every send is recorded on a channel the caller drains to act as the
//! remote peer; responses are injected with [`LoopbackTransport::deliver`].
//! An optional responder closure answers sends synchronously, and send
//! failures can be scripted.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::{Datagram, Response, Transport};
use crate::error::{Result, SdError};
use crate::port::Addressing;
use crate::types::{MadStatus, PortGuid};

/// One datagram captured by the loopback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentDatagram {
    pub port: PortGuid,
    pub addressing: Addressing,
    pub datagram: Datagram,
}

impl SentDatagram {
    /// Build a single-datagram reply to this send.
    #[must_use]
    pub fn reply(&self, status: MadStatus, payload: Vec<u8>) -> Response {
        Response::reply(self.port, self.datagram.tid, status, payload)
    }
}

type Responder = Box<dyn Fn(&SentDatagram) -> Vec<Response> + Send + Sync>;

/// Channel-backed transport for tests and simulations.
pub struct LoopbackTransport {
    sent_tx: Sender<SentDatagram>,
    sent_rx: Receiver<SentDatagram>,
    inbound_tx: Sender<Response>,
    inbound_rx: Receiver<Response>,
    scripted_failures: Mutex<VecDeque<SdError>>,
    responder: Mutex<Option<Responder>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = channel::unbounded();
        let (inbound_tx, inbound_rx) = channel::unbounded();
        Self {
            sent_tx,
            sent_rx,
            inbound_tx,
            inbound_rx,
            scripted_failures: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
        }
    }

    /// Queue an inbound response for the receive path.
    pub fn deliver(&self, response: Response) {
        // Both ends live in `self`, the channel cannot be disconnected.
        let _ = self.inbound_tx.send(response);
    }

    /// Drain every datagram sent so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        self.sent_rx.try_iter().collect()
    }

    /// Wait for the next sent datagram.
    #[must_use]
    pub fn next_sent(&self, timeout: Duration) -> Option<SentDatagram> {
        self.sent_rx.recv_timeout(timeout).ok()
    }

    /// Number of datagrams sent and not yet drained.
    #[must_use]
    pub fn pending_sent(&self) -> usize {
        self.sent_rx.len()
    }

    /// Make the next `send` fail with `err` (FIFO if called repeatedly).
    pub fn fail_next_send(&self, err: SdError) {
        self.scripted_failures.lock().push_back(err);
    }

    /// Answer every subsequent send with whatever `f` returns. Sends are
    /// still recorded.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&SentDatagram) -> Vec<Response> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(f));
    }

    pub fn clear_responder(&self) {
        *self.responder.lock() = None;
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, port: PortGuid, addressing: &Addressing, datagram: &Datagram) -> Result<()> {
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            log::trace!("[LOOP] scripted failure for tid={}: {}", datagram.tid, err);
            return Err(err);
        }
        let sent = SentDatagram {
            port,
            addressing: *addressing,
            datagram: datagram.clone(),
        };
        let replies = self
            .responder
            .lock()
            .as_ref()
            .map(|f| f(&sent))
            .unwrap_or_default();
        let _ = self.sent_tx.send(sent);
        for reply in replies {
            self.deliver(reply);
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Option<Response> {
        self.inbound_rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Method, TransactionId};

    fn dgram(tid: u64) -> Datagram {
        Datagram {
            tid: TransactionId(tid),
            method: Method::Get,
            attribute: 1,
            component_mask: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_records_and_delivers() {
        let lo = LoopbackTransport::new();
        lo.send(PortGuid(1), &Addressing::default(), &dgram(0x100)).unwrap();
        let sent = lo.take_sent();
        assert_eq!(sent.len(), 1);
        lo.deliver(sent[0].reply(MadStatus::SUCCESS, vec![1]));
        let resp = lo.recv(Duration::from_millis(10)).expect("queued reply");
        assert_eq!(resp.tid, TransactionId(0x100));
        assert!(lo.recv(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_scripted_failure_then_success() {
        let lo = LoopbackTransport::new();
        lo.fail_next_send(SdError::Busy);
        assert!(matches!(
            lo.send(PortGuid(1), &Addressing::default(), &dgram(1)),
            Err(SdError::Busy)
        ));
        assert!(lo.send(PortGuid(1), &Addressing::default(), &dgram(2)).is_ok());
        assert_eq!(lo.pending_sent(), 1);
    }

    #[test]
    fn test_responder_answers_sends() {
        let lo = LoopbackTransport::new();
        lo.set_responder(|s| vec![s.reply(MadStatus::BUSY, Vec::new())]);
        lo.send(PortGuid(1), &Addressing::default(), &dgram(5)).unwrap();
        let resp = lo.recv(Duration::from_millis(10)).unwrap();
        assert_eq!(resp.tid, TransactionId(5));
        lo.clear_responder();
        lo.send(PortGuid(1), &Addressing::default(), &dgram(6)).unwrap();
        assert!(lo.recv(Duration::from_millis(1)).is_none());
    }
}
