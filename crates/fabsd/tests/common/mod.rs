// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use fabsd::{
    Gid, JoinState, Lid, LoopbackTransport, MadStatus, McCallback, McGroupState, McMemberRecord,
    McNotification, PortAttributes, PortEvent, PortGuid, Reply, ReplyCallback, Result, SdParams,
    SubnetDriver,
};
use parking_lot::Mutex;

pub const PORT: PortGuid = PortGuid(0x0002_c903_0000_0001);

pub fn attrs(base_lid: u16) -> PortAttributes {
    PortAttributes {
        ca_guid: 0x0002_c903_0000_0000,
        subnet_prefix: 0xfe80_0000_0000_0000,
        base_lid: Lid(base_lid),
        sm_lid: Lid(1),
        sm_sl: 0,
        static_rate: 0,
        pkey_index: 0,
        active: true,
    }
}

pub fn driver_with(params: SdParams) -> (SubnetDriver, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new());
    let driver = SubnetDriver::with_params(params, transport.clone()).expect("driver");
    (driver, transport)
}

/// Reply to everything sent so far by echoing its payload. Returns how many
/// replies were queued.
pub fn answer_all(transport: &LoopbackTransport, status: MadStatus) -> usize {
    let sent = transport.take_sent();
    for s in &sent {
        transport.deliver(s.reply(status, s.datagram.payload.clone()));
    }
    sent.len()
}

/// Bring `PORT` up and finish its class-port-info exchange.
pub fn activate(driver: &SubnetDriver, transport: &LoopbackTransport) {
    driver.handle_event(PortEvent::Active(PORT, attrs(3)));
    assert_eq!(answer_all(transport, MadStatus::SUCCESS), 1);
    driver.pump(Instant::now());
}

pub fn group_record(group: u64, join_state: JoinState) -> McMemberRecord {
    McMemberRecord::new(
        Gid::new(0xff12_401b_ffff_0000, group),
        Gid::new(0xfe80_0000_0000_0000, PORT.0),
        join_state,
    )
}

pub type Replies = Arc<Mutex<Vec<Result<Reply>>>>;

pub fn sink() -> (Replies, ReplyCallback) {
    let replies: Replies = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&replies);
    (replies, Box::new(move |res| r.lock().push(res)))
}

pub type States = Arc<Mutex<Vec<McGroupState>>>;

pub fn notifications() -> (States, McCallback) {
    let states: States = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&states);
    let callback: McCallback = Arc::new(move |n: &McNotification| s.lock().push(n.state));
    (states, callback)
}
