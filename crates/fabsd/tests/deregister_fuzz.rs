// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::unreadable_literal)] // Large test constants

//! Clients deregistering with requests and memberships outstanding.
//!
//! The seeded test interleaves registrations, requests, joins, out-of-order
//! peer answers and deregistrations on one thread, so "no callback after
//! deregister returned" can be checked exactly. The threaded test runs the
//! same mix against the real worker threads, where deregister has to wait
//! out callbacks already running on the service thread.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{activate, driver_with, group_record, PORT};
use fabsd::transport::SentDatagram;
use fabsd::{
    attr, ClientHandle, JoinState, MadStatus, McCallback, McFlags, McNotification, Method,
    Reply, Request, Result, SdParams,
};
use parking_lot::Mutex;

type Gone = Arc<Mutex<HashSet<ClientHandle>>>;

struct Watch {
    gone: Gone,
    violations: Arc<AtomicUsize>,
    callbacks: Arc<AtomicUsize>,
}

impl Watch {
    fn new() -> Self {
        Self {
            gone: Arc::new(Mutex::new(HashSet::new())),
            violations: Arc::new(AtomicUsize::new(0)),
            callbacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn check(&self, client: ClientHandle) -> impl Fn() + Send + Sync + 'static {
        let gone = Arc::clone(&self.gone);
        let violations = Arc::clone(&self.violations);
        let callbacks = Arc::clone(&self.callbacks);
        move || {
            callbacks.fetch_add(1, Ordering::SeqCst);
            if gone.lock().contains(&client) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn join_state(rng: &mut fastrand::Rng) -> JoinState {
    match rng.u8(0..3) {
        0 => JoinState::FULL_MEMBER,
        1 => JoinState::NON_MEMBER,
        _ => JoinState::SEND_ONLY,
    }
}

fn run_seed(seed: u64) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let (driver, transport) = driver_with(SdParams::new());
    activate(&driver, &transport);
    let watch = Watch::new();
    let mut live: Vec<ClientHandle> = Vec::new();
    let mut unanswered: Vec<SentDatagram> = Vec::new();
    let base = Instant::now();
    let mut clock = 0u64;

    for _ in 0..300 {
        match rng.u8(0..7) {
            0 => live.push(driver.register(None).unwrap()),
            1 if !live.is_empty() => {
                let client = live[rng.usize(0..live.len())];
                let check = watch.check(client);
                driver
                    .send_request(
                        client,
                        PORT,
                        Request::new(Method::Get, attr::NODE_RECORD, vec![rng.u8(..); 4]),
                        Box::new(move |_: Result<Reply>| check()),
                    )
                    .unwrap();
            }
            2 if !live.is_empty() => {
                let client = live[rng.usize(0..live.len())];
                let check = watch.check(client);
                let callback: McCallback = Arc::new(move |_: &McNotification| check());
                let flags = if rng.bool() {
                    McFlags::WANT_UNAVAILABLE
                } else {
                    McFlags::NONE
                };
                // Duplicate joins are expected and refused.
                let _ = driver.join_group(
                    client,
                    flags,
                    0,
                    group_record(rng.u64(0..3), join_state(&mut rng)),
                    PORT,
                    callback,
                );
            }
            3 if !live.is_empty() => {
                let client = live.swap_remove(rng.usize(0..live.len()));
                driver.deregister(client).unwrap();
                watch.gone.lock().insert(client);
            }
            4 => {
                unanswered.extend(transport.take_sent());
                rng.shuffle(&mut unanswered);
                let keep = rng.usize(0..=unanswered.len());
                for sent in unanswered.drain(keep..) {
                    let status = if rng.u8(0..10) == 0 {
                        MadStatus::BUSY
                    } else {
                        MadStatus::SUCCESS
                    };
                    transport.deliver(sent.reply(status, sent.datagram.payload.clone()));
                }
            }
            5 => {
                clock += rng.u64(0..3);
                driver.pump(base + Duration::from_secs(clock));
            }
            _ => {
                if let Some(client) = live.last().copied() {
                    if let Some(group) = driver.subscriptions(client).unwrap().first() {
                        driver.leave_group(client, group).unwrap();
                    }
                }
            }
        }
    }

    for client in live.drain(..) {
        driver.deregister(client).unwrap();
        watch.gone.lock().insert(client);
    }
    for _ in 0..20 {
        unanswered.extend(transport.take_sent());
        for sent in unanswered.drain(..) {
            transport.deliver(sent.reply(MadStatus::SUCCESS, sent.datagram.payload.clone()));
        }
        clock += 6;
        driver.pump(base + Duration::from_secs(clock));
        if driver.multicast().table_sizes() == (0, 0)
            && transport.pending_sent() == 0
            && driver.engine().stats().pending == 0
        {
            break;
        }
    }

    assert_eq!(
        watch.violations.load(Ordering::SeqCst),
        0,
        "seed {}: callback ran for a deregistered client",
        seed
    );
    assert_eq!(
        driver.multicast().table_sizes(),
        (0, 0),
        "seed {}: multicast tables did not drain",
        seed
    );
    assert_eq!(driver.engine().stats().pending, 0, "seed {}", seed);
}

#[test]
fn test_seeded_deregistration_interleavings() {
    for seed in 0..32 {
        run_seed(seed);
    }
}

#[test]
fn test_threaded_churn_drains() {
    let mut params = SdParams::new();
    params.mc_retry_delay = Duration::from_millis(5);
    params.mc_maintenance_interval = Duration::from_millis(20);
    params.max_outstanding = 8;
    let (driver, transport) = driver_with(params);
    activate(&driver, &transport);
    transport.set_responder(|sent| {
        vec![sent.reply(MadStatus::SUCCESS, sent.datagram.payload.clone())]
    });
    driver.start().unwrap();
    let driver = Arc::new(driver);
    let watch = Arc::new(Watch::new());

    let workers: Vec<_> = (0..4u64)
        .map(|w| {
            let driver = Arc::clone(&driver);
            let watch = Arc::clone(&watch);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(1000 + w);
                for _ in 0..50 {
                    let client = driver.register(None).unwrap();
                    for _ in 0..rng.usize(1..4) {
                        let check = watch.check(client);
                        driver
                            .send_request(
                                client,
                                PORT,
                                Request::new(Method::Get, attr::NODE_RECORD, vec![0; 4]),
                                Box::new(move |_: Result<Reply>| check()),
                            )
                            .unwrap();
                    }
                    let check = watch.check(client);
                    let callback: McCallback = Arc::new(move |_: &McNotification| check());
                    driver
                        .join_group(
                            client,
                            McFlags::WANT_UNAVAILABLE,
                            0,
                            group_record(rng.u64(0..4), join_state(&mut rng)),
                            PORT,
                            callback,
                        )
                        .unwrap();
                    if rng.bool() {
                        thread::sleep(Duration::from_millis(rng.u64(0..3)));
                    }
                    driver.deregister(client).unwrap();
                    watch.gone.lock().insert(client);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while driver.multicast().table_sizes() != (0, 0) || driver.engine().stats().pending != 0 {
        assert!(Instant::now() < deadline, "tables did not drain");
        thread::sleep(Duration::from_millis(10));
    }
    driver.shutdown();
    assert!(!driver.is_running());
    assert_eq!(
        watch.violations.load(Ordering::SeqCst),
        0,
        "callback started after deregister returned"
    );
}
