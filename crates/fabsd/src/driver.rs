// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subnet driver: the public face of the crate.
//!
//! Wires the client registry, port cache, query engine and multicast
//! manager together and runs two threads:
//!
//! ```text
//!   fabsd-recv     transport.recv(wait) -> engine.on_response
//!                  engine.on_timer      -> next clamped wait
//!
//!   fabsd-service  engine.process_completions  (client + multicast callbacks)
//!                  mc.poll_timers / deliver_notifications
//!                  wake.wait_timeout(next multicast timer)
//! ```
//!
//! Without [`SubnetDriver::start`] nothing runs on its own and the caller
//! drives both loops through [`SubnetDriver::pump`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{RuntimeConfig, SdParams};
use crate::context::{BatchCallback, ReplyCallback};
use crate::error::{Result, SdError};
use crate::metrics::{MetricsSnapshot, SdMetrics};
use crate::multicast::{GroupId, JoinVersion, McCallback, McFlags, McManager, McMemberRecord, TopologyTrap};
use crate::port::{CaPortCache, PortAttributes};
use crate::query::{QueryEngine, Submitted};
use crate::registry::ClientRegistry;
use crate::transport::Transport;
use crate::types::{ClientHandle, PortGuid, Request, RetryPolicy, TransactionId};
use crate::wake::WakeNotifier;

/// Notification from the port discovery side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortEvent {
    /// Port came up (or was first discovered).
    Active(PortGuid, PortAttributes),
    /// LID, SM LID or P-Key table changed.
    AddressingChanged(PortGuid, PortAttributes),
    PortDown(PortGuid),
    /// Port vanished (device removed).
    Removed(PortGuid),
    Trap(TopologyTrap),
}

struct Shared {
    config: Arc<RuntimeConfig>,
    clients: Arc<ClientRegistry>,
    ports: Arc<CaPortCache>,
    transport: Arc<dyn Transport>,
    engine: Arc<QueryEngine>,
    mc: McManager,
    wake: Arc<WakeNotifier>,
    metrics: Arc<SdMetrics>,
}

impl Shared {
    fn receive_loop(&self) {
        log::debug!("[DRV] receive thread running");
        let mut wait = self.config.params().max_receive_wait;
        while !self.wake.is_stopping() {
            if let Some(response) = self.transport.recv(wait) {
                self.engine.on_response(response, Instant::now());
            }
            wait = self.engine.on_timer(Instant::now());
        }
        log::debug!("[DRV] receive thread exiting");
    }

    fn service_loop(&self) {
        log::debug!("[DRV] service thread running");
        while !self.wake.is_stopping() {
            let wait = self.service_round(Instant::now());
            self.wake.wait_timeout(wait);
        }
        log::debug!("[DRV] service thread exiting");
    }

    /// Completions, then multicast timers and notifications. Returns how
    /// long the service side may sleep.
    fn service_round(&self, now: Instant) -> Duration {
        self.engine.process_completions();
        let next = self.mc.poll_timers(now);
        self.mc.deliver_notifications();
        let idle = self.config.params().max_receive_wait;
        next.map_or(idle, |due| due.saturating_duration_since(now).min(idle))
    }
}

/// Subnet administration client.
pub struct SubnetDriver {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SubnetDriver {
    #[must_use]
    pub fn new(config: Arc<RuntimeConfig>, transport: Arc<dyn Transport>) -> Self {
        let clients = Arc::new(ClientRegistry::new());
        let ports = Arc::new(CaPortCache::new());
        let wake = Arc::new(WakeNotifier::new());
        let metrics = Arc::new(SdMetrics::new());
        let engine = Arc::new(QueryEngine::new(
            Arc::clone(&ports),
            Arc::clone(&clients),
            Arc::clone(&transport),
            Arc::clone(&config),
            Arc::clone(&metrics),
            Arc::clone(&wake),
        ));
        let mc = McManager::new(
            Arc::clone(&engine),
            Arc::clone(&clients),
            Arc::clone(&ports),
            Arc::clone(&config),
            Arc::clone(&wake),
        );
        Self {
            shared: Arc::new(Shared {
                config,
                clients,
                ports,
                transport,
                engine,
                mc,
                wake,
                metrics,
            }),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Validate `params` and build a driver around them.
    pub fn with_params(params: SdParams, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = Arc::new(RuntimeConfig::new(params)?);
        Ok(Self::new(config, transport))
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    /// Spawn the receive and service threads.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SdError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SdError::InvalidState("driver already started".into()));
        }
        let recv = Arc::clone(&self.shared);
        let recv_thread = thread::Builder::new()
            .name("fabsd-recv".to_string())
            .spawn(move || recv.receive_loop())?;
        let service = Arc::clone(&self.shared);
        let service_thread = match thread::Builder::new()
            .name("fabsd-service".to_string())
            .spawn(move || service.service_loop())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.wake.stop();
                let _ = recv_thread.join();
                return Err(e.into());
            }
        };
        self.threads.lock().extend([recv_thread, service_thread]);
        log::info!("[DRV] started");
        Ok(())
    }

    /// One synchronous round of both loops, for callers that run without
    /// threads. Drains whatever the transport already holds. Returns how
    /// long the caller may wait before the next round.
    pub fn pump(&self, now: Instant) -> Duration {
        while let Some(response) = self.shared.transport.recv(Duration::ZERO) {
            self.shared.engine.on_response(response, now);
        }
        let receive_wait = self.shared.engine.on_timer(now);
        let service_wait = self.shared.service_round(now);
        receive_wait.min(service_wait)
    }

    /// Stop the threads and fail everything still outstanding with
    /// `Shutdown`. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.wake.stop();
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("[DRV] worker thread panicked");
            }
        }
        let failed = self.shared.engine.shutdown();
        log::info!("[DRV] shut down ({} requests failed over)", failed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(SdError::Shutdown)
        } else {
            Ok(())
        }
    }

    // ====================================================================
    // Clients
    // ====================================================================

    /// Register a client. `None` takes the configured default policy.
    pub fn register(&self, policy: Option<RetryPolicy>) -> Result<ClientHandle> {
        self.ensure_open()?;
        let policy = policy.unwrap_or(self.shared.config.params().default_policy);
        self.shared.clients.register(policy)
    }

    /// Deregister a client: cancel its requests and drop its memberships.
    ///
    /// Callbacks of the handle that are already running finish before this
    /// returns, and none start afterwards. Called from inside a callback it
    /// does not wait, so the calling callback is the one exception.
    pub fn deregister(&self, client: ClientHandle) -> Result<()> {
        if self.shared.clients.is_internal(client) {
            return Err(SdError::InvalidParameter("internal handle".into()));
        }
        let gate = self.shared.clients.deregister(client)?;
        let cancelled = self.shared.engine.cancel_all(client);
        let memberships = self.shared.mc.remove_client(client);
        gate.wait_idle();
        log::debug!(
            "[DRV] {} gone ({} requests cancelled, {} memberships dropped)",
            client,
            cancelled,
            memberships
        );
        Ok(())
    }

    pub fn control_params(&self, client: ClientHandle) -> Result<RetryPolicy> {
        self.shared.clients.control_params(client)
    }

    pub fn set_control_params(&self, client: ClientHandle, policy: RetryPolicy) -> Result<()> {
        self.shared.clients.set_control_params(client, policy)
    }

    // ====================================================================
    // Requests
    // ====================================================================

    pub fn send_request(
        &self,
        client: ClientHandle,
        port: PortGuid,
        request: Request,
        callback: ReplyCallback,
    ) -> Result<Submitted> {
        self.ensure_open()?;
        self.shared.engine.submit(client, port, request, callback)
    }

    pub fn send_batch(
        &self,
        client: ClientHandle,
        port: PortGuid,
        requests: Vec<Request>,
        callback: BatchCallback,
    ) -> Result<TransactionId> {
        self.ensure_open()?;
        self.shared.engine.submit_batch(client, port, requests, callback)
    }

    // ====================================================================
    // Multicast
    // ====================================================================

    /// Join a group through an explicit egress port.
    pub fn join_group(
        &self,
        client: ClientHandle,
        flags: McFlags,
        component_mask: u64,
        record: McMemberRecord,
        egress: PortGuid,
        callback: McCallback,
    ) -> Result<GroupId> {
        self.ensure_open()?;
        self.shared.clients.validate(client)?;
        self.shared.mc.join(
            client,
            JoinVersion::V2,
            flags,
            component_mask,
            record,
            Some(egress),
            callback,
        )
    }

    /// Join a group on the port named by the record's port GID.
    pub fn join_group_v1(
        &self,
        client: ClientHandle,
        flags: McFlags,
        component_mask: u64,
        record: McMemberRecord,
        callback: McCallback,
    ) -> Result<GroupId> {
        self.ensure_open()?;
        self.shared.clients.validate(client)?;
        self.shared
            .mc
            .join(client, JoinVersion::V1, flags, component_mask, record, None, callback)
    }

    pub fn leave_group(&self, client: ClientHandle, group: &GroupId) -> Result<()> {
        self.shared.clients.validate(client)?;
        self.shared.mc.leave(client, group)
    }

    pub fn subscriptions(&self, client: ClientHandle) -> Result<Vec<GroupId>> {
        self.shared.clients.validate(client)?;
        Ok(self.shared.mc.subscriptions(client))
    }

    // ====================================================================
    // Discovery
    // ====================================================================

    pub fn handle_event(&self, event: PortEvent) {
        let shared = &self.shared;
        match event {
            PortEvent::Active(port, attrs) | PortEvent::AddressingChanged(port, attrs) => {
                let update = shared.ports.update(port, &attrs);
                if !update.valid {
                    log::debug!("[DRV] {} not addressable yet", port);
                    return;
                }
                if update.became_valid {
                    log::info!("[DRV] {} addressable (sm_lid={})", port, attrs.sm_lid.0);
                }
                if let Err(e) = shared.engine.learn_class_port_info(port) {
                    log::warn!("[DRV] class-port-info on {} not started: {}", port, e);
                }
                shared.engine.kick_port(port);
                shared.mc.port_addressing_changed(port);
            }
            PortEvent::PortDown(port) => {
                shared.ports.invalidate(port);
                shared.mc.port_down(port);
            }
            PortEvent::Removed(port) => {
                shared.mc.port_down(port);
                if shared.ports.remove(port).is_some() {
                    log::info!("[DRV] {} removed", port);
                }
            }
            PortEvent::Trap(trap) => shared.mc.on_trap(trap),
        }
        shared.wake.notify();
    }

    // ====================================================================
    // Introspection
    // ====================================================================

    #[must_use]
    pub fn local_ports(&self) -> Vec<PortGuid> {
        self.shared.ports.local_ports()
    }

    #[must_use]
    pub fn default_port(&self) -> Option<PortGuid> {
        self.shared.ports.default_port()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Runtime configuration; updates apply to work started afterwards.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn engine(&self) -> &QueryEngine {
        &self.shared.engine
    }

    #[must_use]
    pub fn multicast(&self) -> &McManager {
        &self.shared.mc
    }
}

impl Drop for SubnetDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::{JoinState, McGroupState, McNotification};
    use crate::transport::LoopbackTransport;
    use crate::types::{attr, Gid, Lid, MadStatus, Method, Reply};

    const PORT: PortGuid = PortGuid(0x0002_c903_0000_0001);

    fn attrs(base_lid: u16) -> PortAttributes {
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

    fn driver() -> (SubnetDriver, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let driver = SubnetDriver::with_params(SdParams::new(), transport.clone()).unwrap();
        (driver, transport)
    }

    /// Answer class-port-info with "no redirect", everything else by echo.
    fn echo_responder(transport: &LoopbackTransport) {
        transport.set_responder(|sent| {
            vec![sent.reply(MadStatus::SUCCESS, sent.datagram.payload.clone())]
        });
    }

    #[test]
    fn test_port_active_learns_class_port_info() {
        let (driver, transport) = driver();
        driver.handle_event(PortEvent::Active(PORT, attrs(3)));
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].datagram.attribute, attr::CLASS_PORT_INFO);
        assert_eq!(driver.local_ports(), vec![PORT]);
        assert_eq!(driver.default_port(), Some(PORT));
    }

    #[test]
    fn test_request_round_trip_through_pump() {
        let (driver, transport) = driver();
        echo_responder(&transport);
        driver.handle_event(PortEvent::Active(PORT, attrs(3)));
        driver.pump(Instant::now());

        let client = driver.register(None).unwrap();
        let got: Arc<Mutex<Option<Result<Reply>>>> = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        driver
            .send_request(
                client,
                PORT,
                Request::new(Method::Get, attr::NODE_RECORD, vec![7; 4]),
                Box::new(move |r| *g.lock() = Some(r)),
            )
            .unwrap();
        driver.pump(Instant::now());
        let reply = got.lock().take().unwrap().unwrap();
        assert_eq!(reply.payload, vec![7; 4]);
        assert_eq!(driver.metrics().completed, 1);
    }

    #[test]
    fn test_deregister_drops_memberships_and_handle() {
        let (driver, transport) = driver();
        echo_responder(&transport);
        driver.handle_event(PortEvent::Active(PORT, attrs(3)));
        let client = driver.register(None).unwrap();
        let record = McMemberRecord::new(
            Gid::new(0xff12_401b_ffff_0000, 1),
            Gid::new(0xfe80_0000_0000_0000, PORT.0),
            JoinState::FULL_MEMBER,
        );
        let cb: McCallback = Arc::new(|_: &McNotification| {});
        let id = driver
            .join_group(client, McFlags::NONE, 0, record, PORT, cb)
            .unwrap();
        assert_eq!(driver.subscriptions(client).unwrap(), vec![id]);

        driver.deregister(client).unwrap();
        assert!(matches!(driver.subscriptions(client), Err(SdError::NotFound)));
        assert!(matches!(driver.deregister(client), Err(SdError::NotFound)));
        assert!(matches!(
            driver.deregister(driver.multicast().internal_handle()),
            Err(SdError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_port_down_marks_groups_unavailable() {
        let (driver, transport) = driver();
        echo_responder(&transport);
        driver.handle_event(PortEvent::Active(PORT, attrs(3)));
        let client = driver.register(None).unwrap();
        let record = McMemberRecord::new(
            Gid::new(0xff12_401b_ffff_0000, 2),
            Gid::new(0xfe80_0000_0000_0000, PORT.0),
            JoinState::FULL_MEMBER,
        );
        let cb: McCallback = Arc::new(|_: &McNotification| {});
        let id = driver
            .join_group(client, McFlags::WANT_UNAVAILABLE, 0, record, PORT, cb)
            .unwrap();
        let later = Instant::now() + Duration::from_secs(2);
        driver.pump(later);
        driver.pump(later);
        assert_eq!(
            driver.multicast().group_state(&id),
            Some(McGroupState::Available)
        );

        driver.handle_event(PortEvent::PortDown(PORT));
        assert_eq!(
            driver.multicast().group_state(&id),
            Some(McGroupState::Unavailable)
        );
    }

    #[test]
    fn test_shutdown_with_join_in_flight_reports_unavailable() {
        let (driver, transport) = driver();
        driver.handle_event(PortEvent::Active(PORT, attrs(3)));
        let client = driver.register(None).unwrap();
        let record = McMemberRecord::new(
            Gid::new(0xff12_401b_ffff_0000, 3),
            Gid::new(0xfe80_0000_0000_0000, PORT.0),
            JoinState::FULL_MEMBER,
        );
        let seen: Arc<Mutex<Vec<McGroupState>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let cb: McCallback = Arc::new(move |n: &McNotification| s.lock().push(n.state));
        driver
            .join_group(client, McFlags::WANT_UNAVAILABLE, 0, record, PORT, cb)
            .unwrap();
        driver.pump(Instant::now() + Duration::from_secs(2));
        assert!(transport
            .take_sent()
            .iter()
            .any(|s| s.datagram.attribute == attr::MCMEMBER_RECORD));

        driver.shutdown();
        assert_eq!(*seen.lock(), vec![McGroupState::Unavailable]);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let (driver, _transport) = driver();
        driver.start().unwrap();
        assert!(driver.is_running());
        assert!(matches!(driver.start(), Err(SdError::InvalidState(_))));
        driver.shutdown();
        driver.shutdown();
        assert!(!driver.is_running());
        assert!(matches!(driver.register(None), Err(SdError::Shutdown)));
        assert!(matches!(driver.start(), Err(SdError::Shutdown)));
    }
}
