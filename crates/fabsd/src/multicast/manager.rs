// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group table, per-group timers and the maintenance sweep.
//!
//! Groups and client associations live in two maps under one mutex. A
//! record is only removed by the maintenance sweep, and only once it is
//! marked for deletion and its in-use count is zero. Fabric operations and
//! client notifications both happen with the mutex released; notifications
//! go through an outbox drained by [`McManager::deliver_notifications`].
//!
//! While the maintenance timer is armed the manager holds a subscription for
//! the subnet manager's group-created and group-deleted traps on every local
//! port. It is taken with the first group and dropped when the sweep leaves
//! both tables empty.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use super::inform::{InformInfo, GROUP_TRAPS};
use super::record::{mask, McMemberRecord};
use super::{
    GroupId, JoinState, JoinVersion, McCallback, McFlags, McGroupState, McNotification,
    TopologyTrap,
};
use crate::config::RuntimeConfig;
use crate::error::{Result, SdError};
use crate::port::CaPortCache;
use crate::query::QueryEngine;
use crate::registry::ClientRegistry;
use crate::types::{attr, ClientHandle, Gid, Method, PortGuid, Reply, Request};
use crate::wake::WakeNotifier;

type GroupKey = u64;
type AssocKey = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FabOp {
    Join,
    Leave,
}

struct Group {
    id: GroupId,
    record: McMemberRecord,
    component_mask: u64,
    state: McGroupState,
    /// Next join/leave issue time.
    timer: Option<Instant>,
    /// Operation handed to the engine and not yet answered.
    op: Option<FabOp>,
    /// Fabric currently holds our membership.
    joined: bool,
    /// Flags grew while a join was in flight.
    rejoin: bool,
    delete: bool,
    in_use: u32,
    clients: Vec<AssocKey>,
}

impl Group {
    fn queue(&mut self, state: McGroupState, at: Instant) {
        self.state = state;
        self.timer = Some(at);
    }

    fn request(&self, op: FabOp) -> Request {
        let method = match op {
            FabOp::Join => Method::Set,
            FabOp::Leave => Method::Delete,
        };
        Request::new(method, attr::MCMEMBER_RECORD, self.record.encode())
            .with_component_mask(self.component_mask | mask::REQUIRED)
    }
}

struct Association {
    client: ClientHandle,
    group: GroupKey,
    id: GroupId,
    flags: McFlags,
    callback: McCallback,
    /// Left or deregistered: never notified again.
    detached: bool,
    delete: bool,
    in_use: u32,
}

impl Association {
    fn is_active(&self) -> bool {
        !self.detached && !self.delete
    }
}

/// Notification waiting in the outbox. Holds one in-use count on both the
/// association and its group.
struct Outgoing {
    client: ClientHandle,
    assoc: AssocKey,
    group: GroupKey,
    callback: McCallback,
    note: McNotification,
}

struct Issue {
    group: GroupKey,
    op: FabOp,
    port: PortGuid,
    request: Request,
}

#[derive(Default)]
struct Tables {
    groups: HashMap<GroupKey, Group>,
    assocs: HashMap<AssocKey, Association>,
    next_key: u64,
    maintenance: Option<Instant>,
    outbox: Vec<Outgoing>,
}

impl Tables {
    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn next_due(&self) -> Option<Instant> {
        self.groups
            .values()
            .filter_map(|g| g.timer)
            .chain(self.maintenance)
            .min()
    }
}

/// Queue `state` for every active client of group `key` that wants it.
fn notify_group(
    key: GroupKey,
    group: &mut Group,
    assocs: &mut HashMap<AssocKey, Association>,
    outbox: &mut Vec<Outgoing>,
    state: McGroupState,
    reason: Option<String>,
) {
    let mut queued = 0u32;
    for akey in &group.clients {
        let Some(assoc) = assocs.get_mut(akey) else {
            continue;
        };
        if !assoc.is_active() {
            continue;
        }
        if state == McGroupState::Unavailable && !assoc.flags.want_unavailable() {
            continue;
        }
        assoc.in_use += 1;
        queued += 1;
        outbox.push(Outgoing {
            client: assoc.client,
            assoc: *akey,
            group: key,
            callback: Arc::clone(&assoc.callback),
            note: McNotification {
                group: assoc.id,
                state,
                record: group.record,
                reason: reason.clone(),
            },
        });
    }
    group.in_use += queued;
}

/// The last client is gone: make sure the fabric membership is released.
fn retire_group(group: &mut Group, at: Instant) {
    group.delete = true;
    let idle = group.op.is_none() && group.timer.is_none();
    if group.state == McGroupState::Available || (group.joined && idle) {
        group.queue(McGroupState::RequestLeave, at);
    }
}

struct McCore {
    tables: Mutex<Tables>,
    /// Trap subscription currently held. Lock order: `traps` before `tables`.
    traps: Mutex<bool>,
    engine: Arc<QueryEngine>,
    clients: Arc<ClientRegistry>,
    ports: Arc<CaPortCache>,
    config: Arc<RuntimeConfig>,
    wake: Arc<WakeNotifier>,
    handle: ClientHandle,
}

/// Multicast membership manager.
pub struct McManager {
    core: Arc<McCore>,
}

impl McManager {
    /// Create the manager and register its internal engine client.
    #[must_use]
    pub fn new(
        engine: Arc<QueryEngine>,
        clients: Arc<ClientRegistry>,
        ports: Arc<CaPortCache>,
        config: Arc<RuntimeConfig>,
        wake: Arc<WakeNotifier>,
    ) -> Self {
        let handle = clients.register_internal(config.params().default_policy);
        Self {
            core: Arc::new(McCore {
                tables: Mutex::new(Tables::default()),
                traps: Mutex::new(false),
                engine,
                clients,
                ports,
                config,
                wake,
                handle,
            }),
        }
    }

    /// Engine client the manager issues its operations as.
    #[must_use]
    pub fn internal_handle(&self) -> ClientHandle {
        self.core.handle
    }

    // ====================================================================
    // Client API
    // ====================================================================

    /// Join `record.mgid` on behalf of `client`.
    ///
    /// V1 derives the egress port from the record's port GID and ignores
    /// `egress`; V2 requires it. The first client of a group triggers the
    /// fabric join after the group retry delay; later clients either ride on
    /// the existing membership or, when they ask for kinds not yet covered,
    /// trigger one re-join.
    #[allow(clippy::too_many_arguments)]
    pub fn join(
        &self,
        client: ClientHandle,
        version: JoinVersion,
        flags: McFlags,
        component_mask: u64,
        record: McMemberRecord,
        egress: Option<PortGuid>,
        callback: McCallback,
    ) -> Result<GroupId> {
        if record.join_state.is_empty() {
            return Err(SdError::InvalidParameter("empty join state".into()));
        }
        let egress = match version {
            JoinVersion::V1 => PortGuid(record.port_gid.interface_id()),
            JoinVersion::V2 => egress
                .ok_or_else(|| SdError::InvalidParameter("egress port required".into()))?,
        };
        if !self.core.ports.is_known(egress) {
            return Err(SdError::NotFound);
        }
        let id = GroupId {
            version,
            mgid: record.mgid,
            port_gid: record.port_gid,
            egress,
        };
        let params = self.core.config.params();
        let now = Instant::now();

        let mut guard = self.core.tables.lock();
        let tables = &mut *guard;
        if tables
            .assocs
            .values()
            .any(|a| a.client == client && a.is_active() && a.id.same_group(&id))
        {
            return Err(SdError::Duplicate);
        }

        let existing = tables
            .groups
            .iter()
            .filter(|(_, g)| !g.delete && g.id.same_group(&id))
            .map(|(k, _)| *k)
            .max();

        let akey = tables.key();
        let gkey = match existing {
            Some(gkey) => gkey,
            None => {
                let gkey = tables.key();
                tables.groups.insert(
                    gkey,
                    Group {
                        id,
                        record,
                        component_mask: component_mask | mask::REQUIRED,
                        state: McGroupState::RequestJoin,
                        timer: Some(now + params.mc_retry_delay),
                        op: None,
                        joined: false,
                        rejoin: false,
                        delete: false,
                        in_use: 0,
                        clients: Vec::new(),
                    },
                );
                log::debug!("[MC] new group {} ({}), join queued", id, record.join_state);
                gkey
            }
        };
        tables.assocs.insert(
            akey,
            Association {
                client,
                group: gkey,
                id,
                flags,
                callback,
                detached: false,
                delete: false,
                in_use: 0,
            },
        );

        let Tables {
            groups,
            assocs,
            outbox,
            maintenance,
            ..
        } = tables;
        if let Some(group) = groups.get_mut(&gkey) {
            group.clients.push(akey);
            if existing.is_some() {
                group.component_mask |= component_mask;
                let grew = group.record.join_state.accumulate(record.join_state);
                match group.state {
                    McGroupState::Available if grew => {
                        log::debug!("[MC] {} flags now {}, re-joining", id, group.record.join_state);
                        group.queue(McGroupState::RequestJoin, now + params.mc_retry_delay);
                    }
                    McGroupState::Available => {
                        if let Some(assoc) = assocs.get_mut(&akey) {
                            assoc.in_use += 1;
                            group.in_use += 1;
                            outbox.push(Outgoing {
                                client,
                                assoc: akey,
                                group: gkey,
                                callback: Arc::clone(&assoc.callback),
                                note: McNotification {
                                    group: id,
                                    state: McGroupState::Available,
                                    record: group.record,
                                    reason: None,
                                },
                            });
                        }
                    }
                    McGroupState::RequestJoin if grew && group.op.is_some() => {
                        group.rejoin = true;
                    }
                    _ => {}
                }
            }
        }
        if maintenance.is_none() {
            *maintenance = Some(now + params.mc_maintenance_interval);
        }
        drop(guard);

        log::debug!("[MC] {} joined {}", client, id);
        self.core.sync_trap_subscription();
        self.core.wake.notify();
        Ok(id)
    }

    /// Drop `client`'s membership matching `group` (V1 ids match on MGID).
    pub fn leave(&self, client: ClientHandle, group: &GroupId) -> Result<()> {
        let at = Instant::now() + self.core.config.params().mc_retry_delay;
        let mut tables = self.core.tables.lock();
        let akey = tables
            .assocs
            .iter()
            .filter(|(_, a)| a.client == client && a.is_active() && group.leave_matches(&a.id))
            .map(|(k, _)| *k)
            .min()
            .ok_or(SdError::NotFound)?;
        detach(&mut tables, akey, at);
        drop(tables);
        log::debug!("[MC] {} left {}", client, group);
        self.core.wake.notify();
        Ok(())
    }

    /// Detach every membership of a deregistering client. Returns how many
    /// were dropped.
    pub fn remove_client(&self, client: ClientHandle) -> usize {
        let at = Instant::now() + self.core.config.params().mc_retry_delay;
        let mut tables = self.core.tables.lock();
        let keys: Vec<AssocKey> = tables
            .assocs
            .iter()
            .filter(|(_, a)| a.client == client && !a.detached)
            .map(|(k, _)| *k)
            .collect();
        for akey in &keys {
            detach(&mut tables, *akey, at);
        }
        drop(tables);
        if !keys.is_empty() {
            log::debug!("[MC] dropped {} memberships of {}", keys.len(), client);
            self.core.wake.notify();
        }
        keys.len()
    }

    /// Live memberships of `client`, oldest first.
    #[must_use]
    pub fn subscriptions(&self, client: ClientHandle) -> Vec<GroupId> {
        let tables = self.core.tables.lock();
        let mut found: Vec<(AssocKey, GroupId)> = tables
            .assocs
            .iter()
            .filter(|(_, a)| a.client == client && a.is_active())
            .map(|(k, a)| (*k, a.id))
            .collect();
        found.sort_unstable_by_key(|(k, _)| *k);
        found.into_iter().map(|(_, id)| id).collect()
    }

    // ====================================================================
    // Timers
    // ====================================================================

    /// Issue due joins and leaves and run the maintenance sweep when due.
    /// Returns the next time anything is due.
    pub fn poll_timers(&self, now: Instant) -> Option<Instant> {
        let params = self.core.config.params();
        let mut issues = Vec::new();
        let next = {
            let mut tables = self.core.tables.lock();
            for (key, group) in tables.groups.iter_mut() {
                match group.timer {
                    Some(due) if due <= now => group.timer = None,
                    _ => continue,
                }
                if group.op.is_some() {
                    group.timer = Some(now + params.mc_retry_delay);
                    continue;
                }
                let op = match group.state {
                    McGroupState::RequestJoin if group.delete => {
                        if group.joined {
                            group.state = McGroupState::RequestLeave;
                            Some(FabOp::Leave)
                        } else {
                            None
                        }
                    }
                    McGroupState::RequestJoin => Some(FabOp::Join),
                    McGroupState::RequestLeave => Some(FabOp::Leave),
                    _ => None,
                };
                if let Some(op) = op {
                    group.op = Some(op);
                    group.in_use += 1;
                    issues.push(Issue {
                        group: *key,
                        op,
                        port: group.id.egress,
                        request: group.request(op),
                    });
                }
            }
            if matches!(tables.maintenance, Some(due) if due <= now) {
                sweep(&mut tables, now + params.mc_retry_delay);
                tables.maintenance = if tables.groups.is_empty() && tables.assocs.is_empty() {
                    log::debug!("[MC] tables empty, maintenance disarmed");
                    None
                } else {
                    Some(now + params.mc_maintenance_interval)
                };
            }
            tables.next_due()
        };
        for issue in issues {
            self.core.issue(issue);
        }
        self.core.sync_trap_subscription();
        next
    }

    /// Run every queued notification. Returns how many callbacks ran.
    pub fn deliver_notifications(&self) -> usize {
        self.core.deliver_notifications()
    }

    // ====================================================================
    // Topology
    // ====================================================================

    /// Port addressing changed: re-join every group egressing there.
    pub fn port_addressing_changed(&self, port: PortGuid) -> usize {
        let at = Instant::now() + self.core.config.params().mc_retry_delay;
        let mut tables = self.core.tables.lock();
        let mut count = 0;
        for group in tables.groups.values_mut() {
            if group.delete || group.id.egress != port {
                continue;
            }
            if matches!(
                group.state,
                McGroupState::RequestJoin | McGroupState::Available | McGroupState::Unavailable
            ) {
                group.queue(McGroupState::RequestJoin, at);
                count += 1;
            }
        }
        drop(tables);
        if count > 0 {
            log::debug!("[MC] {} groups re-queued on {}", count, port);
            self.core.wake.notify();
        }
        count
    }

    /// Port went down: every group on it is unavailable right away.
    pub fn port_down(&self, port: PortGuid) -> usize {
        let mut guard = self.core.tables.lock();
        let Tables {
            groups,
            assocs,
            outbox,
            ..
        } = &mut *guard;
        let mut count = 0;
        for (key, group) in groups.iter_mut() {
            if group.id.egress != port {
                continue;
            }
            if group.delete {
                // The membership died with the port: nothing left to leave.
                group.joined = false;
                group.rejoin = false;
                if group.op.is_none() {
                    group.state = McGroupState::Unavailable;
                    group.timer = None;
                }
                continue;
            }
            group.state = McGroupState::Unavailable;
            group.joined = false;
            group.rejoin = false;
            group.timer = None;
            notify_group(*key, group, assocs, outbox, McGroupState::Unavailable, None);
            count += 1;
        }
        drop(guard);
        if count > 0 {
            log::info!("[MC] port {} down, {} groups unavailable", port, count);
            self.core.wake.notify();
        }
        count
    }

    pub fn on_trap(&self, trap: TopologyTrap) {
        match trap {
            TopologyTrap::GroupCreated(mgid) => {
                let at = Instant::now() + self.core.config.params().mc_retry_delay;
                let mut tables = self.core.tables.lock();
                for group in tables.groups.values_mut() {
                    if !group.delete && group.id.mgid == mgid {
                        group.queue(McGroupState::RequestJoin, at);
                    }
                }
                drop(tables);
                self.core.wake.notify();
            }
            TopologyTrap::GroupDeleted(mgid) => {
                let tables = self.core.tables.lock();
                for group in tables.groups.values() {
                    if !group.delete && group.id.mgid == mgid {
                        log::error!(
                            "[MC] group {} deleted by the subnet manager with {} clients attached",
                            group.id,
                            group.clients.len()
                        );
                    }
                }
            }
        }
    }

    // ====================================================================
    // Introspection
    // ====================================================================

    /// State of the newest group record for `id`, deleted ones included.
    #[must_use]
    pub fn group_state(&self, id: &GroupId) -> Option<McGroupState> {
        let tables = self.core.tables.lock();
        tables
            .groups
            .iter()
            .filter(|(_, g)| g.id.same_group(id))
            .max_by_key(|(k, _)| **k)
            .map(|(_, g)| g.state)
    }

    /// Accumulated membership kinds of the live group for `id`.
    #[must_use]
    pub fn group_join_state(&self, id: &GroupId) -> Option<JoinState> {
        let tables = self.core.tables.lock();
        tables
            .groups
            .values()
            .find(|g| !g.delete && g.id.same_group(id))
            .map(|g| g.record.join_state)
    }

    /// (groups, associations) currently held, deleted ones included.
    #[must_use]
    pub fn table_sizes(&self) -> (usize, usize) {
        let tables = self.core.tables.lock();
        (tables.groups.len(), tables.assocs.len())
    }

    #[must_use]
    pub fn maintenance_armed(&self) -> bool {
        self.core.tables.lock().maintenance.is_some()
    }

    /// True while the group trap subscription is held.
    #[must_use]
    pub fn traps_subscribed(&self) -> bool {
        *self.core.traps.lock()
    }

    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.core.tables.lock().next_due()
    }

    /// Groups egressing through `port` whose MGID is `mgid`.
    #[must_use]
    pub fn groups_for(&self, mgid: &Gid, port: PortGuid) -> Vec<GroupId> {
        let tables = self.core.tables.lock();
        tables
            .groups
            .values()
            .filter(|g| !g.delete && g.id.mgid == *mgid && g.id.egress == port)
            .map(|g| g.id)
            .collect()
    }
}

/// Mark one association gone and retire its group if it was the last.
fn detach(tables: &mut Tables, akey: AssocKey, at: Instant) {
    let Some(assoc) = tables.assocs.get_mut(&akey) else {
        return;
    };
    assoc.detached = true;
    assoc.delete = true;
    let gkey = assoc.group;
    if let Some(group) = tables.groups.get_mut(&gkey) {
        group.clients.retain(|k| *k != akey);
        if group.clients.is_empty() && !group.delete {
            retire_group(group, at);
        }
    }
}

/// Free whatever is marked for deletion and no longer in use. A group that
/// still holds a fabric membership gets a leave instead.
fn sweep(tables: &mut Tables, leave_at: Instant) {
    let before = (tables.groups.len(), tables.assocs.len());
    tables.assocs.retain(|_, a| !(a.delete && a.in_use == 0));
    let mut freed = Vec::new();
    for (key, group) in tables.groups.iter_mut() {
        if !group.delete || group.in_use > 0 || group.op.is_some() {
            continue;
        }
        if group.joined {
            if group.timer.is_none() {
                group.queue(McGroupState::RequestLeave, leave_at);
            }
        } else if group.timer.is_none() {
            freed.push(*key);
        }
    }
    for key in freed {
        tables.groups.remove(&key);
    }
    let after = (tables.groups.len(), tables.assocs.len());
    if after != before {
        log::debug!(
            "[MC] maintenance freed {} groups, {} clients",
            before.0 - after.0,
            before.1 - after.1
        );
    }
}

impl McCore {
    /// Bring the trap subscription in line with the maintenance timer.
    fn sync_trap_subscription(&self) {
        let mut subscribed = self.traps.lock();
        let wanted = self.tables.lock().maintenance.is_some();
        if wanted == *subscribed {
            return;
        }
        *subscribed = wanted;
        let mut issued = 0;
        for port in self.ports.local_ports() {
            for trap in GROUP_TRAPS {
                let request = Request::new(
                    Method::Set,
                    attr::INFORM_INFO,
                    InformInfo::generic(trap, wanted).encode(),
                );
                let callback = Box::new(move |result: Result<Reply>| {
                    if let Err(e) = result {
                        log::warn!(
                            "[MC] trap {} {} on {} failed: {}",
                            trap,
                            if wanted { "subscribe" } else { "unsubscribe" },
                            port,
                            e
                        );
                    }
                });
                match self.engine.submit(self.handle, port, request, callback) {
                    Ok(_) => issued += 1,
                    Err(e) => log::warn!("[MC] trap {} request on {} not issued: {}", trap, port, e),
                }
            }
        }
        log::debug!(
            "[MC] group traps {} ({} requests)",
            if wanted { "subscribed" } else { "unsubscribed" },
            issued
        );
    }

    fn issue(self: &Arc<Self>, issue: Issue) {
        let weak: Weak<McCore> = Arc::downgrade(self);
        let (key, op) = (issue.group, issue.op);
        let callback = Box::new(move |result: Result<Reply>| {
            if let Some(core) = weak.upgrade() {
                core.on_fab_op(key, op, result);
            }
        });
        match self
            .engine
            .submit(self.handle, issue.port, issue.request, callback)
        {
            Ok(submitted) => {
                log::debug!(
                    "[MC] {:?} for group#{} on {} as {} ({:?})",
                    op,
                    key,
                    issue.port,
                    submitted.tid,
                    submitted.disposition
                );
            }
            Err(e) => {
                let retry = matches!(e, SdError::InsufficientResources | SdError::Busy);
                let at = Instant::now() + self.config.params().mc_retry_delay;
                let mut tables = self.tables.lock();
                if let Some(group) = tables.groups.get_mut(&key) {
                    group.op = None;
                    group.in_use = group.in_use.saturating_sub(1);
                    if retry {
                        group.timer = Some(at);
                    }
                }
                // Unknown port: the next port event re-queues the group.
                log::debug!("[MC] {:?} for group#{} not issued: {}", op, key, e);
            }
        }
    }

    fn on_fab_op(&self, key: GroupKey, op: FabOp, result: Result<Reply>) {
        let at = Instant::now() + self.config.params().mc_retry_delay;
        {
            let mut guard = self.tables.lock();
            let Tables {
                groups,
                assocs,
                outbox,
                ..
            } = &mut *guard;
            let Some(group) = groups.get_mut(&key) else {
                return;
            };
            group.op = None;
            group.in_use = group.in_use.saturating_sub(1);

            if matches!(result, Err(SdError::Timeout) | Err(SdError::Busy)) {
                log::debug!("[MC] {:?} for {} unanswered, retrying", op, group.id);
                group.timer = Some(at);
                return;
            }

            match (op, result) {
                (FabOp::Join, Err(SdError::Shutdown | SdError::InvalidState(_))) => {
                    // Abandoned, not refused.
                    log::debug!("[MC] join of {} abandoned", group.id);
                    group.timer = None;
                    group.rejoin = false;
                    if !group.delete {
                        group.state = McGroupState::Unavailable;
                        notify_group(key, group, assocs, outbox, McGroupState::Unavailable, None);
                    }
                }
                (FabOp::Join, Ok(reply)) => {
                    group.joined = true;
                    match McMemberRecord::decode(&reply.payload) {
                        Ok(mut granted) => {
                            granted.join_state = group.record.join_state;
                            group.record = granted;
                        }
                        Err(e) => log::warn!("[MC] join reply for {} unreadable: {}", group.id, e),
                    }
                    if group.delete {
                        group.queue(McGroupState::RequestLeave, at);
                    } else if group.state == McGroupState::RequestJoin {
                        log::debug!("[MC] {} available (mlid=0x{:04x})", group.id, group.record.mlid);
                        group.state = McGroupState::Available;
                        notify_group(key, group, assocs, outbox, McGroupState::Available, None);
                        if group.rejoin {
                            group.rejoin = false;
                            group.queue(McGroupState::RequestJoin, at);
                        }
                    }
                }
                (FabOp::Join, Err(e)) => {
                    log::error!("[MC] join of {} failed: {}", group.id, e);
                    group.state = McGroupState::JoinFailed;
                    notify_group(
                        key,
                        group,
                        assocs,
                        outbox,
                        McGroupState::JoinFailed,
                        Some(e.to_string()),
                    );
                    group.delete = true;
                    group.timer = None;
                    for akey in &group.clients {
                        if let Some(assoc) = assocs.get_mut(akey) {
                            assoc.delete = true;
                        }
                    }
                }
                (FabOp::Leave, result) => {
                    if let Err(e) = result {
                        log::warn!("[MC] leave of {} failed: {}", group.id, e);
                    }
                    group.joined = false;
                    notify_group(key, group, assocs, outbox, McGroupState::Unavailable, None);
                    group.state = McGroupState::Unavailable;
                    group.delete = true;
                }
            }
        }
        self.deliver_notifications();
    }

    fn deliver_notifications(&self) -> usize {
        let batch = std::mem::take(&mut self.tables.lock().outbox);
        let mut delivered = 0;
        for out in batch {
            // Guard before the detached check; deregister waits on it.
            if let Some(_delivery) = self.clients.begin_delivery(out.client) {
                let live = self
                    .tables
                    .lock()
                    .assocs
                    .get(&out.assoc)
                    .map(|a| !a.detached)
                    .unwrap_or(false);
                if live {
                    (out.callback)(&out.note);
                    delivered += 1;
                }
            }
            let mut tables = self.tables.lock();
            if let Some(assoc) = tables.assocs.get_mut(&out.assoc) {
                assoc.in_use = assoc.in_use.saturating_sub(1);
            }
            if let Some(group) = tables.groups.get_mut(&out.group) {
                group.in_use = group.in_use.saturating_sub(1);
            }
        }
        delivered
    }
}
