//! Per-hub coordinator actor.
//!
//! One coordinator task owns the registry, the distribution strategy, the
//! gossip state, and the pending-handover buffer for its node. Everything
//! reaches it as a message: API commands, inbound envelopes from peers,
//! membership events from the transport, internal events from spawned
//! worker tasks, and the periodic sync tick. Reads never enter the actor —
//! every mutation republishes an immutable registry snapshot through an
//! `ArcSwap`.
//!
//! Anything that must wait on a peer (remote starts, migration rounds) runs
//! in a spawned task so the actor keeps draining its mailbox; the response
//! envelopes those tasks wait for are resolved right here.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use processhub_core::{
    select_modes, ChildEdge, ChildSpec, ChildStartRespPayload, ClockSource, DistributionStrategy,
    Envelope, HandoverShipPayload, HubMessage, HubRegistry, Pid, PropagateOp, PropagatePayload,
    RedundancyMode, RegistryChange, RegistrySnapshot, StartChildReqPayload, StartResult,
    SyncPayload, TerminateChildPayload,
};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::gossip::{GossipAction, GossipSync};
use crate::hooks::{HookEvent, HookRegistry};
use crate::migration::{
    collect_local_states, handover_target, plan_join_migrations, remote_start_child,
    run_migration_round, ship_states, MigrationCtx, MigrationPlan,
};
use crate::supervisor::ChildSupervisor;
use crate::transport::NodeTransport;
use crate::view::{ClusterView, MembershipEvent};

// ---------------------------------------------------------------------------
// Commands and outcomes
// ---------------------------------------------------------------------------

/// Per-child outcome of a `start_children` batch. A failed child never
/// poisons the rest of the batch.
#[derive(Debug)]
pub struct ChildStartOutcome {
    pub child_id: String,
    /// Nodes on which the child is now running.
    pub result: Result<Vec<String>, HubError>,
}

/// Per-child outcome of a `stop_children` batch.
#[derive(Debug)]
pub struct ChildStopOutcome {
    pub child_id: String,
    pub result: Result<(), HubError>,
}

/// API commands routed into the coordinator.
pub(crate) enum Command {
    StartChildren {
        specs: Vec<ChildSpec>,
        reply: oneshot::Sender<Vec<ChildStartOutcome>>,
    },
    StopChildren {
        child_ids: Vec<String>,
        reply: oneshot::Sender<Vec<ChildStopOutcome>>,
    },
    Shutdown {
        handover: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Events spawned tasks feed back into the actor. Per-sender FIFO ordering
/// guarantees a batch's edge registrations land before its final reply.
pub(crate) enum InternalEvent {
    LocalChildStarted {
        spec: ChildSpec,
        pid: Pid,
    },
    LocalChildTerminated {
        child_id: String,
    },
    MigrationFinished {
        target: String,
        migrated: Vec<String>,
    },
    StartBatchDone {
        outcomes: Vec<ChildStartOutcome>,
        reply: oneshot::Sender<Vec<ChildStartOutcome>>,
    },
}

/// Receiver halves consumed by [`Coordinator::run`].
pub(crate) struct CoordinatorChannels {
    pub commands: mpsc::Receiver<Command>,
    pub inbox: mpsc::Receiver<Envelope>,
    pub membership: mpsc::UnboundedReceiver<MembershipEvent>,
    pub events: mpsc::UnboundedReceiver<InternalEvent>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub(crate) struct Coordinator {
    self_node: String,
    config: HubConfig,
    transport: Arc<dyn NodeTransport>,
    supervisor: Arc<dyn ChildSupervisor>,
    clock: Arc<dyn ClockSource>,
    view: Arc<ClusterView>,
    registry: HubRegistry,
    strategy: DistributionStrategy,
    gossip: GossipSync,
    hooks: Arc<HookRegistry>,
    snapshot: Arc<ArcSwap<RegistrySnapshot>>,
    pending_starts: Arc<DashMap<String, oneshot::Sender<StartResult>>>,
    /// States shipped ahead of their children, delivered once they start.
    pending_handover: HashMap<String, Value>,
    /// Last redundancy mode signalled to each local replica.
    local_modes: HashMap<String, RedundancyMode>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: HubConfig,
        transport: Arc<dyn NodeTransport>,
        supervisor: Arc<dyn ChildSupervisor>,
        clock: Arc<dyn ClockSource>,
        view: Arc<ClusterView>,
        hooks: Arc<HookRegistry>,
        snapshot: Arc<ArcSwap<RegistrySnapshot>>,
        events_tx: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        let mut strategy = DistributionStrategy::new(config.distribution.clone());
        strategy.init(view.nodes(true));
        let gossip = GossipSync::new(
            config.sync.fanout,
            Duration::from_millis(config.sync.sync_interval_ms),
        );
        Self {
            self_node: config.node_id.clone(),
            config,
            transport,
            supervisor,
            clock,
            view,
            registry: HubRegistry::new(),
            strategy,
            gossip,
            hooks,
            snapshot,
            pending_starts: Arc::new(DashMap::new()),
            pending_handover: HashMap::new(),
            local_modes: HashMap::new(),
            events_tx,
        }
    }

    pub(crate) async fn run(mut self, mut channels: CoordinatorChannels) {
        let period = Duration::from_millis(self.config.sync.sync_interval_ms);
        let mut sync_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(hub_id = %self.config.hub_id, node_id = %self.self_node, "hub coordinator started");
        loop {
            tokio::select! {
                command = channels.commands.recv() => match command {
                    Some(Command::StartChildren { specs, reply }) => {
                        self.spawn_start_batch(specs, reply);
                    }
                    Some(Command::StopChildren { child_ids, reply }) => {
                        self.handle_stop_children(child_ids, reply).await;
                    }
                    Some(Command::Shutdown { handover, reply }) => {
                        self.handle_shutdown(handover).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // The hub handle is gone; leave without handover.
                        self.handle_shutdown(false).await;
                        break;
                    }
                },
                Some(envelope) = channels.inbox.recv() => {
                    self.handle_envelope(envelope).await;
                }
                Some(event) = channels.membership.recv() => {
                    self.handle_membership(event).await;
                }
                Some(event) = channels.events.recv() => {
                    self.handle_internal(event).await;
                }
                _ = sync_tick.tick() => {
                    self.on_sync_tick().await;
                }
            }
        }
        debug!(hub_id = %self.config.hub_id, "hub coordinator stopped");
    }

    // -- API commands -------------------------------------------------------

    fn spawn_start_batch(
        &self,
        specs: Vec<ChildSpec>,
        reply: oneshot::Sender<Vec<ChildStartOutcome>>,
    ) {
        let rf = self.config.redundancy.replication_factor;
        let plan: Vec<(ChildSpec, Vec<String>)> = specs
            .into_iter()
            .map(|spec| {
                let owners = self.strategy.belongs_to(&spec.child_id, rf);
                (spec, owners)
            })
            .collect();

        let self_node = self.self_node.clone();
        let transport = Arc::clone(&self.transport);
        let supervisor = Arc::clone(&self.supervisor);
        let pending_starts = Arc::clone(&self.pending_starts);
        let view = Arc::clone(&self.view);
        let events = self.events_tx.clone();
        let start_timeout = Duration::from_millis(self.config.migration.migration_timeout_ms);

        tokio::spawn(async move {
            let mut outcomes = Vec::with_capacity(plan.len());
            for (spec, owners) in plan {
                if owners.is_empty() {
                    outcomes.push(ChildStartOutcome {
                        child_id: spec.child_id,
                        result: Err(HubError::MembershipUnavailable),
                    });
                    continue;
                }
                let mut started_on = Vec::new();
                let mut failure: Option<String> = None;
                for owner in owners {
                    // Guard against placements computed from a view the
                    // owner has already left.
                    if owner != self_node && !view.contains(&owner) {
                        failure = Some(HubError::NotInCluster(owner.clone()).to_string());
                        continue;
                    }
                    let result = if owner == self_node {
                        let result = supervisor.start_child(&spec).await;
                        if let Some(pid) = result.pid() {
                            let _ = events.send(InternalEvent::LocalChildStarted {
                                spec: spec.clone(),
                                pid,
                            });
                        }
                        result
                    } else {
                        remote_start_child(&transport, &pending_starts, &owner, &spec, start_timeout)
                            .await
                    };
                    match result {
                        StartResult::Started { .. } | StartResult::AlreadyStarted { .. } => {
                            started_on.push(owner);
                        }
                        StartResult::Failed { reason } => {
                            warn!(child_id = %spec.child_id, owner = %owner, %reason, "child start failed");
                            failure = Some(reason);
                        }
                    }
                }
                let result = if started_on.is_empty() {
                    Err(HubError::StartFailed {
                        child_id: spec.child_id.clone(),
                        reason: failure.unwrap_or_else(|| "no eligible owner".to_string()),
                    })
                } else {
                    Ok(started_on)
                };
                outcomes.push(ChildStartOutcome {
                    child_id: spec.child_id,
                    result,
                });
            }
            let _ = events.send(InternalEvent::StartBatchDone { outcomes, reply });
        });
    }

    async fn handle_stop_children(
        &mut self,
        child_ids: Vec<String>,
        reply: oneshot::Sender<Vec<ChildStopOutcome>>,
    ) {
        let mut outcomes = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            let Some(entry) = self.registry.entry(&child_id) else {
                outcomes.push(ChildStopOutcome {
                    result: Err(HubError::ChildUnknown(child_id.clone())),
                    child_id,
                });
                continue;
            };
            let locations: Vec<String> = entry.locations.keys().cloned().collect();
            for node in locations {
                if node == self.self_node {
                    self.terminate_local_child(&child_id).await;
                } else {
                    self.send_one(
                        node,
                        HubMessage::TerminateChild(TerminateChildPayload {
                            child_id: child_id.clone(),
                        }),
                    );
                }
            }
            outcomes.push(ChildStopOutcome {
                child_id,
                result: Ok(()),
            });
        }
        let _ = reply.send(outcomes);
    }

    async fn handle_shutdown(&mut self, handover: bool) {
        info!(hub_id = %self.config.hub_id, node_id = %self.self_node, handover, "hub shutting down");
        let peers = self.view.nodes(false);
        if handover && !peers.is_empty() {
            let budget = Duration::from_millis(self.config.migration.shutdown_handover_timeout_ms);
            let states = collect_local_states(&self.supervisor, budget).await;

            let mut survivors = self.strategy.clone();
            survivors.node_left(&self.self_node);
            let rf = self.config.redundancy.replication_factor;

            let mut shipments: HashMap<String, Vec<(String, Value)>> = HashMap::new();
            for (child_id, state) in states {
                let locations = self
                    .registry
                    .entry(&child_id)
                    .map(|e| e.locations.clone())
                    .unwrap_or_default();
                let owners = survivors.belongs_to(&child_id, rf);
                if let Some(target) = handover_target(&owners, &locations, &self.self_node) {
                    shipments.entry(target).or_default().push((child_id, state));
                }
            }
            for (target, states) in shipments {
                ship_states(&self.transport, &target, states).await;
            }
        }

        for (child_id, _, _) in self.supervisor.running() {
            self.supervisor.terminate_child(&child_id).await;
        }
        self.transport.disconnect();
    }

    // -- Inbound envelopes --------------------------------------------------

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            HubMessage::Sync(payload) => self.handle_sync(payload).await,
            HubMessage::Propagate(payload) => self.handle_propagate(payload).await,
            HubMessage::StartChildReq(payload) => self.handle_start_request(payload).await,
            HubMessage::ChildStartResp(payload) => self.handle_start_response(payload),
            HubMessage::TerminateChild(payload) => {
                self.terminate_local_child(&payload.child_id).await;
            }
            HubMessage::HandoverShip(payload) => self.handle_handover_ship(payload).await,
        }
    }

    async fn handle_sync(&mut self, payload: SyncPayload) {
        let cluster = self.view.nodes(true);
        let local = self.local_contribution();
        let actions = self
            .gossip
            .handle_sync(&self.self_node, &cluster, local, payload);
        self.execute_gossip(actions).await;
    }

    async fn handle_propagate(&mut self, payload: PropagatePayload) {
        let cluster = self.view.nodes(true);
        let actions = self
            .gossip
            .handle_propagate(&self.self_node, &cluster, payload);
        self.execute_gossip(actions).await;
    }

    async fn handle_start_request(&mut self, payload: StartChildReqPayload) {
        let StartChildReqPayload {
            request_id,
            reply_to,
            spec,
        } = payload;
        let result = self.supervisor.start_child(&spec).await;
        if let Some(pid) = result.pid() {
            self.register_local_start(&spec, pid).await;
        }
        self.send_one(
            reply_to,
            HubMessage::ChildStartResp(ChildStartRespPayload {
                request_id,
                child_id: spec.child_id,
                result,
            }),
        );
    }

    fn handle_start_response(&mut self, payload: ChildStartRespPayload) {
        if let Some((_, tx)) = self.pending_starts.remove(&payload.request_id) {
            let _ = tx.send(payload.result);
        } else {
            debug!(request_id = %payload.request_id, "dropping start response for expired request");
        }
    }

    async fn handle_handover_ship(&mut self, payload: HandoverShipPayload) {
        for shipped in payload.states {
            if let Some(handle) = self.supervisor.handle(&shipped.child_id) {
                debug!(child_id = %shipped.child_id, "delivering shipped state to running child");
                handle.handover(shipped.state).await;
            } else {
                debug!(child_id = %shipped.child_id, "buffering shipped state until child starts");
                self.pending_handover.insert(shipped.child_id, shipped.state);
            }
        }
    }

    // -- Membership ---------------------------------------------------------

    async fn handle_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => {
                if !self.view.apply(&MembershipEvent::Joined(node.clone())) {
                    return;
                }
                self.strategy.node_joined(&node);
                info!(node = %node, "node joined cluster");
                self.hooks.dispatch(&HookEvent::ClusterJoin { node: node.clone() });

                let rf = self.config.redundancy.replication_factor;
                if let Some(plan) = plan_join_migrations(
                    &self.registry,
                    &self.strategy,
                    &self.self_node,
                    &node,
                    rf,
                ) {
                    self.spawn_migration(plan);
                }
            }
            MembershipEvent::Left(node) => {
                if !self.view.apply(&MembershipEvent::Left(node.clone())) {
                    return;
                }
                self.strategy.node_left(&node);
                warn!(node = %node, "node left cluster");
                self.hooks.dispatch(&HookEvent::ClusterLeave { node: node.clone() });

                // Remember the specs of children that may lose their only
                // replica before purging the dead node's edges.
                let orphan_specs: Vec<ChildSpec> = self
                    .registry
                    .children_on(&node)
                    .iter()
                    .filter_map(|cid| self.registry.entry(cid).map(|e| e.spec.clone()))
                    .collect();
                let changes = self.registry.purge_node(&node);
                self.finish_changes(changes).await;
                self.restart_orphans(orphan_specs).await;
            }
        }
    }

    /// Restarts children previously hosted by a departed node when this node
    /// is now one of their owners, consulting the pending-handover buffer
    /// for shipped state.
    async fn restart_orphans(&mut self, orphan_specs: Vec<ChildSpec>) {
        let rf = self.config.redundancy.replication_factor;
        for spec in orphan_specs {
            let child_id = spec.child_id.clone();
            let owners = self.strategy.belongs_to(&child_id, rf);
            if !owners.iter().any(|n| *n == self.self_node) {
                continue;
            }
            let already_local = self
                .registry
                .entry(&child_id)
                .is_some_and(|e| e.locations.contains_key(&self.self_node));
            if already_local {
                continue;
            }
            let result = self.supervisor.start_child(&spec).await;
            if let Some(pid) = result.pid() {
                info!(child_id = %child_id, "restarted child after owner left");
                self.register_local_start(&spec, pid).await;
            }
        }
    }

    // -- Internal events ----------------------------------------------------

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::LocalChildStarted { spec, pid } => {
                self.register_local_start(&spec, pid).await;
            }
            InternalEvent::LocalChildTerminated { child_id } => {
                self.detach_local_edge(&child_id).await;
            }
            InternalEvent::MigrationFinished { target, migrated } => {
                self.hooks.dispatch(&HookEvent::ChildrenMigrated {
                    child_ids: migrated,
                    target,
                });
            }
            InternalEvent::StartBatchDone { outcomes, reply } => {
                let _ = reply.send(outcomes);
            }
        }
    }

    // -- Local registry edges ----------------------------------------------

    /// Records a locally started child: registry edge, pending handover
    /// delivery, and out-of-band propagation.
    async fn register_local_start(&mut self, spec: &ChildSpec, pid: Pid) {
        if let Some(state) = self.pending_handover.remove(&spec.child_id) {
            if let Some(handle) = self.supervisor.handle(&spec.child_id) {
                debug!(child_id = %spec.child_id, "delivering buffered handover state");
                handle.handover(state).await;
            }
        }

        let now = self.clock.now_micros();
        let changes = self
            .registry
            .append_edges(&self.self_node, &[(spec.clone(), pid)], now);
        if !changes.is_empty() {
            self.propagate(
                PropagateOp::Add,
                vec![ChildEdge {
                    child_id: spec.child_id.clone(),
                    spec: Some(spec.clone()),
                    pid: Some(pid),
                }],
                now,
            )
            .await;
        }
        self.finish_changes(changes).await;
    }

    /// Terminates the local replica of a child and withdraws its edge.
    async fn terminate_local_child(&mut self, child_id: &str) {
        self.supervisor.terminate_child(child_id).await;
        self.detach_local_edge(child_id).await;
    }

    async fn detach_local_edge(&mut self, child_id: &str) {
        let now = self.clock.now_micros();
        let changes = self
            .registry
            .detach_edges(&self.self_node, &[child_id.to_string()], now);
        if !changes.is_empty() {
            self.propagate(
                PropagateOp::Rem,
                vec![ChildEdge {
                    child_id: child_id.to_string(),
                    spec: None,
                    pid: None,
                }],
                now,
            )
            .await;
        }
        self.local_modes.remove(child_id);
        self.finish_changes(changes).await;
    }

    // -- Gossip -------------------------------------------------------------

    fn local_contribution(&self) -> processhub_core::NodeContribution {
        self.registry
            .local_contribution(&self.self_node, self.clock.now_micros())
    }

    async fn on_sync_tick(&mut self) {
        self.gossip.purge(std::time::Instant::now());
        if self.config.sync.restricted_init && !self.view.local_is_first() {
            return;
        }
        let cluster = self.view.nodes(true);
        let local = self.local_contribution();
        if let Some(action) = self.gossip.initiate(&self.self_node, &cluster, local) {
            self.execute_gossip(vec![action]).await;
        }
    }

    async fn propagate(&mut self, op: PropagateOp, children: Vec<ChildEdge>, timestamp_us: u64) {
        let cluster = self.view.nodes(true);
        if let Some(action) =
            self.gossip
                .propagate_local(&self.self_node, &cluster, op, children, timestamp_us)
        {
            self.execute_gossip(vec![action]).await;
        }
    }

    async fn execute_gossip(&mut self, actions: Vec<GossipAction>) {
        for action in actions {
            match action {
                GossipAction::ApplySync(data) => {
                    let mut changes = Vec::new();
                    for (node, contribution) in data {
                        // Own edges are authoritative locally; the round's
                        // copy of them is always at least as old.
                        if node == self.self_node {
                            continue;
                        }
                        changes.extend(self.registry.apply_contribution(&node, &contribution));
                    }
                    self.finish_changes(changes).await;
                }
                GossipAction::ApplyEdges {
                    node,
                    op,
                    children,
                    timestamp_us,
                } => {
                    if node == self.self_node {
                        continue;
                    }
                    let changes = match op {
                        PropagateOp::Add => {
                            let edges: Vec<(ChildSpec, Pid)> = children
                                .into_iter()
                                .filter_map(|c| Some((c.spec?, c.pid?)))
                                .collect();
                            self.registry.append_edges(&node, &edges, timestamp_us)
                        }
                        PropagateOp::Rem => {
                            let ids: Vec<String> =
                                children.into_iter().map(|c| c.child_id).collect();
                            self.registry.detach_edges(&node, &ids, timestamp_us)
                        }
                    };
                    self.finish_changes(changes).await;
                }
                GossipAction::Send { to, message } => {
                    for to_node in to {
                        self.send_one(to_node, message.clone());
                    }
                }
            }
        }
    }

    fn send_one(&self, to_node: String, message: HubMessage) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(err) = transport.send(&to_node, message).await {
                debug!(node = %to_node, error = %err, "failed to send hub message");
            }
        });
    }

    fn spawn_migration(&self, plan: MigrationPlan) {
        info!(
            target_node = %plan.target,
            children = plan.children.len(),
            "scheduling migration round"
        );
        let ctx = MigrationCtx {
            transport: Arc::clone(&self.transport),
            supervisor: Arc::clone(&self.supervisor),
            pending_starts: Arc::clone(&self.pending_starts),
            events: self.events_tx.clone(),
            config: self.config.migration.clone(),
        };
        tokio::spawn(run_migration_round(ctx, plan));
    }

    // -- Change fan-out -----------------------------------------------------

    /// Publishes a fresh snapshot and dispatches hooks plus redundancy
    /// signals for every mutated edge.
    async fn finish_changes(&mut self, changes: Vec<RegistryChange>) {
        if changes.is_empty() {
            return;
        }
        self.snapshot.store(Arc::new(self.registry.snapshot()));

        let mut affected: BTreeSet<String> = BTreeSet::new();
        for change in &changes {
            affected.insert(change.child_id().to_string());
            match change {
                RegistryChange::EdgeAdded {
                    child_id,
                    node,
                    pid,
                } => self.hooks.dispatch(&HookEvent::ChildStarted {
                    child_id: child_id.clone(),
                    node: node.clone(),
                    pid: *pid,
                }),
                RegistryChange::EdgeRemoved { child_id, node } => {
                    self.hooks.dispatch(&HookEvent::ChildStopped {
                        child_id: child_id.clone(),
                        node: node.clone(),
                    });
                }
            }
        }
        for child_id in affected {
            self.update_redundancy(&child_id).await;
        }
    }

    /// Re-selects the active replica for a child and signals the local
    /// worker when its mode changed.
    async fn update_redundancy(&mut self, child_id: &str) {
        let Some(entry) = self.registry.entry(child_id) else {
            self.local_modes.remove(child_id);
            return;
        };
        let rf = self.config.redundancy.replication_factor;
        let owners = self.strategy.belongs_to(child_id, rf);
        for (node, mode) in select_modes(&owners, &entry.locations) {
            if node != self.self_node {
                continue;
            }
            if self.local_modes.get(child_id) == Some(&mode) {
                continue;
            }
            debug!(child_id, ?mode, "redundancy mode changed for local replica");
            self.local_modes.insert(child_id.to_string(), mode);
            if let Some(handle) = self.supervisor.handle(child_id) {
                handle.redundancy_signal(mode).await;
            }
            self.hooks.dispatch(&HookEvent::RedundancySignal {
                child_id: child_id.to_string(),
                mode,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use processhub_core::{DistributionKind, SystemClock};

    use super::*;
    use crate::hooks::Hook;
    use crate::supervisor::InProcessSupervisor;
    use crate::transport::{InMemoryTransport, LocalNet, NodeChannels};
    use crate::worker::ChildProcess;

    struct Seeded {
        state: Value,
    }

    #[async_trait]
    impl ChildProcess for Seeded {
        fn state(&self) -> Value {
            self.state.clone()
        }

        fn apply_state(&mut self, state: Value) {
            self.state = state;
        }
    }

    struct Fixture {
        coordinator: Coordinator,
        supervisor: Arc<InProcessSupervisor>,
        net: Arc<LocalNet>,
        hooks: Arc<HookRegistry>,
        snapshot: Arc<ArcSwap<RegistrySnapshot>>,
        _own_channels: NodeChannels,
        _events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    }

    /// Builds a coordinator whose actor loop is not running, so tests drive
    /// its handlers directly. Peers are plain transport endpoints; their
    /// receiver halves are returned for observing outbound traffic.
    fn fixture(self_node: &str, peers: &[&str]) -> (Fixture, Vec<NodeChannels>) {
        let net = LocalNet::new();
        let mut peer_channels = Vec::new();
        for peer in peers {
            peer_channels.push(net.join(peer).unwrap());
        }
        let own_channels = net.join(self_node).unwrap();
        let transport = InMemoryTransport::new(Arc::clone(&net), self_node);

        let supervisor = InProcessSupervisor::new(|spec| {
            Ok(Box::new(Seeded {
                state: spec.start_params.clone(),
            }))
        });
        let view = Arc::new(ClusterView::new(self_node, net.nodes()));
        let hooks = Arc::new(HookRegistry::new());
        let snapshot = Arc::new(ArcSwap::from_pointee(RegistrySnapshot::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(
            HubConfig::new("hub", self_node),
            Arc::new(transport),
            Arc::clone(&supervisor) as Arc<dyn ChildSupervisor>,
            Arc::new(SystemClock),
            Arc::clone(&view),
            Arc::clone(&hooks),
            Arc::clone(&snapshot),
            events_tx,
        );

        (
            Fixture {
                coordinator,
                supervisor,
                net,
                hooks,
                snapshot,
                _own_channels: own_channels,
                _events_rx: events_rx,
            },
            peer_channels,
        )
    }

    /// Finds a child the given strategy places on `owner` with rf = 1.
    fn find_cid(strategy: &DistributionStrategy, owner: &str) -> String {
        (0..1_000)
            .map(|i| format!("w{i}"))
            .find(|cid| strategy.belongs_to(cid, 1) == vec![owner.to_string()])
            .expect("some child id lands on the owner")
    }

    #[tokio::test]
    async fn shutdown_groups_handover_shipments_per_target() {
        let (mut fx, mut peers) = fixture("node-a", &["node-b", "node-c"]);

        // Pick one child per surviving owner.
        let mut survivors = DistributionStrategy::new(DistributionKind::ConsistentHash);
        survivors.init(["node-b", "node-c"]);
        let for_b = find_cid(&survivors, "node-b");
        let for_c = find_cid(&survivors, "node-c");

        fx.supervisor
            .start_child(&ChildSpec::new(&for_b, json!({"counter": 1})))
            .await;
        fx.supervisor
            .start_child(&ChildSpec::new(&for_c, json!({"counter": 2})))
            .await;

        fx.coordinator.handle_shutdown(true).await;

        // Each surviving owner receives exactly its own child's state.
        let expectations = [
            (&for_b, json!({"counter": 1})),
            (&for_c, json!({"counter": 2})),
        ];
        for (channels, (child_id, state)) in peers.iter_mut().zip(expectations) {
            let envelope = channels.inbox.recv().await.unwrap();
            assert_eq!(envelope.from, "node-a");
            match envelope.message {
                HubMessage::HandoverShip(payload) => {
                    assert_eq!(payload.states.len(), 1);
                    assert_eq!(&payload.states[0].child_id, child_id);
                    assert_eq!(payload.states[0].state, state);
                }
                other => panic!("expected HandoverShip, got {other:?}"),
            }
        }

        // Local children are gone and the node has left the network.
        assert!(fx.supervisor.running().is_empty());
        assert_eq!(
            fx.net.nodes(),
            vec!["node-b".to_string(), "node-c".to_string()]
        );
    }

    #[tokio::test]
    async fn register_local_start_delivers_buffered_state() {
        let (mut fx, _peers) = fixture("node-a", &["node-b"]);
        fx.coordinator
            .pending_handover
            .insert("w1".to_string(), json!({"counter": 42}));

        let spec = ChildSpec::new("w1", json!({"counter": 0}));
        let pid = fx.supervisor.start_child(&spec).await.pid().unwrap();
        fx.coordinator.register_local_start(&spec, pid).await;

        // The buffered state replaced the spec seed.
        let handle = fx.supervisor.handle("w1").unwrap();
        let (tx, rx) = oneshot::channel();
        handle.get_state(tx).await;
        assert_eq!(rx.await.unwrap(), json!({"counter": 42}));
        assert!(fx.coordinator.pending_handover.is_empty());

        // The published snapshot carries the new edge.
        assert_eq!(
            fx.snapshot.load().locations("w1"),
            vec![("node-a".to_string(), pid)]
        );
    }

    #[tokio::test]
    async fn redundancy_signal_fires_once_per_mode_change() {
        let (mut fx, _peers) = fixture("node-a", &[]);
        let signals = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&signals);
        fx.hooks.on(Hook::RedundancySignal, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let spec = ChildSpec::new("w1", json!({}));
        let pid = fx.supervisor.start_child(&spec).await.pid().unwrap();
        fx.coordinator.register_local_start(&spec, pid).await;

        // A single replica is active from the start.
        assert_eq!(signals.load(Ordering::SeqCst), 1);

        // Re-selecting without a registry change stays silent.
        fx.coordinator.update_redundancy("w1").await;
        assert_eq!(signals.load(Ordering::SeqCst), 1);

        // Losing the replica clears the tracked mode.
        fx.coordinator.detach_local_edge("w1").await;
        assert!(fx.coordinator.local_modes.is_empty());
    }

    #[tokio::test]
    async fn node_left_restarts_children_this_node_now_owns() {
        let (mut fx, _peers) = fixture("node-a", &["node-b"]);
        let leaves = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&leaves);
        fx.hooks.on(Hook::ClusterLeave, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        // node-b asserts a child, then leaves; node-a is the sole owner left.
        let spec = ChildSpec::new("w1", json!({"counter": 7}));
        fx.coordinator
            .registry
            .append_edges("node-b", &[(spec, Pid(9))], 1);
        fx.coordinator
            .handle_membership(MembershipEvent::Left("node-b".to_string()))
            .await;

        assert_eq!(leaves.load(Ordering::SeqCst), 1);
        assert!(fx.supervisor.handle("w1").is_some(), "orphan restarted");

        // The dead node's edge is gone; only the local replica remains.
        let locations = fx.snapshot.load().locations("w1");
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].0, "node-a");
    }
}
