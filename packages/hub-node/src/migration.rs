//! Hot-swap migration of live children between nodes.
//!
//! A migration round relocates a set of locally supervised children to a
//! newly eligible owner: start the child remotely, optionally let the local
//! worker hand its state over, then terminate the local replica. One global
//! retention timer, armed at the first successful remote start, bounds the
//! whole round — when it fires every remaining child is terminated
//! immediately.
//!
//! Per child the round walks `AwaitStart → (HandoverInFlight | Retaining) →
//! Terminated`; a failed remote start logs and leaves that child untouched
//! without affecting the rest of the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use processhub_core::{
    ChildSpec, DistributionStrategy, HandoverShipPayload, HubMessage, HubRegistry, Pid,
    ShippedState, StartChildReqPayload, StartResult,
};

use crate::config::MigrationConfig;
use crate::coordinator::InternalEvent;
use crate::supervisor::ChildSupervisor;
use crate::transport::NodeTransport;

// ---------------------------------------------------------------------------
// Phases and plans
// ---------------------------------------------------------------------------

/// Lifecycle of one child inside a migration round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    AwaitStart,
    HandoverInFlight,
    Retaining,
    Terminated,
}

/// One child scheduled for relocation.
#[derive(Debug, Clone)]
pub struct PlannedChild {
    pub spec: ChildSpec,
    /// `false` when this node stays an owner and the remote start only adds
    /// a replica (no local termination, no retention).
    pub terminate_local: bool,
}

/// A batch of children headed to one target node.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub target: String,
    pub children: Vec<PlannedChild>,
}

/// Plans the migrations a node owes a freshly joined peer: every local
/// child whose new owner set includes the joiner and that has no replica
/// there yet. Children this node no longer owns are fully migrated;
/// children it still owns are only replicated.
#[must_use]
pub fn plan_join_migrations(
    registry: &HubRegistry,
    strategy: &DistributionStrategy,
    self_node: &str,
    joined: &str,
    replication_factor: usize,
) -> Option<MigrationPlan> {
    let mut children = Vec::new();
    for child_id in registry.children_on(self_node) {
        let Some(entry) = registry.entry(&child_id) else {
            continue;
        };
        let owners = strategy.belongs_to(&child_id, replication_factor);
        if !owners.iter().any(|n| n == joined) || entry.locations.contains_key(joined) {
            continue;
        }
        children.push(PlannedChild {
            spec: entry.spec.clone(),
            terminate_local: !owners.iter().any(|n| n == self_node),
        });
    }
    if children.is_empty() {
        None
    } else {
        Some(MigrationPlan {
            target: joined.to_string(),
            children,
        })
    }
}

/// Picks the node to receive a departing child's state: the first new owner
/// without a replica, falling back to the first new owner.
#[must_use]
pub fn handover_target(
    owners: &[String],
    locations: &BTreeMap<String, Pid>,
    self_node: &str,
) -> Option<String> {
    let candidates: Vec<&String> = owners.iter().filter(|n| *n != self_node).collect();
    candidates
        .iter()
        .find(|n| !locations.contains_key(**n))
        .or_else(|| candidates.first())
        .map(|n| (*n).clone())
}

// ---------------------------------------------------------------------------
// Remote start
// ---------------------------------------------------------------------------

/// Asks `target` to start a child and awaits the matching response routed
/// back through the coordinator. Timeouts and transport failures collapse
/// into `StartResult::Failed`.
pub(crate) async fn remote_start_child(
    transport: &Arc<dyn NodeTransport>,
    pending: &DashMap<String, oneshot::Sender<StartResult>>,
    target: &str,
    spec: &ChildSpec,
    timeout: Duration,
) -> StartResult {
    let request_id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    pending.insert(request_id.clone(), tx);

    let message = HubMessage::StartChildReq(StartChildReqPayload {
        request_id: request_id.clone(),
        reply_to: transport.local_node().to_string(),
        spec: spec.clone(),
    });
    if let Err(err) = transport.send(target, message).await {
        pending.remove(&request_id);
        return StartResult::Failed {
            reason: err.to_string(),
        };
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        _ => {
            pending.remove(&request_id);
            StartResult::Failed {
                reason: format!("start on `{target}` timed out"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Migration round
// ---------------------------------------------------------------------------

/// Everything a spawned migration task needs; the coordinator stays free to
/// keep processing messages (including the start responses this round
/// awaits).
pub(crate) struct MigrationCtx {
    pub transport: Arc<dyn NodeTransport>,
    pub supervisor: Arc<dyn ChildSupervisor>,
    pub pending_starts: Arc<DashMap<String, oneshot::Sender<StartResult>>>,
    pub events: mpsc::UnboundedSender<InternalEvent>,
    pub config: MigrationConfig,
}

pub(crate) async fn run_migration_round(ctx: MigrationCtx, plan: MigrationPlan) {
    let retention = Duration::from_millis(ctx.config.retention_ms);
    let start_timeout = Duration::from_millis(ctx.config.migration_timeout_ms);

    let mut retention_deadline: Option<Instant> = None;
    let mut migrated: Vec<String> = Vec::new();
    // Children that started remotely and await local termination, each with
    // the handover state receiver when a handover is in flight.
    let mut retained: Vec<(String, MigrationPhase, Option<oneshot::Receiver<Value>>)> =
        Vec::new();

    for planned in &plan.children {
        let child_id = planned.spec.child_id.clone();
        debug!(child_id, target_node = %plan.target, phase = ?MigrationPhase::AwaitStart, "migrating child");

        let result = remote_start_child(
            &ctx.transport,
            &ctx.pending_starts,
            &plan.target,
            &planned.spec,
            start_timeout,
        )
        .await;
        let Some(_pid) = result.pid() else {
            if let StartResult::Failed { reason } = result {
                warn!(child_id, target_node = %plan.target, %reason, "migration start failed, skipping child");
            }
            continue;
        };

        migrated.push(child_id.clone());
        if retention_deadline.is_none() {
            retention_deadline = Some(Instant::now() + retention);
        }
        if !planned.terminate_local {
            // Replication start: this node remains an owner.
            continue;
        }

        if ctx.config.handover {
            if let Some(handle) = ctx.supervisor.handle(&child_id) {
                let (state_tx, state_rx) = oneshot::channel();
                handle.handover_start(state_tx).await;
                retained.push((child_id, MigrationPhase::HandoverInFlight, Some(state_rx)));
                continue;
            }
        }
        retained.push((child_id, MigrationPhase::Retaining, None));
    }

    if let Some(deadline) = retention_deadline {
        let mut retention_over = false;
        for (child_id, phase, state_rx) in retained {
            let mut handled = false;
            if !retention_over {
                match state_rx {
                    Some(rx) => {
                        tokio::select! {
                            state = rx => {
                                if let Ok(state) = state {
                                    ship_states(
                                        &ctx.transport,
                                        &plan.target,
                                        vec![(child_id.clone(), state)],
                                    )
                                    .await;
                                    handled = true;
                                }
                                // A dropped sender means the worker died
                                // mid-handover; nothing left to ship.
                            }
                            () = tokio::time::sleep_until(deadline) => {
                                retention_over = true;
                            }
                        }
                    }
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        retention_over = true;
                    }
                }
            }
            if retention_over && !handled && phase == MigrationPhase::HandoverInFlight {
                let err = crate::error::HubError::HandoverTimeout(child_id.clone());
                warn!(child_id, error = %err, "forcing termination of migrating child");
            }
            debug!(child_id, phase = ?MigrationPhase::Terminated, "terminating migrated child");
            ctx.supervisor.terminate_child(&child_id).await;
            let _ = ctx.events.send(InternalEvent::LocalChildTerminated {
                child_id: child_id.clone(),
            });
        }
    }

    if !migrated.is_empty() {
        info!(target_node = %plan.target, count = migrated.len(), "migration round finished");
        let _ = ctx.events.send(InternalEvent::MigrationFinished {
            target: plan.target,
            migrated,
        });
    }
}

/// Sends a batch of handed-over states to their new owner.
pub(crate) async fn ship_states(
    transport: &Arc<dyn NodeTransport>,
    target: &str,
    states: Vec<(String, Value)>,
) {
    if states.is_empty() {
        return;
    }
    let message = HubMessage::HandoverShip(HandoverShipPayload {
        states: states
            .into_iter()
            .map(|(child_id, state)| ShippedState { child_id, state })
            .collect(),
    });
    if let Err(err) = transport.send(target, message).await {
        warn!(node = %target, error = %err, "failed to ship handover states");
    }
}

/// Collects `(child_id, state)` from every local worker within the budget.
/// Workers that do not answer in time are skipped; their children restart
/// from their specs on the new owner.
pub(crate) async fn collect_local_states(
    supervisor: &Arc<dyn ChildSupervisor>,
    budget: Duration,
) -> Vec<(String, Value)> {
    let deadline = Instant::now() + budget;
    let mut states = Vec::new();
    for (child_id, _spec, _pid) in supervisor.running() {
        let Some(handle) = supervisor.handle(&child_id) else {
            continue;
        };
        let (tx, rx) = oneshot::channel();
        handle.get_state(tx).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(state)) => states.push((child_id, state)),
            _ => warn!(child_id, "worker did not answer state collection in time"),
        }
    }
    states
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
