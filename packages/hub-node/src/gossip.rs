//! Epidemic registry synchronization.
//!
//! Two message families converge the registry: periodic `Sync` rounds that
//! assemble every node's contribution before anyone applies, and
//! out-of-band `Propagate` messages that diffuse individual registry edges
//! the moment a child starts or stops locally.
//!
//! Every message is tracked by an opaque ref minted by its originator. A ref
//! lives for at most one sync interval, is then marked invalidated so late
//! echoes drop silently, and is evicted one interval later. A node applies
//! the data behind a given ref at most once.
//!
//! No single round carries a correctness guarantee: packet loss, crashes,
//! and partitions are all repaired by future rounds, because merges are
//! last-writer-wins per contributing node and rounds re-initiate forever.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tracing::{debug, trace};
use uuid::Uuid;

use processhub_core::{
    ChildEdge, HubMessage, NodeContribution, PropagateOp, PropagatePayload, SyncPayload,
};

// ---------------------------------------------------------------------------
// GossipAction
// ---------------------------------------------------------------------------

/// Side effect requested by the gossip layer, executed by the coordinator in
/// order. Keeping the gossip logic free of I/O makes every protocol rule
/// unit-testable.
#[derive(Debug)]
pub enum GossipAction {
    /// Merge the assembled per-node contributions into the registry.
    ApplySync(BTreeMap<String, NodeContribution>),
    /// Apply an out-of-band edge update asserted by `node`.
    ApplyEdges {
        node: String,
        op: PropagateOp,
        children: Vec<ChildEdge>,
        timestamp_us: u64,
    },
    /// Send one message to each listed peer.
    Send { to: Vec<String>, message: HubMessage },
}

// ---------------------------------------------------------------------------
// Ref cache
// ---------------------------------------------------------------------------

struct RefEntry {
    nodes_data: BTreeMap<String, NodeContribution>,
    acks: BTreeSet<String>,
    invalidated: bool,
    expires_at: Instant,
}

/// Gossip state for one hub node: ref cache plus protocol parameters.
pub struct GossipSync {
    fanout: usize,
    ttl: Duration,
    refs: HashMap<String, RefEntry>,
}

impl GossipSync {
    /// Creates a synchronizer. `sync_interval` bounds ref lifetime.
    #[must_use]
    pub fn new(fanout: usize, sync_interval: Duration) -> Self {
        Self {
            fanout: fanout.max(1),
            ttl: sync_interval,
            refs: HashMap::new(),
        }
    }

    /// Ages the ref cache: live entries past their lifetime flip to
    /// invalidated (suppressing late echoes), invalidated entries are
    /// evicted one lifetime later.
    pub fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.refs.retain(|_, entry| {
            if now >= entry.expires_at + ttl {
                return false;
            }
            if now >= entry.expires_at {
                entry.invalidated = true;
                entry.nodes_data.clear();
            }
            true
        });
    }

    /// Number of live (non-invalidated) refs, for diagnostics.
    #[must_use]
    pub fn live_refs(&self) -> usize {
        self.refs.values().filter(|e| !e.invalidated).count()
    }

    // -- Sync rounds --------------------------------------------------------

    /// Initiates a sync round with a fresh ref, seeding the data with this
    /// node's own contribution. Returns `None` when there is no peer.
    pub fn initiate(
        &mut self,
        self_node: &str,
        cluster: &[String],
        local: NodeContribution,
    ) -> Option<GossipAction> {
        let peers: Vec<String> = cluster.iter().filter(|n| *n != self_node).cloned().collect();
        if peers.is_empty() {
            return None;
        }

        let sync_ref = Uuid::new_v4().to_string();
        let nodes_data = BTreeMap::from([(self_node.to_string(), local)]);
        self.refs.insert(
            sync_ref.clone(),
            RefEntry {
                nodes_data: nodes_data.clone(),
                acks: BTreeSet::new(),
                invalidated: false,
                expires_at: Instant::now() + self.ttl,
            },
        );

        let to = sample(&peers, self.fanout);
        trace!(sync_ref, targets = ?to, "initiating sync round");
        Some(GossipAction::Send {
            to,
            message: HubMessage::Sync(SyncPayload {
                sync_ref,
                nodes_data,
                sync_acks: Vec::new(),
            }),
        })
    }

    /// Handles one hop of a sync round.
    ///
    /// While any cluster node is missing from the assembled data the merged
    /// message only travels onward — nothing is applied. Once every node has
    /// contributed, each node applies exactly once (tracked via `sync_acks`)
    /// and the round dies when the ack set covers the cluster.
    pub fn handle_sync(
        &mut self,
        self_node: &str,
        cluster: &[String],
        local: NodeContribution,
        payload: SyncPayload,
    ) -> Vec<GossipAction> {
        let SyncPayload {
            sync_ref,
            nodes_data,
            sync_acks,
        } = payload;

        let (mut merged, mut acks, expires_at) = match self.refs.get(&sync_ref) {
            Some(entry) if entry.invalidated => {
                debug!(sync_ref, "dropping sync for invalidated ref");
                return Vec::new();
            }
            Some(entry) => (
                entry.nodes_data.clone(),
                entry.acks.clone(),
                entry.expires_at,
            ),
            None => (BTreeMap::new(), BTreeSet::new(), Instant::now() + self.ttl),
        };

        // Keep the freshest contribution per node, then make sure our own
        // is represented.
        for (node, contribution) in nodes_data {
            match merged.get(&node) {
                Some(existing) if existing.timestamp_us >= contribution.timestamp_us => {}
                _ => {
                    merged.insert(node, contribution);
                }
            }
        }
        merged.entry(self_node.to_string()).or_insert(local);
        acks.extend(sync_acks);

        let missing: Vec<String> = cluster
            .iter()
            .filter(|n| !merged.contains_key(*n))
            .cloned()
            .collect();

        let mut actions = Vec::new();
        if missing.is_empty() {
            if !acks.contains(self_node) {
                actions.push(GossipAction::ApplySync(merged.clone()));
                acks.insert(self_node.to_string());
            }

            let unacked: Vec<String> = cluster
                .iter()
                .filter(|n| !acks.contains(*n))
                .cloned()
                .collect();
            if unacked.is_empty() {
                debug!(sync_ref, "sync round complete, invalidating ref");
                self.refs.insert(
                    sync_ref,
                    RefEntry {
                        nodes_data: BTreeMap::new(),
                        acks,
                        invalidated: true,
                        expires_at,
                    },
                );
                return actions;
            }

            let to = sample(&unacked, self.fanout);
            actions.push(GossipAction::Send {
                to,
                message: HubMessage::Sync(SyncPayload {
                    sync_ref: sync_ref.clone(),
                    nodes_data: merged.clone(),
                    sync_acks: acks.iter().cloned().collect(),
                }),
            });
            self.refs.insert(
                sync_ref,
                RefEntry {
                    nodes_data: merged,
                    acks,
                    invalidated: false,
                    expires_at,
                },
            );
        } else {
            // Not everyone has contributed yet: forward toward the missing
            // nodes and hold off applying.
            let to = sample(&missing, self.fanout);
            actions.push(GossipAction::Send {
                to,
                message: HubMessage::Sync(SyncPayload {
                    sync_ref: sync_ref.clone(),
                    nodes_data: merged.clone(),
                    sync_acks: acks.iter().cloned().collect(),
                }),
            });
            self.refs.insert(
                sync_ref,
                RefEntry {
                    nodes_data: merged,
                    acks,
                    invalidated: false,
                    expires_at,
                },
            );
        }
        actions
    }

    // -- Out-of-band propagation --------------------------------------------

    /// Diffuses a local registry mutation without waiting for the next sync
    /// round. Returns `None` when there is no peer.
    pub fn propagate_local(
        &mut self,
        self_node: &str,
        cluster: &[String],
        op: PropagateOp,
        children: Vec<ChildEdge>,
        timestamp_us: u64,
    ) -> Option<GossipAction> {
        let peers: Vec<String> = cluster.iter().filter(|n| *n != self_node).cloned().collect();
        if peers.is_empty() {
            return None;
        }

        let sync_ref = Uuid::new_v4().to_string();
        self.refs.insert(
            sync_ref.clone(),
            RefEntry {
                nodes_data: BTreeMap::new(),
                acks: BTreeSet::from([self_node.to_string()]),
                invalidated: false,
                expires_at: Instant::now() + self.ttl,
            },
        );

        let to = sample(&peers, self.fanout);
        trace!(sync_ref, ?op, targets = ?to, "propagating registry update");
        Some(GossipAction::Send {
            to,
            message: HubMessage::Propagate(PropagatePayload {
                sync_ref,
                acks: vec![self_node.to_string()],
                update_node: self_node.to_string(),
                op,
                children,
                timestamp_us,
            }),
        })
    }

    /// Handles a propagated registry mutation: apply on first sight, then
    /// keep forwarding toward unacked nodes until the ack set covers the
    /// cluster.
    pub fn handle_propagate(
        &mut self,
        self_node: &str,
        cluster: &[String],
        payload: PropagatePayload,
    ) -> Vec<GossipAction> {
        let PropagatePayload {
            sync_ref,
            acks: payload_acks,
            update_node,
            op,
            children,
            timestamp_us,
        } = payload;

        let (first_seen, mut acks, expires_at) = match self.refs.get(&sync_ref) {
            Some(entry) if entry.invalidated => {
                debug!(sync_ref, "dropping propagate for invalidated ref");
                return Vec::new();
            }
            Some(entry) => (false, entry.acks.clone(), entry.expires_at),
            None => (true, BTreeSet::new(), Instant::now() + self.ttl),
        };
        acks.extend(payload_acks);
        acks.insert(self_node.to_string());

        let mut actions = Vec::new();
        if first_seen && update_node != self_node {
            actions.push(GossipAction::ApplyEdges {
                node: update_node.clone(),
                op,
                children: children.clone(),
                timestamp_us,
            });
        }

        let unacked: Vec<String> = cluster
            .iter()
            .filter(|n| !acks.contains(*n))
            .cloned()
            .collect();
        if unacked.is_empty() {
            self.refs.insert(
                sync_ref,
                RefEntry {
                    nodes_data: BTreeMap::new(),
                    acks,
                    invalidated: true,
                    expires_at,
                },
            );
            return actions;
        }

        let to = sample(&unacked, self.fanout);
        actions.push(GossipAction::Send {
            to,
            message: HubMessage::Propagate(PropagatePayload {
                sync_ref: sync_ref.clone(),
                acks: acks.iter().cloned().collect(),
                update_node,
                op,
                children,
                timestamp_us,
            }),
        });
        self.refs.insert(
            sync_ref,
            RefEntry {
                nodes_data: BTreeMap::new(),
                acks,
                invalidated: false,
                expires_at,
            },
        );
        actions
    }
}

/// Picks up to `k` distinct recipients uniformly at random.
fn sample(pool: &[String], k: usize) -> Vec<String> {
    let mut rng = rand::rng();
    pool.iter().cloned().choose_multiple(&mut rng, k)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(ts: u64) -> NodeContribution {
        NodeContribution {
            children: BTreeMap::new(),
            timestamp_us: ts,
        }
    }

    fn cluster(nodes: &[&str]) -> Vec<String> {
        nodes.iter().map(|n| (*n).to_string()).collect()
    }

    fn sent(action: &GossipAction) -> (&Vec<String>, &HubMessage) {
        match action {
            GossipAction::Send { to, message } => (to, message),
            other => panic!("expected Send, got {other:?}"),
        }
    }

    fn sync_payload(action: &GossipAction) -> &SyncPayload {
        match sent(action).1 {
            HubMessage::Sync(p) => p,
            other => panic!("expected Sync, got {other:?}"),
        }
    }

    #[test]
    fn initiate_needs_a_peer() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        assert!(gossip
            .initiate("node-a", &cluster(&["node-a"]), contribution(1))
            .is_none());

        let action = gossip
            .initiate("node-a", &cluster(&["node-a", "node-b"]), contribution(1))
            .unwrap();
        let payload = sync_payload(&action);
        assert!(payload.sync_acks.is_empty());
        assert_eq!(payload.nodes_data.len(), 1);
        assert!(payload.nodes_data.contains_key("node-a"));
        assert_eq!(sent(&action).0, &vec!["node-b".to_string()]);
    }

    #[test]
    fn incomplete_round_forwards_without_applying() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b", "node-c"]);

        // node-b receives a round that so far only carries node-a.
        let actions = gossip.handle_sync(
            "node-b",
            &nodes,
            contribution(10),
            SyncPayload {
                sync_ref: "r1".to_string(),
                nodes_data: BTreeMap::from([("node-a".to_string(), contribution(5))]),
                sync_acks: vec![],
            },
        );

        assert_eq!(actions.len(), 1, "must forward only, not apply");
        let payload = sync_payload(&actions[0]);
        // Own contribution inserted, node-c still missing.
        assert_eq!(payload.nodes_data.len(), 2);
        assert_eq!(sent(&actions[0]).0, &vec!["node-c".to_string()]);
    }

    #[test]
    fn complete_round_applies_once_then_invalidates() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b"]);

        let payload = SyncPayload {
            sync_ref: "r1".to_string(),
            nodes_data: BTreeMap::from([("node-a".to_string(), contribution(5))]),
            sync_acks: vec!["node-a".to_string()],
        };

        let actions = gossip.handle_sync("node-b", &nodes, contribution(10), payload.clone());
        assert_eq!(actions.len(), 1, "apply, then nothing left to forward");
        assert!(matches!(actions[0], GossipAction::ApplySync(_)));
        assert_eq!(gossip.live_refs(), 0, "fully acked ref is invalidated");

        // A late echo of the same ref is a no-op.
        let actions = gossip.handle_sync("node-b", &nodes, contribution(11), payload);
        assert!(actions.is_empty());
    }

    #[test]
    fn apply_phase_forwards_to_unacked_nodes() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b", "node-c"]);

        // All three contributed; only node-a has applied so far.
        let actions = gossip.handle_sync(
            "node-b",
            &nodes,
            contribution(10),
            SyncPayload {
                sync_ref: "r1".to_string(),
                nodes_data: BTreeMap::from([
                    ("node-a".to_string(), contribution(5)),
                    ("node-b".to_string(), contribution(6)),
                    ("node-c".to_string(), contribution(7)),
                ]),
                sync_acks: vec!["node-a".to_string()],
            },
        );

        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], GossipAction::ApplySync(_)));
        let payload = sync_payload(&actions[1]);
        assert_eq!(sent(&actions[1]).0, &vec!["node-c".to_string()]);
        assert!(payload.sync_acks.contains(&"node-b".to_string()));
    }

    #[test]
    fn merge_keeps_freshest_contribution_per_node() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b", "node-c"]);

        // First hop caches node-a@5.
        gossip.handle_sync(
            "node-b",
            &nodes,
            contribution(10),
            SyncPayload {
                sync_ref: "r1".to_string(),
                nodes_data: BTreeMap::from([("node-a".to_string(), contribution(5))]),
                sync_acks: vec![],
            },
        );
        // Second hop carries an older node-a@3 plus node-c: the cached 5 wins.
        let actions = gossip.handle_sync(
            "node-b",
            &nodes,
            contribution(10),
            SyncPayload {
                sync_ref: "r1".to_string(),
                nodes_data: BTreeMap::from([
                    ("node-a".to_string(), contribution(3)),
                    ("node-c".to_string(), contribution(7)),
                ]),
                sync_acks: vec![],
            },
        );

        let applied = actions
            .iter()
            .find_map(|a| match a {
                GossipAction::ApplySync(data) => Some(data),
                _ => None,
            })
            .expect("complete round must apply");
        assert_eq!(applied["node-a"].timestamp_us, 5);
        assert_eq!(applied["node-c"].timestamp_us, 7);
    }

    #[test]
    fn purge_invalidates_then_evicts() {
        let mut gossip = GossipSync::new(3, Duration::from_millis(50));
        gossip
            .initiate("node-a", &cluster(&["node-a", "node-b"]), contribution(1))
            .unwrap();
        assert_eq!(gossip.live_refs(), 1);

        let later = Instant::now() + Duration::from_millis(60);
        gossip.purge(later);
        assert_eq!(gossip.live_refs(), 0);
        assert_eq!(gossip.refs.len(), 1, "invalidated ref lingers to drop echoes");

        gossip.purge(later + Duration::from_millis(60));
        assert!(gossip.refs.is_empty());
    }

    #[test]
    fn propagate_applies_on_first_sight_only() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b", "node-c"]);

        let payload = PropagatePayload {
            sync_ref: "p1".to_string(),
            acks: vec!["node-a".to_string()],
            update_node: "node-a".to_string(),
            op: PropagateOp::Add,
            children: vec![],
            timestamp_us: 7,
        };

        let actions = gossip.handle_propagate("node-b", &nodes, payload.clone());
        assert!(matches!(actions[0], GossipAction::ApplyEdges { .. }));
        assert_eq!(sent(&actions[1]).0, &vec!["node-c".to_string()]);

        // Redelivery: no re-apply, still forwards toward unacked nodes.
        let actions = gossip.handle_propagate("node-b", &nodes, payload);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], GossipAction::Send { .. }));
    }

    #[test]
    fn propagate_completes_when_all_acked() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b"]);

        let actions = gossip.handle_propagate(
            "node-b",
            &nodes,
            PropagatePayload {
                sync_ref: "p1".to_string(),
                acks: vec!["node-a".to_string()],
                update_node: "node-a".to_string(),
                op: PropagateOp::Rem,
                children: vec![],
                timestamp_us: 9,
            },
        );

        assert_eq!(actions.len(), 1, "apply then invalidate, nothing to send");
        assert!(matches!(actions[0], GossipAction::ApplyEdges { .. }));
        assert_eq!(gossip.live_refs(), 0);
    }

    #[test]
    fn own_echo_is_not_reapplied() {
        let mut gossip = GossipSync::new(3, Duration::from_secs(15));
        let nodes = cluster(&["node-a", "node-b", "node-c"]);

        let action = gossip
            .propagate_local("node-a", &nodes, PropagateOp::Add, vec![], 11)
            .unwrap();
        let sync_ref = match sent(&action).1 {
            HubMessage::Propagate(p) => p.sync_ref.clone(),
            other => panic!("expected Propagate, got {other:?}"),
        };

        // The propagation comes back via a peer; we originated it, so no
        // ApplyEdges may be produced.
        let actions = gossip.handle_propagate(
            "node-a",
            &nodes,
            PropagatePayload {
                sync_ref,
                acks: vec!["node-a".to_string(), "node-b".to_string()],
                update_node: "node-a".to_string(),
                op: PropagateOp::Add,
                children: vec![],
                timestamp_us: 11,
            },
        );
        assert!(actions
            .iter()
            .all(|a| !matches!(a, GossipAction::ApplyEdges { .. })));
    }

    #[test]
    fn fanout_bounds_recipient_count() {
        let mut gossip = GossipSync::new(2, Duration::from_secs(15));
        let nodes: Vec<String> = (0..10).map(|i| format!("node-{i}")).collect();

        let action = gossip
            .initiate("node-0", &nodes, contribution(1))
            .unwrap();
        let (to, _) = sent(&action);
        assert_eq!(to.len(), 2);
        let distinct: std::collections::HashSet<_> = to.iter().collect();
        assert_eq!(distinct.len(), 2);
        assert!(!to.contains(&"node-0".to_string()));
    }
}
