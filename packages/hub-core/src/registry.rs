//! Global process registry data model and merge rules.
//!
//! `HubRegistry` maps each child id to its immutable spec plus the set of
//! nodes currently hosting a replica (`locations`). Every node publishes a
//! self-asserted [`NodeContribution`] — the children *it* supervises, stamped
//! with its local clock in microseconds — and merges contributions received
//! from peers.
//!
//! # Merge discipline
//!
//! A contribution only ever affects the edges asserted by its contributing
//! node: edges present in the contribution are upserted (*append*), edges the
//! registry holds for that node but absent from the contribution are removed
//! (*detach*). Edges asserted by other nodes are never touched. Across
//! contributions from the same node, last-writer-wins on the contribution
//! timestamp: anything not strictly newer than the last accepted timestamp
//! is skipped wholesale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ChildSpec, Pid};

// ---------------------------------------------------------------------------
// Contribution types
// ---------------------------------------------------------------------------

/// One child as asserted by its hosting node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub spec: ChildSpec,
    pub pid: Pid,
}

/// The full self-asserted projection of one node: every child it currently
/// supervises, stamped with the node's local clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContribution {
    pub children: BTreeMap<String, ChildRecord>,
    pub timestamp_us: u64,
}

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

/// Registry state for one child: its spec and the node → pid replica map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub spec: ChildSpec,
    pub locations: BTreeMap<String, Pid>,
}

/// A single edge mutation produced by a merge, used to drive redundancy
/// signals and lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    EdgeAdded {
        child_id: String,
        node: String,
        pid: Pid,
    },
    EdgeRemoved {
        child_id: String,
        node: String,
    },
}

impl RegistryChange {
    /// The child this change concerns.
    #[must_use]
    pub fn child_id(&self) -> &str {
        match self {
            Self::EdgeAdded { child_id, .. } | Self::EdgeRemoved { child_id, .. } => child_id,
        }
    }
}

/// Immutable point-in-time copy of the registry, cheap to clone behind an
/// `Arc` for lock-free reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub entries: BTreeMap<String, RegistryEntry>,
}

impl RegistrySnapshot {
    /// Returns the `(node, pid)` replica list for one child, empty if the
    /// child is unknown.
    #[must_use]
    pub fn locations(&self, child_id: &str) -> Vec<(String, Pid)> {
        self.entries
            .get(child_id)
            .map(|e| e.locations.iter().map(|(n, p)| (n.clone(), *p)).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// HubRegistry
// ---------------------------------------------------------------------------

/// Per-hub registry owned by the coordinator actor.
///
/// All mutation goes through the owning actor; readers get immutable
/// [`RegistrySnapshot`] copies.
#[derive(Debug, Default)]
pub struct HubRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    /// Timestamp of the last accepted contribution per contributing node.
    last_seen_us: BTreeMap<String, u64>,
}

impl HubRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry entry for a child.
    #[must_use]
    pub fn entry(&self, child_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(child_id)
    }

    /// Returns all child ids with a replica edge on the given node.
    #[must_use]
    pub fn children_on(&self, node: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.locations.contains_key(node))
            .map(|(cid, _)| cid.clone())
            .collect()
    }

    /// Builds this node's self-asserted contribution from its own edges.
    #[must_use]
    pub fn local_contribution(&self, node: &str, now_us: u64) -> NodeContribution {
        let children = self
            .entries
            .iter()
            .filter_map(|(cid, e)| {
                e.locations.get(node).map(|pid| {
                    (
                        cid.clone(),
                        ChildRecord {
                            spec: e.spec.clone(),
                            pid: *pid,
                        },
                    )
                })
            })
            .collect();
        NodeContribution {
            children,
            timestamp_us: now_us,
        }
    }

    /// Merges one node's contribution: append edges it asserts, detach edges
    /// it no longer asserts. Contributions not strictly newer than the last
    /// accepted one from the same node are skipped entirely.
    ///
    /// Never removes or rewrites edges asserted by other nodes.
    pub fn apply_contribution(
        &mut self,
        node: &str,
        contribution: &NodeContribution,
    ) -> Vec<RegistryChange> {
        if let Some(&seen) = self.last_seen_us.get(node) {
            if contribution.timestamp_us <= seen {
                debug!(
                    node,
                    timestamp_us = contribution.timestamp_us,
                    last_seen_us = seen,
                    "skipping stale registry contribution"
                );
                return Vec::new();
            }
        }
        self.last_seen_us
            .insert(node.to_string(), contribution.timestamp_us);

        let mut changes = Vec::new();

        // Append: upsert every edge the node asserts.
        for (child_id, record) in &contribution.children {
            changes.extend(self.upsert_edge(child_id, &record.spec, node, record.pid));
        }

        // Detach: drop edges the registry holds for this node that the node
        // no longer asserts.
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(cid, e)| {
                e.locations.contains_key(node) && !contribution.children.contains_key(*cid)
            })
            .map(|(cid, _)| cid.clone())
            .collect();
        for child_id in stale {
            changes.extend(self.drop_edge(&child_id, node));
        }

        changes
    }

    /// Appends edges asserted by `node` (out-of-band propagation of a local
    /// start). Bumps the staleness watermark when the update is newer.
    pub fn append_edges(
        &mut self,
        node: &str,
        children: &[(ChildSpec, Pid)],
        timestamp_us: u64,
    ) -> Vec<RegistryChange> {
        self.bump_seen(node, timestamp_us);
        let mut changes = Vec::new();
        for (spec, pid) in children {
            let child_id = spec.child_id.clone();
            changes.extend(self.upsert_edge(&child_id, spec, node, *pid));
        }
        changes
    }

    /// Detaches edges asserted by `node` (out-of-band propagation of a local
    /// termination).
    pub fn detach_edges(
        &mut self,
        node: &str,
        child_ids: &[String],
        timestamp_us: u64,
    ) -> Vec<RegistryChange> {
        self.bump_seen(node, timestamp_us);
        let mut changes = Vec::new();
        for child_id in child_ids {
            changes.extend(self.drop_edge(child_id, node));
        }
        changes
    }

    /// Removes every edge asserted by a node that left the cluster. The
    /// specs of children that lose their last replica are retained by the
    /// caller beforehand if it intends to restart them.
    pub fn purge_node(&mut self, node: &str) -> Vec<RegistryChange> {
        self.last_seen_us.remove(node);
        let affected: Vec<String> = self.children_on(node);
        let mut changes = Vec::new();
        for child_id in affected {
            changes.extend(self.drop_edge(&child_id, node));
        }
        changes
    }

    /// Returns an immutable copy for snapshot reads.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self.entries.clone(),
        }
    }

    fn bump_seen(&mut self, node: &str, timestamp_us: u64) {
        let seen = self.last_seen_us.entry(node.to_string()).or_insert(0);
        if timestamp_us > *seen {
            *seen = timestamp_us;
        }
    }

    fn upsert_edge(
        &mut self,
        child_id: &str,
        spec: &ChildSpec,
        node: &str,
        pid: Pid,
    ) -> Option<RegistryChange> {
        let entry = self
            .entries
            .entry(child_id.to_string())
            .or_insert_with(|| RegistryEntry {
                spec: spec.clone(),
                locations: BTreeMap::new(),
            });
        match entry.locations.insert(node.to_string(), pid) {
            Some(old) if old == pid => None,
            _ => Some(RegistryChange::EdgeAdded {
                child_id: child_id.to_string(),
                node: node.to_string(),
                pid,
            }),
        }
    }

    fn drop_edge(&mut self, child_id: &str, node: &str) -> Option<RegistryChange> {
        let entry = self.entries.get_mut(child_id)?;
        entry.locations.remove(node)?;
        if entry.locations.is_empty() {
            self.entries.remove(child_id);
        }
        Some(RegistryChange::EdgeRemoved {
            child_id: child_id.to_string(),
            node: node.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
