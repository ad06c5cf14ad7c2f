//! Consistent-hash distribution of children across cluster nodes.
//!
//! The primary strategy is a consistent-hash ring with virtual points per
//! node: `owners(child_id, rf)` walks the ring clockwise from the child's
//! hash and collects the first `rf` distinct nodes. Two alternatives share
//! the same pure contract — `Uniform` (sorted round-robin from a hashed
//! start index) and `Guided` (an explicit placement table with ring
//! fallback).
//!
//! Determinism is the load-bearing property: every node computes the same
//! owner set for the same `(child_id, nodes, rf)` input, with no randomness
//! and no node-local state leaking into the output.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_str;

/// Virtual points placed on the ring per node. More points smooth the
/// distribution at the cost of ring size; 64 keeps the imbalance low for
/// small clusters.
pub const VNODES: usize = 64;

// ---------------------------------------------------------------------------
// HashRing
// ---------------------------------------------------------------------------

/// Consistent-hash ring over node identifiers.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ring populated with the given nodes.
    pub fn from_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new();
        for node in nodes {
            ring.insert_node(&node.into());
        }
        ring
    }

    /// Adds a node's virtual points to the ring. Idempotent.
    pub fn insert_node(&mut self, node: &str) {
        if !self.nodes.insert(node.to_string()) {
            return;
        }
        for i in 0..VNODES {
            self.points
                .insert(fnv1a_str(&format!("{node}:{i}")), node.to_string());
        }
    }

    /// Removes a node and all its virtual points. Idempotent.
    pub fn remove_node(&mut self, node: &str) {
        if !self.nodes.remove(node) {
            return;
        }
        self.points.retain(|_, n| n != node);
    }

    /// Returns the node set in lexicographic order.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }

    /// Returns `true` if the node is on the ring.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the first `replication_factor` distinct owners encountered
    /// walking the ring clockwise from `hash(key)`.
    #[must_use]
    pub fn owners(&self, key: &str, replication_factor: usize) -> Vec<String> {
        let want = replication_factor.min(self.nodes.len());
        if want == 0 {
            return Vec::new();
        }

        let start = fnv1a_str(key);
        let mut result: Vec<String> = Vec::with_capacity(want);
        // Clockwise walk: everything at or after the key's point, then wrap.
        for (_, node) in self.points.range(start..).chain(self.points.range(..start)) {
            if !result.iter().any(|n| n == node) {
                result.push(node.clone());
                if result.len() == want {
                    break;
                }
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Distribution strategies
// ---------------------------------------------------------------------------

/// Selects how children map to owner nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DistributionKind {
    /// Consistent-hash ring walk (default).
    ConsistentHash,
    /// Round-robin over the sorted node list from a hashed start index.
    Uniform,
    /// Explicit child → owners table; unmapped children fall back to the
    /// ring. Placements are filtered to currently live nodes.
    Guided {
        placements: BTreeMap<String, Vec<String>>,
    },
}

impl Default for DistributionKind {
    fn default() -> Self {
        Self::ConsistentHash
    }
}

/// A distribution strategy bound to the current node set.
///
/// The coordinator keeps one instance in sync with membership; `belongs_to`
/// stays a pure function of `(child_id, node set, replication factor)`.
#[derive(Debug, Clone, Default)]
pub struct DistributionStrategy {
    kind: DistributionKind,
    ring: HashRing,
}

impl DistributionStrategy {
    /// Creates a strategy with an empty node set.
    #[must_use]
    pub fn new(kind: DistributionKind) -> Self {
        Self {
            kind,
            ring: HashRing::new(),
        }
    }

    /// Replaces the node set wholesale.
    pub fn init<I, S>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ring = HashRing::from_nodes(nodes);
    }

    /// Registers a joined node.
    pub fn node_joined(&mut self, node: &str) {
        self.ring.insert_node(node);
    }

    /// Removes a departed node.
    pub fn node_left(&mut self, node: &str) {
        self.ring.remove_node(node);
    }

    /// Returns the node set in lexicographic order.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.ring.nodes()
    }

    /// Computes the owner set for a child. Deterministic; returns at most
    /// `min(replication_factor, |nodes|)` distinct owners.
    #[must_use]
    pub fn belongs_to(&self, child_id: &str, replication_factor: usize) -> Vec<String> {
        match &self.kind {
            DistributionKind::ConsistentHash => self.ring.owners(child_id, replication_factor),
            DistributionKind::Uniform => {
                let nodes = self.ring.nodes();
                let n = nodes.len();
                let want = replication_factor.min(n);
                if want == 0 {
                    return Vec::new();
                }
                #[allow(clippy::cast_possible_truncation)]
                let start = (fnv1a_str(child_id) % n as u64) as usize;
                (0..want).map(|i| nodes[(start + i) % n].clone()).collect()
            }
            DistributionKind::Guided { placements } => {
                let guided: Vec<String> = placements
                    .get(child_id)
                    .map(|owners| {
                        owners
                            .iter()
                            .filter(|n| self.ring.contains(n))
                            .take(replication_factor)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if guided.is_empty() {
                    self.ring.owners(child_id, replication_factor)
                } else {
                    guided
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
