//! Cluster view: the authoritative list of reachable peer nodes.
//!
//! Membership is derived from the transport's node-up/node-down
//! notifications. Reads are lock-free snapshots via `ArcSwap`; consumers
//! must tolerate the view changing between reads.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// A membership change observed by the connectivity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// Versioned snapshot of the nodes currently in the cluster.
///
/// The node list is kept sorted lexicographically; the version advances on
/// every membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesView {
    pub version: u64,
    pub nodes: Vec<String>,
}

impl NodesView {
    /// Returns the node whose identifier sorts first, if any.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.nodes.first().map(String::as_str)
    }
}

/// Lock-free cluster membership holder for one hub node.
#[derive(Debug)]
pub struct ClusterView {
    local_node: String,
    inner: ArcSwap<NodesView>,
}

impl ClusterView {
    /// Creates a view seeded with the given nodes (the local node is added
    /// if absent).
    #[must_use]
    pub fn new(local_node: impl Into<String>, initial_nodes: Vec<String>) -> Self {
        let local_node = local_node.into();
        let mut nodes = initial_nodes;
        if !nodes.contains(&local_node) {
            nodes.push(local_node.clone());
        }
        nodes.sort();
        nodes.dedup();
        Self {
            local_node,
            inner: ArcSwap::from_pointee(NodesView { version: 0, nodes }),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<NodesView> {
        self.inner.load_full()
    }

    /// Returns the node list, optionally excluding the local node.
    #[must_use]
    pub fn nodes(&self, include_local: bool) -> Vec<String> {
        let view = self.inner.load();
        view.nodes
            .iter()
            .filter(|n| include_local || **n != self.local_node)
            .cloned()
            .collect()
    }

    /// Returns `true` if the node is a current member.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.inner.load().nodes.iter().any(|n| n == node)
    }

    /// Returns `true` if the local node sorts first in the current view.
    #[must_use]
    pub fn local_is_first(&self) -> bool {
        self.inner.load().first() == Some(self.local_node.as_str())
    }

    #[must_use]
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Applies a membership event. Returns `false` for no-op duplicates
    /// (a join for a known node, a leave for an unknown one).
    pub fn apply(&self, event: &MembershipEvent) -> bool {
        let view = self.inner.load();
        let mut nodes = view.nodes.clone();
        let changed = match event {
            MembershipEvent::Joined(node) => {
                if nodes.contains(node) {
                    false
                } else {
                    nodes.push(node.clone());
                    nodes.sort();
                    true
                }
            }
            MembershipEvent::Left(node) => {
                let before = nodes.len();
                nodes.retain(|n| n != node);
                nodes.len() != before
            }
        };
        if changed {
            self.inner.store(Arc::new(NodesView {
                version: view.version + 1,
                nodes,
            }));
        }
        changed
    }
}
