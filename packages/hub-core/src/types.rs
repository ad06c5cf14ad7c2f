//! Hub domain types: child specifications, process handles, redundancy modes.
//!
//! These types cross the wire between nodes and therefore carry serde derives
//! with camelCase field names. Node identifiers are plain `String`s, totally
//! ordered lexicographically; child identifiers are unique `String` keys
//! within one hub.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pid
// ---------------------------------------------------------------------------

/// Opaque handle of a running child replica on one node.
///
/// A `Pid` is only meaningful on the node that issued it. It is carried in
/// registry entries so that peers can address a replica through its hosting
/// node, never dereferenced remotely.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ChildSpec
// ---------------------------------------------------------------------------

/// Immutable description of a child: its unique identifier and the opaque
/// start payload understood by the local supervisor.
///
/// The spec is gossiped along with registry entries so that any node that
/// becomes an owner can start the child without asking the original
/// registrant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSpec {
    pub child_id: String,
    pub start_params: serde_json::Value,
}

impl ChildSpec {
    /// Creates a spec with the given id and start payload.
    pub fn new(child_id: impl Into<String>, start_params: serde_json::Value) -> Self {
        Self {
            child_id: child_id.into(),
            start_params,
        }
    }
}

// ---------------------------------------------------------------------------
// RedundancyMode
// ---------------------------------------------------------------------------

/// Mode assigned to one replica of a child when the replication factor
/// exceeds one. Exactly one replica is `Active`; the rest are `Passive`.
/// Workers may subscribe to transitions or ignore them entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyMode {
    Active,
    Passive,
}

// ---------------------------------------------------------------------------
// StartResult
// ---------------------------------------------------------------------------

/// Outcome of asking a supervisor to start one child.
///
/// `AlreadyStarted` is not an error: during migration and gossip races two
/// nodes may both request a start, and the existing pid is as good as a
/// fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartResult {
    Started { pid: Pid },
    AlreadyStarted { pid: Pid },
    Failed { reason: String },
}

impl StartResult {
    /// Returns the running pid for both success variants.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Self::Started { pid } | Self::AlreadyStarted { pid } => Some(*pid),
            Self::Failed { .. } => None,
        }
    }

    /// Returns `true` when the child is running after the request.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }
}
