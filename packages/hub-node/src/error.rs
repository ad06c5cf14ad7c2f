//! Hub error types.
//!
//! Errors local to a single child never poison a batch operation; batch APIs
//! enumerate per-child outcomes instead. Fatal conditions (duplicate hub
//! identity, missing membership feed) abort hub startup loudly. Operational
//! errors are logged and the hub carries on.

use thiserror::Error;

/// Errors surfaced by hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The requested target node is not a current cluster member.
    #[error("node `{0}` is not in the cluster")]
    NotInCluster(String),

    /// Operation on a child the registry does not know.
    #[error("unknown child `{0}`")]
    ChildUnknown(String),

    /// A supervisor refused or failed to start a child. Non-fatal for the
    /// batch; the affected child is reported individually.
    #[error("child `{child_id}` failed to start: {reason}")]
    StartFailed { child_id: String, reason: String },

    /// A worker did not hand its state over within the retention window.
    /// Promoted to forced termination by the migrator.
    #[error("handover for child `{0}` timed out")]
    HandoverTimeout(String),

    /// The same hub is already running on this node. Starting a hub twice
    /// with one identity is a deployment error and aborts startup.
    #[error("hub `{0}` is already running on this node")]
    DuplicateHub(String),

    /// A node with the same identity is already registered on this network.
    #[error("hub node `{0}` is already registered")]
    DuplicateNode(String),

    /// The membership feed could not be subscribed at startup.
    #[error("cluster membership is unavailable")]
    MembershipUnavailable,

    /// The peer cannot be reached. Surfaces as a node-left event from the
    /// cluster view eventually; individual messages are not retried.
    #[error("node `{0}` is unreachable")]
    NetworkUnreachable(String),

    /// The hub coordinator has stopped and no longer accepts operations.
    #[error("hub has been shut down")]
    HubStopped,
}
