//! Inter-node wire messages for the hub protocol.
//!
//! Messages are exchanged over whatever reliable node-to-node transport the
//! runtime plugs in. The canonical encoding is named MsgPack
//! (`rmp_serde::to_vec_named()`); the enum is internally tagged on `"type"`
//! with `SCREAMING_SNAKE_CASE` variant names and camelCase payload fields.

use serde::{Deserialize, Serialize};

use crate::registry::NodeContribution;
use crate::types::{ChildSpec, Pid, StartResult};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Direction of an out-of-band registry propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagateOp {
    Add,
    Rem,
}

/// One `(child, node)` registry edge carried by a propagation.
///
/// `spec` and `pid` are present for `Add` and omitted for `Rem`, where the
/// child id alone identifies the edge to drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildEdge {
    pub child_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spec: Option<ChildSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pid: Option<Pid>,
}

/// One child's state shipped to its new owner during handover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippedState {
    pub child_id: String,
    pub state: serde_json::Value,
}

// ---------------------------------------------------------------------------
// HubMessage enum
// ---------------------------------------------------------------------------

/// Top-level hub protocol message.
///
/// Covers gossip (2), remote child lifecycle (3), and state handover (1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubMessage {
    // -- Gossip (2) --------------------------------------------------------
    Sync(SyncPayload),
    Propagate(PropagatePayload),

    // -- Child lifecycle (3) -----------------------------------------------
    StartChildReq(StartChildReqPayload),
    ChildStartResp(ChildStartRespPayload),
    TerminateChild(TerminateChildPayload),

    // -- Handover (1) ------------------------------------------------------
    HandoverShip(HandoverShipPayload),
}

/// A hub message tagged with its sending node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: String,
    pub message: HubMessage,
}

// ---------------------------------------------------------------------------
// Gossip payloads
// ---------------------------------------------------------------------------

/// One hop of a periodic registry synchronization round.
///
/// `nodes_data` accumulates per-node contributions as the round travels;
/// `sync_acks` lists the nodes that have already applied the assembled data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub sync_ref: String,
    pub nodes_data: std::collections::BTreeMap<String, NodeContribution>,
    pub sync_acks: Vec<String>,
}

/// Out-of-band diffusion of a local registry mutation, so that starts and
/// stops reach the cluster without waiting for the next sync round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagatePayload {
    pub sync_ref: String,
    pub acks: Vec<String>,
    pub update_node: String,
    pub op: PropagateOp,
    pub children: Vec<ChildEdge>,
    pub timestamp_us: u64,
}

// ---------------------------------------------------------------------------
// Child lifecycle payloads
// ---------------------------------------------------------------------------

/// Asks the receiving node's supervisor to start a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChildReqPayload {
    pub request_id: String,
    pub reply_to: String,
    pub spec: ChildSpec,
}

/// The supervisor's answer to a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildStartRespPayload {
    pub request_id: String,
    pub child_id: String,
    pub result: StartResult,
}

/// Asks the receiving node to terminate its local replica of a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateChildPayload {
    pub child_id: String,
}

// ---------------------------------------------------------------------------
// Handover payloads
// ---------------------------------------------------------------------------

/// Ships in-memory worker states to the node that takes ownership.
///
/// The receiver delivers each state to the matching running replica, or
/// parks it in its pending-handover buffer until that child starts locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoverShipPayload {
    pub states: Vec<ShippedState>,
}

// ---------------------------------------------------------------------------
// Wire encoding
// ---------------------------------------------------------------------------

/// Encodes an envelope in the canonical named-MsgPack wire format.
pub fn encode_envelope(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(envelope)?)
}

/// Decodes an envelope from the canonical named-MsgPack wire format.
pub fn decode_envelope(bytes: &[u8]) -> anyhow::Result<Envelope> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
