//! Node-to-node message transport.
//!
//! The hub only requires a reliable typed message channel between nodes plus
//! node-up/node-down notifications; everything else (encoding, sockets,
//! discovery) is the transport's business. `LocalNet` provides the
//! in-process implementation used by embedded deployments and the test
//! suite, including a partition control surface for convergence testing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use processhub_core::{Envelope, HubMessage};

use crate::error::HubError;
use crate::view::MembershipEvent;

/// Capacity of each node's inbound envelope queue.
const INBOX_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// NodeTransport trait
// ---------------------------------------------------------------------------

/// Reliable typed message delivery between hub nodes.
///
/// Implementations must deliver messages from one sender to one receiver in
/// FIFO order; no ordering is assumed across distinct senders. Delivery is
/// best-effort: an unreachable peer is an error now and a node-left event
/// eventually, never a per-message retry.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// This node's identifier.
    fn local_node(&self) -> &str;

    /// Sends a message to a peer.
    async fn send(&self, to: &str, message: HubMessage) -> Result<(), HubError>;

    /// Detaches this node from the network, notifying peers that it left.
    fn disconnect(&self);
}

// ---------------------------------------------------------------------------
// LocalNet
// ---------------------------------------------------------------------------

struct NodeSlot {
    inbox: mpsc::Sender<Envelope>,
    membership: mpsc::UnboundedSender<MembershipEvent>,
}

/// In-process network shared by the nodes of one hub.
///
/// Each registered node gets an inbound envelope queue and a membership
/// event feed. `block`/`heal` simulate network partitions by silently
/// dropping envelopes between blocked pairs, without generating node-down
/// events — exactly how a partition looks to the gossip layer.
#[derive(Default)]
pub struct LocalNet {
    peers: DashMap<String, NodeSlot>,
    /// Hub identity claimed per node, registered before the node joins.
    hubs: DashMap<String, String>,
    blocked: RwLock<HashSet<(String, String)>>,
}

/// Receiver halves handed to a node when it joins a [`LocalNet`].
#[derive(Debug)]
pub struct NodeChannels {
    pub inbox: mpsc::Receiver<Envelope>,
    pub membership: mpsc::UnboundedReceiver<MembershipEvent>,
}

impl LocalNet {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims a hub identity for a node before it joins the network.
    ///
    /// Starting the same hub twice on one node is a deployment error and
    /// aborts loudly with [`HubError::DuplicateHub`]; a node identifier
    /// already claimed by a different hub is a node-level collision. The
    /// claim is released when the node leaves.
    pub fn register_hub(&self, hub_id: &str, node_id: &str) -> Result<(), HubError> {
        match self.hubs.entry(node_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get() == hub_id {
                    Err(HubError::DuplicateHub(hub_id.to_string()))
                } else {
                    Err(HubError::DuplicateNode(node_id.to_string()))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(hub_id.to_string());
                Ok(())
            }
        }
    }

    /// Registers a node, returning its receiver halves. Pair with
    /// [`InMemoryTransport::new`] for the sending side.
    ///
    /// Fails loudly when the identifier is already taken — two nodes with
    /// the same identity on one network is a deployment error.
    pub fn join(&self, node_id: &str) -> Result<NodeChannels, HubError> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();

        let slot = NodeSlot {
            inbox: inbox_tx,
            membership: membership_tx,
        };
        match self.peers.entry(node_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(HubError::DuplicateNode(node_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }

        // Announce the newcomer to everyone already present.
        for peer in self.peers.iter() {
            if peer.key() != node_id {
                let _ = peer
                    .value()
                    .membership
                    .send(MembershipEvent::Joined(node_id.to_string()));
            }
        }

        Ok(NodeChannels {
            inbox: inbox_rx,
            membership: membership_rx,
        })
    }

    /// Deregisters a node, releasing its hub identity claim, and announces
    /// its departure to the remaining peers.
    pub fn leave(&self, node_id: &str) {
        self.hubs.remove(node_id);
        if self.peers.remove(node_id).is_none() {
            return;
        }
        for peer in self.peers.iter() {
            let _ = peer
                .value()
                .membership
                .send(MembershipEvent::Left(node_id.to_string()));
        }
    }

    /// Returns the identifiers of all registered nodes, sorted.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Blocks traffic between two nodes in both directions.
    pub fn block(&self, a: &str, b: &str) {
        let mut blocked = self.blocked.write();
        blocked.insert((a.to_string(), b.to_string()));
        blocked.insert((b.to_string(), a.to_string()));
    }

    /// Removes every partition.
    pub fn heal(&self) {
        self.blocked.write().clear();
    }

    fn is_blocked(&self, from: &str, to: &str) -> bool {
        self.blocked
            .read()
            .contains(&(from.to_string(), to.to_string()))
    }

    async fn deliver(&self, from: &str, to: &str, message: HubMessage) -> Result<(), HubError> {
        if self.is_blocked(from, to) {
            // Partitioned link: the envelope vanishes, as it would on a
            // real network split. A future gossip round re-delivers.
            debug!(from, to, "dropping envelope across partition");
            return Ok(());
        }
        let inbox = match self.peers.get(to) {
            Some(slot) => slot.inbox.clone(),
            None => return Err(HubError::NetworkUnreachable(to.to_string())),
        };
        inbox
            .send(Envelope {
                from: from.to_string(),
                message,
            })
            .await
            .map_err(|_| HubError::NetworkUnreachable(to.to_string()))
    }
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

/// One node's handle onto a [`LocalNet`].
#[derive(Clone)]
pub struct InMemoryTransport {
    node_id: String,
    net: Arc<LocalNet>,
}

impl InMemoryTransport {
    /// Creates the sending half for a node registered via [`LocalNet::join`].
    #[must_use]
    pub fn new(net: Arc<LocalNet>, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            net,
        }
    }
}

#[async_trait]
impl NodeTransport for InMemoryTransport {
    fn local_node(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, to: &str, message: HubMessage) -> Result<(), HubError> {
        self.net.deliver(&self.node_id, to, message).await
    }

    fn disconnect(&self) {
        self.net.leave(&self.node_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
