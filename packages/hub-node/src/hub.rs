//! Public handle for one hub node.
//!
//! `Hub::spawn` wires the coordinator actor, the transport endpoint, and the
//! snapshot surface together. The handle is cheap to clone; queries read the
//! latest published registry snapshot without touching the actor, while
//! mutating operations round-trip through its command channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};

use processhub_core::{ChildSpec, Pid, RegistrySnapshot, SystemClock};

use crate::config::HubConfig;
use crate::coordinator::{
    ChildStartOutcome, ChildStopOutcome, Command, Coordinator, CoordinatorChannels,
};
use crate::error::HubError;
use crate::hooks::{Hook, HookEvent, HookRegistry};
use crate::supervisor::ChildSupervisor;
use crate::transport::{InMemoryTransport, LocalNet};
use crate::view::ClusterView;

/// Capacity of the API command channel.
const COMMAND_CAPACITY: usize = 64;

/// Handle to a running hub node.
#[derive(Clone, Debug)]
pub struct Hub {
    hub_id: String,
    node_id: String,
    commands: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<RegistrySnapshot>>,
    hooks: Arc<HookRegistry>,
    view: Arc<ClusterView>,
}

impl Hub {
    /// Starts a hub node on the given network with the given supervisor.
    ///
    /// Fails loudly when this hub is already running on the node
    /// ([`HubError::DuplicateHub`]) or the node identity is taken
    /// ([`HubError::DuplicateNode`]). Must be called within a tokio
    /// runtime; the coordinator runs as a background task until
    /// [`Hub::shutdown`] or handle drop.
    pub fn spawn(
        config: HubConfig,
        net: &Arc<LocalNet>,
        supervisor: Arc<dyn ChildSupervisor>,
    ) -> Result<Self, HubError> {
        net.register_hub(&config.hub_id, &config.node_id)?;
        let channels = match net.join(&config.node_id) {
            Ok(channels) => channels,
            Err(err) => {
                // Release the identity claim; nothing joined yet.
                net.leave(&config.node_id);
                return Err(err);
            }
        };
        let transport = InMemoryTransport::new(Arc::clone(net), config.node_id.clone());
        let view = Arc::new(ClusterView::new(config.node_id.clone(), net.nodes()));
        let hooks = Arc::new(HookRegistry::new());
        let snapshot = Arc::new(ArcSwap::from_pointee(RegistrySnapshot::default()));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(
            config.clone(),
            Arc::new(transport),
            supervisor,
            Arc::new(SystemClock),
            Arc::clone(&view),
            Arc::clone(&hooks),
            Arc::clone(&snapshot),
            events_tx,
        );
        tokio::spawn(coordinator.run(CoordinatorChannels {
            commands: commands_rx,
            inbox: channels.inbox,
            membership: channels.membership,
            events: events_rx,
        }));

        Ok(Self {
            hub_id: config.hub_id,
            node_id: config.node_id,
            commands: commands_tx,
            snapshot,
            hooks,
            view,
        })
    }

    /// The logical hub this node belongs to.
    #[must_use]
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// This node's identifier.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Starts a batch of children on their computed owner nodes. The result
    /// enumerates per-child outcomes; one failing child does not abort the
    /// others.
    pub async fn start_children(
        &self,
        specs: Vec<ChildSpec>,
    ) -> Result<Vec<ChildStartOutcome>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::StartChildren { specs, reply })
            .await
            .map_err(|_| HubError::HubStopped)?;
        rx.await.map_err(|_| HubError::HubStopped)
    }

    /// Stops a batch of children on every node hosting a replica.
    pub async fn stop_children(
        &self,
        child_ids: Vec<String>,
    ) -> Result<Vec<ChildStopOutcome>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::StopChildren { child_ids, reply })
            .await
            .map_err(|_| HubError::HubStopped)?;
        rx.await.map_err(|_| HubError::HubStopped)
    }

    /// Returns every known child with its replica locations, from the
    /// latest published snapshot.
    #[must_use]
    pub fn which_children(&self) -> BTreeMap<String, Vec<(String, Pid)>> {
        self.snapshot
            .load()
            .entries
            .iter()
            .map(|(child_id, entry)| {
                (
                    child_id.clone(),
                    entry
                        .locations
                        .iter()
                        .map(|(node, pid)| (node.clone(), *pid))
                        .collect(),
                )
            })
            .collect()
    }

    /// Returns the `(node, pid)` replicas of one child; empty when unknown.
    #[must_use]
    pub fn child_lookup(&self, child_id: &str) -> Vec<(String, Pid)> {
        self.snapshot.load().locations(child_id)
    }

    /// Returns the current cluster members.
    #[must_use]
    pub fn nodes(&self, include_local: bool) -> Vec<String> {
        self.view.nodes(include_local)
    }

    /// Registers a lifecycle hook callback.
    pub fn on(&self, hook: Hook, callback: impl Fn(&HookEvent) + Send + Sync + 'static) {
        self.hooks.on(hook, callback);
    }

    /// Gracefully stops this node, optionally handing local worker states
    /// over to the surviving owners first.
    pub async fn shutdown(&self, handover: bool) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { handover, reply })
            .await
            .map_err(|_| HubError::HubStopped)?;
        rx.await.map_err(|_| HubError::HubStopped)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::supervisor::InProcessSupervisor;
    use crate::worker::ChildProcess;

    struct Echo {
        state: Value,
    }

    #[async_trait]
    impl ChildProcess for Echo {
        fn state(&self) -> Value {
            self.state.clone()
        }

        fn apply_state(&mut self, state: Value) {
            self.state = state;
        }
    }

    fn supervisor() -> Arc<dyn ChildSupervisor> {
        InProcessSupervisor::new(|spec| {
            Ok(Box::new(Echo {
                state: spec.start_params.clone(),
            }))
        })
    }

    #[tokio::test]
    async fn duplicate_hub_id_aborts_startup() {
        let net = LocalNet::new();
        let hub = Hub::spawn(HubConfig::new("hub", "node-a"), &net, supervisor()).unwrap();

        let err = Hub::spawn(HubConfig::new("hub", "node-a"), &net, supervisor()).unwrap_err();
        assert_eq!(err, HubError::DuplicateHub("hub".to_string()));

        // After a graceful shutdown the identity is free again.
        hub.shutdown(false).await.unwrap();
        let _hub = Hub::spawn(HubConfig::new("hub", "node-a"), &net, supervisor()).unwrap();
    }

    #[tokio::test]
    async fn node_identity_taken_by_another_hub_is_a_node_collision() {
        let net = LocalNet::new();
        let _hub = Hub::spawn(HubConfig::new("hub", "node-a"), &net, supervisor()).unwrap();

        let err =
            Hub::spawn(HubConfig::new("other-hub", "node-a"), &net, supervisor()).unwrap_err();
        assert_eq!(err, HubError::DuplicateNode("node-a".to_string()));
    }
}
