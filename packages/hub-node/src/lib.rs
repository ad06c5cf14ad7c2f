//! `ProcessHub` Node -- distributed process manager runtime.
//!
//! Hosts long-lived stateful workers across a cluster of cooperating nodes:
//! consistent-hash placement, gossip-based registry convergence, hot-swap
//! migration with state handover, and active/passive redundancy signals.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod hooks;
pub mod hub;
pub mod migration;
pub mod supervisor;
pub mod transport;
pub mod view;
pub mod worker;

pub use config::{HubConfig, MigrationConfig, RedundancyConfig, SyncConfig};
pub use coordinator::{ChildStartOutcome, ChildStopOutcome};
pub use error::HubError;
pub use hooks::{Hook, HookEvent, HookRegistry};
pub use hub::Hub;
pub use migration::{MigrationPhase, MigrationPlan, PlannedChild};
pub use supervisor::{ChildSupervisor, InProcessSupervisor};
pub use transport::{InMemoryTransport, LocalNet, NodeTransport};
pub use view::{ClusterView, MembershipEvent, NodesView};
pub use worker::{spawn_worker, ChildProcess, WorkerHandle, WorkerMessage};

/// Initializes structured logging from `RUST_LOG` for host applications and
/// test runs. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
