//! Per-hub configuration.
//!
//! One `HubConfig` fully describes a hub node's behavior: its identity, how
//! the gossip synchronizer paces rounds, how migrations retain outgoing
//! replicas, how many replicas each child gets, and which distribution
//! strategy places them.

use processhub_core::DistributionKind;
use serde::{Deserialize, Serialize};

/// Gossip synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Interval between periodic registry synchronization rounds (ms). Also
    /// bounds the lifetime of a gossip ref.
    pub sync_interval_ms: u64,
    /// Number of peers each hop forwards a round to.
    pub fanout: usize,
    /// When `true`, only the node whose identifier sorts first initiates
    /// rounds; otherwise every node initiates independently.
    pub restricted_init: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 15_000,
            fanout: 3,
            restricted_init: true,
        }
    }
}

/// Hot-swap migration tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Grace window during which an outgoing replica stays alive to finish
    /// its state handover (ms).
    pub retention_ms: u64,
    /// Whether migrations transfer in-memory worker state.
    pub handover: bool,
    /// Timeout for a remote child start during migration (ms).
    pub migration_timeout_ms: u64,
    /// Budget for collecting local worker states on graceful shutdown (ms).
    pub shutdown_handover_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retention_ms: 5_000,
            handover: false,
            migration_timeout_ms: 15_000,
            shutdown_handover_timeout_ms: 5_000,
        }
    }
}

/// Replica redundancy tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedundancyConfig {
    /// Number of replicas per child. Clamped to the cluster size at
    /// placement time.
    pub replication_factor: usize,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
        }
    }
}

/// Configuration for one hub node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Name of the logical hub this node belongs to.
    pub hub_id: String,
    /// This node's unique identifier within the hub.
    pub node_id: String,
    pub sync: SyncConfig,
    pub migration: MigrationConfig,
    pub redundancy: RedundancyConfig,
    pub distribution: DistributionKind,
}

impl HubConfig {
    /// Creates a config with production defaults for the given identity.
    pub fn new(hub_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            hub_id: hub_id.into(),
            node_id: node_id.into(),
            sync: SyncConfig::default(),
            migration: MigrationConfig::default(),
            redundancy: RedundancyConfig::default(),
            distribution: DistributionKind::ConsistentHash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_values() {
        let config = HubConfig::new("hub", "node-a");
        assert_eq!(config.sync.sync_interval_ms, 15_000);
        assert_eq!(config.sync.fanout, 3);
        assert!(config.sync.restricted_init);
        assert_eq!(config.migration.retention_ms, 5_000);
        assert!(!config.migration.handover);
        assert_eq!(config.migration.migration_timeout_ms, 15_000);
        assert_eq!(config.migration.shutdown_handover_timeout_ms, 5_000);
        assert_eq!(config.redundancy.replication_factor, 1);
        assert_eq!(config.distribution, DistributionKind::ConsistentHash);
    }
}
