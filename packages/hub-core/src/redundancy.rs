//! Active/passive mode selection among the replicas of one child.
//!
//! When the replication factor exceeds one, exactly one replica acts as the
//! designated primary. The selection is a pure function of the distribution
//! strategy's owner ordering and the replica locations, so every node that
//! has converged on the same registry state selects the same active replica
//! without coordination.

use std::collections::BTreeMap;

use crate::types::{Pid, RedundancyMode};

/// Decides the mode of every replica of one child.
///
/// The replica hosted on the first owner (in the distribution strategy's
/// deterministic order) that actually holds a replica is `Active`; all other
/// replicas are `Passive`. While the registry is catching up with churn a
/// replica may live on a node outside the owner set; the lexicographically
/// smallest replica node then takes over as the tiebreak so there is always
/// exactly one active replica.
#[must_use]
pub fn select_modes(
    owners: &[String],
    locations: &BTreeMap<String, Pid>,
) -> Vec<(String, RedundancyMode)> {
    if locations.is_empty() {
        return Vec::new();
    }

    let active = owners
        .iter()
        .find(|owner| locations.contains_key(*owner))
        .cloned()
        // BTreeMap iteration order makes this the smallest replica node.
        .or_else(|| locations.keys().next().cloned());

    locations
        .keys()
        .map(|node| {
            let mode = if Some(node) == active.as_ref() {
                RedundancyMode::Active
            } else {
                RedundancyMode::Passive
            };
            (node.clone(), mode)
        })
        .collect()
}
