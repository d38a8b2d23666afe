//! Candidate selection: which nodes are worth a drain simulation at all.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use gridscale_model::{ClusterSnapshot, NodeId, NodePool, PoolId};
use gridscale_registry::ScalingRegistry;

use crate::planner::ScaleDownConfig;

/// A node that passed the cheap eligibility checks, ordered for the
/// serial feasibility pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub node_id: NodeId,
    pub pool_id: PoolId,
    /// Max of CPU and memory requested fraction at observation time.
    pub utilization: f64,
}

/// Scan the snapshot for removal candidates.
///
/// A node qualifies when its utilization has stayed below the threshold
/// for the full observation window (tracked in the registry), it hosts no
/// non-evictable pod, its pool is above min size and not in backoff, and
/// it is not already draining. Returns candidates sorted lowest
/// utilization first (node id as tie-break) — the order the feasibility
/// pass must honor.
pub fn eligible_candidates(
    snapshot: &ClusterSnapshot,
    pools: &[Arc<dyn NodePool>],
    registry: &mut ScalingRegistry,
    config: &ScaleDownConfig,
    now: u64,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for node in snapshot.nodes() {
        let Some(pool_id) = &node.pool_id else {
            continue; // Unpooled nodes are never scaled down.
        };
        if !node.ready {
            continue; // Not-ready nodes go through the unregistered path.
        }

        let utilization = snapshot.used(&node.id).max_fraction_of(&node.capacity);
        let below = utilization < config.utilization_threshold;
        let unneeded_for = registry.observe_utilization(&node.id, below, now);

        if !below || unneeded_for < config.unneeded_window_secs {
            continue;
        }
        if registry.is_draining(&node.id) {
            continue;
        }
        if registry.is_in_backoff(pool_id, now) {
            debug!(node = %node.id, pool = %pool_id, "pool in backoff, node not a candidate");
            continue;
        }

        let Some(pool) = pools.iter().find(|p| p.id() == pool_id.as_str()) else {
            continue; // Unknown pool — engine already warned at validation.
        };
        if pool.target_size() <= pool.min_size() {
            continue;
        }

        if let Some(blocker) = snapshot
            .pods_on(&node.id)
            .find(|p| !p.is_daemon() && !p.is_evictable())
        {
            debug!(node = %node.id, pod = %blocker.id, "non-evictable pod pins node");
            continue;
        }

        candidates.push(Candidate {
            node_id: node.id.clone(),
            pool_id: pool_id.clone(),
            utilization,
        });
    }

    candidates.sort_by(|a, b| {
        a.utilization
            .partial_cmp(&b.utilization)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    candidates
}
