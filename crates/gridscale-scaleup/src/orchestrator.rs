//! Scale-up planning: estimates → expander → balanced decisions → limits.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use gridscale_model::{
    ClusterSnapshot, NodePool, Pod, PodId, Resources, ScaleUpDecision, headroom,
};
use gridscale_registry::ScalingRegistry;

use crate::binpack::{BinpackEstimate, estimate};
use crate::expander::ExpanderStrategy;

/// Cluster-wide ceilings enforced after pool selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub max_total_nodes: Option<u32>,
    pub max_total_cpu_millis: Option<i64>,
    pub max_total_memory_bytes: Option<i64>,
}

/// Scale-up tuning knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleUpConfig {
    pub expander: ExpanderStrategy,
    pub limits: GlobalLimits,
}

/// Output of one scale-up pass.
#[derive(Debug, Clone, Default)]
pub struct ScaleUpPlan {
    pub decisions: Vec<ScaleUpDecision>,
    /// Pods no pool's template can host — terminal classification.
    pub unschedulable: Vec<PodId>,
    /// Pods the winning pool's new nodes will absorb.
    pub satisfied: Vec<PodId>,
}

/// Plan scale-ups for the pending pods.
///
/// Binpacking estimates run concurrently over the worker pool and are
/// cancelled as a group if `budget` elapses; estimates joined after the
/// deadline are discarded whole, never partially applied. The registry is
/// informed of every attempted decision before returning.
pub async fn plan_scale_up(
    pending: &[Arc<Pod>],
    pools: &[Arc<dyn NodePool>],
    snapshot: &ClusterSnapshot,
    registry: &mut ScalingRegistry,
    config: &ScaleUpConfig,
    now: u64,
    tick_seed: u64,
    budget: Duration,
) -> ScaleUpPlan {
    if pending.is_empty() {
        return ScaleUpPlan::default();
    }

    // 1. Pools eligible to grow.
    let eligible: Vec<&Arc<dyn NodePool>> = pools
        .iter()
        .filter(|pool| {
            let id = pool.id();
            if !registry.is_healthy(id) || registry.is_in_backoff(id, now) {
                debug!(pool = %id, "skipping unhealthy/backing-off pool");
                return false;
            }
            if headroom(pool.as_ref()) == 0 {
                debug!(pool = %id, "skipping pool at max size");
                return false;
            }
            true
        })
        .collect();

    if eligible.is_empty() {
        warn!(pending = pending.len(), "no eligible pools for scale-up");
        return ScaleUpPlan {
            unschedulable: pending.iter().map(|p| p.id.clone()).collect(),
            ..Default::default()
        };
    }

    // 2. Concurrent per-pool estimates, read-only over shared data.
    let mut set = JoinSet::new();
    for pool in &eligible {
        let pool_id = pool.id().to_string();
        let template = pool.template();
        let room = headroom(pool.as_ref());
        let pods: Vec<Arc<Pod>> = pending.to_vec();
        set.spawn(async move { estimate(&pool_id, &template, &pods, room) });
    }

    let deadline = tokio::time::Instant::now() + budget;
    let mut estimates: Vec<BinpackEstimate> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(est))) => estimates.push(est),
            Ok(Some(Err(e))) => warn!(error = %e, "binpacking task failed"),
            Ok(None) => break,
            Err(_) => {
                set.abort_all();
                warn!("scale-up estimation deadline hit, deferring remaining pools");
                break;
            }
        }
    }
    // JoinSet completion order is arbitrary; restore determinism.
    estimates.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));

    // 3. Candidates and the permanently-unschedulable remainder.
    let satisfiable: BTreeSet<&str> = estimates
        .iter()
        .flat_map(|e| e.satisfied.iter().map(String::as_str))
        .collect();
    let unschedulable: Vec<PodId> = pending
        .iter()
        .filter(|p| !satisfiable.contains(p.id.as_str()))
        .map(|p| p.id.clone())
        .collect();
    for pod in &unschedulable {
        info!(pod = %pod, "pod fits no pool template, permanently unschedulable");
    }

    let candidates: Vec<BinpackEstimate> = estimates
        .into_iter()
        .filter(|e| !e.satisfied.is_empty())
        .collect();

    // 4. Expander picks the winner.
    let Some(winner_idx) = config.expander.select(&candidates, tick_seed) else {
        return ScaleUpPlan {
            unschedulable,
            ..Default::default()
        };
    };
    let winner = &candidates[winner_idx];
    debug!(pool = %winner.pool_id, nodes = winner.nodes_needed, "expander selected pool");

    // 5. Balanced scaling across fingerprint-equal pools, then limits.
    let mut decisions = balance_across_similar(winner, &eligible);
    trim_to_limits(&mut decisions, &eligible, snapshot, &config.limits);

    // 6. Inform the registry before handing decisions out.
    for decision in &decisions {
        if let Err(e) = registry.record_scale_up_attempt(&decision.pool_id, decision.delta, now) {
            warn!(pool = %decision.pool_id, error = %e, "failed to record scale-up attempt");
        }
        info!(pool = %decision.pool_id, delta = decision.delta, "scale-up planned");
    }

    ScaleUpPlan {
        decisions,
        unschedulable,
        satisfied: winner.satisfied.clone(),
    }
}

/// Spread the winner's node count over all eligible pools sharing its
/// template fingerprint: each new node goes to the currently-smallest pool,
/// so group sizes converge instead of one pool exhausting first.
fn balance_across_similar(
    winner: &BinpackEstimate,
    eligible: &[&Arc<dyn NodePool>],
) -> Vec<ScaleUpDecision> {
    let Some(winner_pool) = eligible.iter().find(|p| p.id() == winner.pool_id) else {
        // Winner always comes from the eligible set; degrade gracefully.
        return vec![ScaleUpDecision {
            pool_id: winner.pool_id.clone(),
            delta: winner.nodes_needed,
        }];
    };
    let fingerprint = winner_pool.template().fingerprint();

    // (pool id, projected size, remaining headroom, assigned) in id order.
    let mut group: Vec<(String, u32, u32, u32)> = eligible
        .iter()
        .filter(|p| p.template().fingerprint() == fingerprint)
        .map(|p| (p.id().to_string(), p.target_size(), headroom(p.as_ref()), 0))
        .collect();
    group.sort_by(|a, b| a.0.cmp(&b.0));

    for _ in 0..winner.nodes_needed {
        let next = group
            .iter_mut()
            .filter(|(_, _, room, assigned)| assigned < room)
            .min_by_key(|(id, size, _, assigned)| (*size + *assigned, id.clone()));
        match next {
            Some((_, _, _, assigned)) => *assigned += 1,
            None => break, // Whole group at max.
        }
    }

    group
        .into_iter()
        .filter(|(_, _, _, assigned)| *assigned > 0)
        .map(|(pool_id, _, _, assigned)| ScaleUpDecision {
            pool_id,
            delta: assigned,
        })
        .collect()
}

/// Enforce cluster-wide ceilings. Decisions are visited in order and each
/// is granted as much as still fits; a decision trimmed to zero is dropped.
/// Earlier pools are satisfied fully before later ones get anything.
fn trim_to_limits(
    decisions: &mut Vec<ScaleUpDecision>,
    eligible: &[&Arc<dyn NodePool>],
    snapshot: &ClusterSnapshot,
    limits: &GlobalLimits,
) {
    if limits.max_total_nodes.is_none()
        && limits.max_total_cpu_millis.is_none()
        && limits.max_total_memory_bytes.is_none()
    {
        return;
    }

    let mut total_nodes = snapshot.node_count() as u32;
    let mut total = Resources::default();
    for node in snapshot.nodes() {
        total.accumulate(&node.capacity);
    }

    let mut kept = Vec::new();
    for decision in decisions.drain(..) {
        let Some(pool) = eligible.iter().find(|p| p.id() == decision.pool_id) else {
            continue;
        };
        let capacity = pool.template().capacity;

        let mut allowed = decision.delta;
        if let Some(max_nodes) = limits.max_total_nodes {
            allowed = allowed.min(max_nodes.saturating_sub(total_nodes));
        }
        if let Some(max_cpu) = limits.max_total_cpu_millis
            && capacity.cpu_millis > 0
        {
            let room = (max_cpu - total.cpu_millis).max(0) / capacity.cpu_millis;
            allowed = allowed.min(room.min(u32::MAX as i64) as u32);
        }
        if let Some(max_mem) = limits.max_total_memory_bytes
            && capacity.memory_bytes > 0
        {
            let room = (max_mem - total.memory_bytes).max(0) / capacity.memory_bytes;
            allowed = allowed.min(room.min(u32::MAX as i64) as u32);
        }

        if allowed == 0 {
            warn!(pool = %decision.pool_id, "scale-up dropped by global limits");
            continue;
        }
        if allowed < decision.delta {
            warn!(
                pool = %decision.pool_id,
                wanted = decision.delta,
                granted = allowed,
                "scale-up trimmed by global limits"
            );
        }

        total_nodes += allowed;
        total.cpu_millis += capacity.cpu_millis * i64::from(allowed);
        total.memory_bytes += capacity.memory_bytes * i64::from(allowed);
        kept.push(ScaleUpDecision {
            pool_id: decision.pool_id,
            delta: allowed,
        });
    }
    *decisions = kept;
}
