//! The serial drain-simulation pass over eligible candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gridscale_model::{
    ClusterSnapshot, Node, NodeId, NodePool, PodId, ScaleDownDecision, ScaleDownReason,
};
use gridscale_registry::ScalingRegistry;
use gridscale_sim::find_placement;

use crate::eligibility::{Candidate, eligible_candidates};

/// Scale-down tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleDownConfig {
    /// Utilization (max of CPU/memory requested fraction) below which a
    /// node counts as unneeded.
    pub utilization_threshold: f64,
    /// Seconds a node must stay unneeded before it becomes a candidate.
    pub unneeded_window_secs: u64,
    /// Hard cap on removals per tick.
    pub max_removals_per_tick: u32,
    /// Cap on concurrent drains per pool (in-flight drains count).
    pub max_drains_per_pool: u32,
    /// Grace period carried on each decision for the executor.
    pub grace_period_secs: u64,
}

impl Default for ScaleDownConfig {
    fn default() -> Self {
        Self {
            utilization_threshold: 0.5,
            unneeded_window_secs: 600,
            max_removals_per_tick: 10,
            max_drains_per_pool: 1,
            grace_period_secs: 600,
        }
    }
}

/// Why a candidate was not turned into a decision this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A pod on the node matched a budget with no disruptions left.
    PdbBlocked { pdb: String, pod: PodId },
    /// A pod found no placement on the remaining nodes.
    NoPlacement { pod: PodId },
    /// The pool already has its maximum concurrent drains in flight.
    DrainCapReached,
    /// The tick deadline was hit; re-evaluated next tick.
    Deferred,
}

/// A candidate that survived eligibility but not feasibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub node_id: NodeId,
    pub reason: SkipReason,
}

/// Output of one scale-down pass.
#[derive(Debug, Clone, Default)]
pub struct ScaleDownPlan {
    pub decisions: Vec<ScaleDownDecision>,
    pub skipped: Vec<SkippedCandidate>,
}

/// Plan node removals for this tick.
///
/// `pending_capacity` carries hypothetical nodes for scale-ups ordered
/// earlier in the same tick, so evicted pods may re-place onto capacity
/// that has not booted yet. The feasibility pass mutates only a fork of
/// the snapshot and commits each confirmed removal into it before
/// evaluating the next candidate; registry state is untouched except for
/// the drain records of confirmed decisions, so hitting `deadline`
/// mid-pass defers the rest without corruption.
pub fn plan_scale_down(
    snapshot: &ClusterSnapshot,
    pools: &[Arc<dyn NodePool>],
    registry: &mut ScalingRegistry,
    pending_capacity: &[Node],
    config: &ScaleDownConfig,
    now: u64,
    deadline: Option<Instant>,
) -> ScaleDownPlan {
    let candidates = eligible_candidates(snapshot, pools, registry, config, now);
    if candidates.is_empty() {
        return ScaleDownPlan::default();
    }
    debug!(count = candidates.len(), "scale-down candidates");

    // Working state for the serial pass.
    let mut working = snapshot.fork();
    for node in pending_capacity {
        working.add_node(node.clone());
    }
    let mut pdb_allowed: HashMap<String, i32> = snapshot
        .pdbs()
        .iter()
        .map(|pdb| (pdb.id.clone(), pdb.disruptions_allowed))
        .collect();
    let mut drains_per_pool: HashMap<String, u32> = HashMap::new();

    let mut plan = ScaleDownPlan::default();
    let mut candidates = candidates.into_iter();

    for candidate in candidates.by_ref() {
        if plan.decisions.len() as u32 >= config.max_removals_per_tick {
            plan.skipped.push(SkippedCandidate {
                node_id: candidate.node_id,
                reason: SkipReason::Deferred,
            });
            break;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            warn!(node = %candidate.node_id, "tick deadline hit, deferring candidate");
            plan.skipped.push(SkippedCandidate {
                node_id: candidate.node_id,
                reason: SkipReason::Deferred,
            });
            break;
        }

        let in_flight = registry.draining_count(&candidate.pool_id)
            + drains_per_pool.get(&candidate.pool_id).copied().unwrap_or(0);
        if in_flight >= config.max_drains_per_pool {
            plan.skipped.push(SkippedCandidate {
                node_id: candidate.node_id.clone(),
                reason: SkipReason::DrainCapReached,
            });
            continue;
        }

        match simulate_drain(&candidate, &working, snapshot, &pdb_allowed) {
            Ok(outcome) => {
                working = outcome.committed;
                pdb_allowed = outcome.pdb_allowed;
                *drains_per_pool.entry(candidate.pool_id.clone()).or_insert(0) += 1;
                registry.begin_drain(&candidate.node_id, &candidate.pool_id, now);
                info!(
                    node = %candidate.node_id,
                    pool = %candidate.pool_id,
                    utilization = candidate.utilization,
                    "scale-down planned"
                );
                plan.decisions.push(ScaleDownDecision {
                    node_id: candidate.node_id,
                    pool_id: candidate.pool_id,
                    reason: ScaleDownReason::Underutilized,
                    grace_period_secs: config.grace_period_secs,
                });
            }
            Err(reason) => {
                debug!(node = %candidate.node_id, ?reason, "candidate infeasible");
                plan.skipped.push(SkippedCandidate {
                    node_id: candidate.node_id,
                    reason,
                });
            }
        }
    }

    // Anything left after a break is deferred to the next tick.
    for candidate in candidates {
        plan.skipped.push(SkippedCandidate {
            node_id: candidate.node_id,
            reason: SkipReason::Deferred,
        });
    }

    plan
}

struct DrainOutcome {
    committed: ClusterSnapshot,
    pdb_allowed: HashMap<String, i32>,
}

/// Prove a single candidate removable against the working snapshot.
///
/// On success returns the new working snapshot with the node gone and all
/// its pods re-placed, plus the decremented budget counts. On failure the
/// working state is untouched (the trial fork is dropped).
fn simulate_drain(
    candidate: &Candidate,
    working: &ClusterSnapshot,
    live: &ClusterSnapshot,
    pdb_allowed: &HashMap<String, i32>,
) -> Result<DrainOutcome, SkipReason> {
    let mut trial = working.fork();
    let mut budgets = pdb_allowed.clone();

    let evicted = trial.remove_node(&candidate.node_id);
    for pod in &evicted {
        if pod.is_daemon() {
            continue; // DaemonSet pods vanish with the node.
        }

        for pdb in live.pdbs() {
            if !pdb.matches(pod) {
                continue;
            }
            let allowed = budgets.entry(pdb.id.clone()).or_insert(0);
            if *allowed < 1 {
                return Err(SkipReason::PdbBlocked {
                    pdb: pdb.id.clone(),
                    pod: pod.id.clone(),
                });
            }
            *allowed -= 1;
        }

        match find_placement(pod, &trial) {
            Some(target) => trial.assign_pod(&pod.id, &target),
            None => {
                return Err(SkipReason::NoPlacement {
                    pod: pod.id.clone(),
                });
            }
        }
    }

    Ok(DrainOutcome {
        committed: trial,
        pdb_allowed: budgets,
    })
}
