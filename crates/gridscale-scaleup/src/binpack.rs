//! Greedy binpacking estimate: how many template nodes does a pool need
//! to absorb the pending pods?

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use gridscale_model::{NodeTemplate, Pod, PodId, PoolId, Resources};
use gridscale_sim::can_schedule;

/// Result of packing the pending pods onto hypothetical nodes built from
/// one pool's template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinpackEstimate {
    pub pool_id: PoolId,
    /// Hypothetical nodes consumed, capped at the pool's headroom.
    pub nodes_needed: u32,
    /// Pending pods this pool can satisfy, in input order.
    pub satisfied: Vec<PodId>,
    /// Allocatable left across the opened nodes after packing.
    pub leftover: Resources,
    /// Total capacity of the opened nodes (for waste fractions).
    pub total_capacity: Resources,
}

impl BinpackEstimate {
    /// Fraction of opened capacity left unused, averaged over CPU and
    /// memory. Lower is better for the least-waste expander.
    pub fn waste_fraction(&self) -> f64 {
        let frac = |left: i64, total: i64| {
            if total > 0 {
                left as f64 / total as f64
            } else {
                0.0
            }
        };
        (frac(self.leftover.cpu_millis, self.total_capacity.cpu_millis)
            + frac(self.leftover.memory_bytes, self.total_capacity.memory_bytes))
            / 2.0
    }
}

/// Pack `pods` first-fit onto a sequence of hypothetical nodes from the
/// template, opening a new node whenever nothing open fits, up to
/// `headroom` nodes. Pods the template cannot host even on an empty node
/// are skipped (they stay pending for some other pool, or become
/// permanently unschedulable).
pub fn estimate(
    pool_id: &str,
    template: &NodeTemplate,
    pods: &[Arc<Pod>],
    headroom: u32,
) -> BinpackEstimate {
    // (node, remaining) per opened hypothetical node.
    let mut open: Vec<(gridscale_model::Node, Resources)> = Vec::new();
    let mut satisfied = Vec::new();

    for pod in pods {
        let placed = open
            .iter_mut()
            .find(|(node, remaining)| can_schedule(pod, node, remaining));

        match placed {
            Some((_, remaining)) => {
                *remaining = remaining.saturating_sub(&pod.requests);
                satisfied.push(pod.id.clone());
            }
            None => {
                if open.len() as u32 >= headroom {
                    continue;
                }
                let node = template.instantiate(pool_id, open.len() as u32);
                if !can_schedule(pod, &node, &template.capacity) {
                    // Does not fit an empty template node at all.
                    continue;
                }
                let remaining = template.capacity.saturating_sub(&pod.requests);
                open.push((node, remaining));
                satisfied.push(pod.id.clone());
            }
        }
    }

    let mut leftover = Resources::default();
    let mut total_capacity = Resources::default();
    for (_, remaining) in &open {
        leftover.accumulate(remaining);
        total_capacity.accumulate(&template.capacity);
    }

    debug!(
        pool = %pool_id,
        nodes_needed = open.len(),
        satisfied = satisfied.len(),
        pending = pods.len(),
        "binpacking estimate"
    );

    BinpackEstimate {
        pool_id: pool_id.to_string(),
        nodes_needed: open.len() as u32,
        satisfied,
        leftover,
        total_capacity,
    }
}
