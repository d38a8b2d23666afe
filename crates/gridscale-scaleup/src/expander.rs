//! Expander strategies: which pool grows when several could.
//!
//! A tagged variant selected by configuration — each strategy is a pure
//! function over the candidate estimates. Exactly one strategy is active;
//! ties within a strategy fall back to a uniformly random pick seeded per
//! tick, so runs are reproducible.

use std::collections::BTreeMap;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use gridscale_model::PoolId;

use crate::binpack::BinpackEstimate;

/// Pool-selection policy for scale-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ExpanderStrategy {
    /// Minimize leftover allocatable after packing.
    LeastWaste,
    /// Maximize pods satisfied per added node.
    MostPods,
    /// Operator-assigned ranking; larger value wins, absent pools rank 0.
    Priority { ranking: BTreeMap<PoolId, u32> },
    /// Uniform choice among all candidates.
    Random,
}

impl Default for ExpanderStrategy {
    fn default() -> Self {
        ExpanderStrategy::LeastWaste
    }
}

impl ExpanderStrategy {
    /// Pick the winning candidate index. Candidates must be non-empty and
    /// each satisfy at least one pod. Deterministic for a given seed.
    pub fn select(&self, candidates: &[BinpackEstimate], seed: u64) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let tied: Vec<usize> = match self {
            ExpanderStrategy::LeastWaste => {
                argmin_by_f64(candidates, |c| c.waste_fraction())
            }
            ExpanderStrategy::MostPods => {
                // Compare satisfied/nodes as exact cross-multiplied integers.
                let best = candidates
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| pods_per_node_cmp(a, b))?;
                candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| pods_per_node_cmp(c, best.1).is_eq())
                    .map(|(i, _)| i)
                    .collect()
            }
            ExpanderStrategy::Priority { ranking } => {
                let rank = |c: &BinpackEstimate| {
                    ranking.get(&c.pool_id).copied().unwrap_or(0)
                };
                let best = candidates.iter().map(rank).max()?;
                candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| rank(c) == best)
                    .map(|(i, _)| i)
                    .collect()
            }
            ExpanderStrategy::Random => (0..candidates.len()).collect(),
        };

        match tied.len() {
            0 => None,
            1 => Some(tied[0]),
            _ => {
                let mut rng = StdRng::seed_from_u64(seed);
                tied.choose(&mut rng).copied()
            }
        }
    }
}

fn pods_per_node_cmp(a: &BinpackEstimate, b: &BinpackEstimate) -> std::cmp::Ordering {
    // a.satisfied/a.nodes vs b.satisfied/b.nodes without division.
    let lhs = a.satisfied.len() as u64 * u64::from(b.nodes_needed.max(1));
    let rhs = b.satisfied.len() as u64 * u64::from(a.nodes_needed.max(1));
    lhs.cmp(&rhs)
}

fn argmin_by_f64(
    candidates: &[BinpackEstimate],
    key: impl Fn(&BinpackEstimate) -> f64,
) -> Vec<usize> {
    let mut best = f64::INFINITY;
    for c in candidates {
        let v = key(c);
        if v < best {
            best = v;
        }
    }
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| key(c) == best)
        .map(|(i, _)| i)
        .collect()
}
