//! Deterministic placement: first feasible node maximizing soft score.
//!
//! Candidates are visited in node-id order and only a strictly better soft
//! score displaces the current pick, so the result is reproducible for a
//! given snapshot regardless of call interleaving.

use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::trace;

use gridscale_model::{ClusterSnapshot, Node, NodeId, Pod, PodOwner};

use crate::fit::{check_fit, soft_taint_penalty, term_matches};

/// Find a node in the snapshot where the pod can run.
///
/// Hard constraints must pass; among feasible nodes the one with the best
/// soft score wins, ties broken by node-id order. Not-ready nodes are never
/// placement targets.
pub fn find_placement(pod: &Pod, snapshot: &ClusterSnapshot) -> Option<NodeId> {
    find_placement_excluding(pod, snapshot, &HashSet::new())
}

/// `find_placement` with an exclusion set — used by the scale-down planner
/// so nodes provisionally removed in the same pass are not targets.
pub fn find_placement_excluding(
    pod: &Pod,
    snapshot: &ClusterSnapshot,
    exclude: &HashSet<NodeId>,
) -> Option<NodeId> {
    let mut best: Option<(SoftScore, NodeId)> = None;

    for node in snapshot.nodes() {
        if !node.ready || exclude.contains(&node.id) {
            continue;
        }
        let remaining = snapshot.remaining(&node.id);
        if let Err(reason) = check_fit(pod, node, &remaining) {
            trace!(pod = %pod.id, node = %node.id, %reason, "candidate rejected");
            continue;
        }
        let score = soft_score(pod, node, snapshot);
        match &best {
            Some((best_score, _)) if score <= *best_score => {}
            _ => best = Some((score, node.id.clone())),
        }
    }

    best.map(|(_, id)| id)
}

/// Soft signal compared lexicographically: preferred-affinity weight minus
/// soft-taint penalty first, then spread (fewer co-owned pods is better).
type SoftScore = (i64, i64);

fn soft_score(pod: &Pod, node: &Node, snapshot: &ClusterSnapshot) -> SoftScore {
    let affinity_weight = preferred_affinity_weight(pod, &node.labels);
    let penalty = soft_taint_penalty(node, pod) * 100;
    let co_owned = co_owned_pods(pod, node, snapshot);
    (affinity_weight - penalty, -co_owned)
}

fn preferred_affinity_weight(pod: &Pod, labels: &BTreeMap<String, String>) -> i64 {
    let Some(affinity) = &pod.affinity else { return 0 };
    affinity
        .preferred_terms
        .iter()
        .filter(|pref| term_matches(&pref.term.match_expressions, labels))
        .map(|pref| i64::from(pref.weight))
        .sum()
}

/// Pods of the same controller already on the node — a spread preference
/// standing in for topology-spread constraints.
fn co_owned_pods(pod: &Pod, node: &Node, snapshot: &ClusterSnapshot) -> i64 {
    let PodOwner::Controller { kind, name } = &pod.owner else {
        return 0;
    };
    snapshot
        .pods_on(&node.id)
        .filter(|p| {
            matches!(&p.owner, PodOwner::Controller { kind: k, name: n } if k == kind && n == name)
        })
        .count() as i64
}
