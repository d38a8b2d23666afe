//! Hard-constraint fit checks, short-circuiting in a fixed order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use gridscale_model::{
    MatchExpression, MatchOperator, Node, NodeAffinity, Pod, Resources, Taint, TaintEffect,
    Toleration, TolerationOperator,
};

/// Why a pod cannot run on a node. A classification, not an error — the
/// engine surfaces it in status events and unschedulability reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnfitReason {
    /// Node selector or required node affinity does not match.
    SelectorMismatch,
    /// A `NoSchedule`/`NoExecute` taint is not tolerated.
    TaintNotTolerated { key: String },
    /// A resource component exceeds the node's remaining allocatable.
    InsufficientResource { resource: String },
}

impl fmt::Display for UnfitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnfitReason::SelectorMismatch => write!(f, "selector/affinity mismatch"),
            UnfitReason::TaintNotTolerated { key } => {
                write!(f, "taint not tolerated: {key}")
            }
            UnfitReason::InsufficientResource { resource } => {
                write!(f, "insufficient {resource}")
            }
        }
    }
}

/// Evaluate the hard constraints in order: selector/required affinity →
/// taints → resource fit against `remaining`. Returns the first failure.
pub fn check_fit(pod: &Pod, node: &Node, remaining: &Resources) -> Result<(), UnfitReason> {
    if !selector_matches(&pod.node_selector, &node.labels)
        || !required_affinity_matches(pod.affinity.as_ref(), &node.labels)
    {
        return Err(UnfitReason::SelectorMismatch);
    }

    if let Some(taint) = first_untolerated_taint(&node.taints, &pod.tolerations) {
        return Err(UnfitReason::TaintNotTolerated {
            key: taint.key.clone(),
        });
    }

    if let Some(resource) = first_short_resource(&pod.requests, remaining) {
        return Err(UnfitReason::InsufficientResource { resource });
    }

    Ok(())
}

/// `check_fit` as a plain bool, for callers that track their own remaining
/// capacity (the binpacking estimator).
pub fn can_schedule(pod: &Pod, node: &Node, remaining: &Resources) -> bool {
    check_fit(pod, node, remaining).is_ok()
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Required terms are a disjunction: any one fully-satisfied term matches.
/// No required terms means no restriction.
fn required_affinity_matches(
    affinity: Option<&NodeAffinity>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(affinity) = affinity else { return true };
    if affinity.required_terms.is_empty() {
        return true;
    }
    affinity
        .required_terms
        .iter()
        .any(|term| term_matches(term.match_expressions.as_slice(), labels))
}

pub(crate) fn term_matches(exprs: &[MatchExpression], labels: &BTreeMap<String, String>) -> bool {
    exprs.iter().all(|expr| expression_matches(expr, labels))
}

fn expression_matches(expr: &MatchExpression, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    match expr.operator {
        MatchOperator::In => value.is_some_and(|v| expr.values.contains(v)),
        MatchOperator::NotIn => !value.is_some_and(|v| expr.values.contains(v)),
        MatchOperator::Exists => value.is_some(),
        MatchOperator::DoesNotExist => value.is_none(),
    }
}

/// First `NoSchedule`/`NoExecute` taint the pod does not tolerate.
/// `PreferNoSchedule` never blocks — it is scored as a soft penalty.
fn first_untolerated_taint<'a>(
    taints: &'a [Taint],
    tolerations: &[Toleration],
) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
        .find(|t| !tolerations.iter().any(|tol| tolerates(tol, t)))
}

pub(crate) fn tolerates(tol: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = tol.effect
        && effect != taint.effect
    {
        return false;
    }
    match tol.operator {
        // Empty key with Exists tolerates everything.
        TolerationOperator::Exists => tol.key.is_empty() || tol.key == taint.key,
        TolerationOperator::Equal => tol.key == taint.key && tol.value == taint.value,
    }
}

fn first_short_resource(requests: &Resources, remaining: &Resources) -> Option<String> {
    if requests.cpu_millis > remaining.cpu_millis {
        return Some("cpu".to_string());
    }
    if requests.memory_bytes > remaining.memory_bytes {
        return Some("memory".to_string());
    }
    if requests.ephemeral_storage_bytes > remaining.ephemeral_storage_bytes {
        return Some("ephemeral-storage".to_string());
    }
    for (name, &qty) in &requests.extended {
        if qty > remaining.extended.get(name).copied().unwrap_or(0) {
            return Some(name.clone());
        }
    }
    None
}

/// Count of `PreferNoSchedule` taints the pod does not tolerate — a soft
/// penalty in placement scoring.
pub(crate) fn soft_taint_penalty(node: &Node, pod: &Pod) -> i64 {
    node.taints
        .iter()
        .filter(|t| t.effect == TaintEffect::PreferNoSchedule)
        .filter(|t| !pod.tolerations.iter().any(|tol| tolerates(tol, t)))
        .count() as i64
}
