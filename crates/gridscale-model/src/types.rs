//! Core domain types: nodes, pods, scheduling constraints, disruption
//! budgets.
//!
//! These mirror the live cluster objects the engine consumes. They carry no
//! behavior beyond cheap classification accessors; fit evaluation lives in
//! `gridscale-sim`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a pod (namespace-scoped).
pub type PodId = String;

/// Unique identifier for a node pool.
pub type PoolId = String;

// ── Taints & tolerations ──────────────────────────────────────────

/// Effect of a node taint on scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint on a node. Pods must tolerate `NoSchedule`/`NoExecute` taints
/// to land there; `PreferNoSchedule` is only a soft repulsion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

/// How a toleration matches a taint's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TolerationOperator {
    /// Key and value must both match.
    Equal,
    /// Key presence alone matches, any value.
    Exists,
}

/// A pod's toleration of node taints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint.
    pub key: String,
    pub operator: TolerationOperator,
    pub value: String,
    /// `None` matches taints of any effect.
    pub effect: Option<TaintEffect>,
}

// ── Node affinity ─────────────────────────────────────────────────

/// Operator for a single label match expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One requirement against a node's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub key: String,
    pub operator: MatchOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A conjunction of match expressions. A node satisfies the term if it
/// satisfies every expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<MatchExpression>,
}

/// A weighted soft-preference term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredSchedulingTerm {
    pub weight: i32,
    pub term: NodeSelectorTerm,
}

/// Node affinity rules for a pod. `required_terms` is a disjunction (any
/// one term satisfied is enough); `preferred_terms` only influence
/// tie-breaking, never feasibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    pub required_terms: Vec<NodeSelectorTerm>,
    pub preferred_terms: Vec<PreferredSchedulingTerm>,
}

// ── Node ──────────────────────────────────────────────────────────

/// A cluster node as observed in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// The pool this node belongs to. `None` for nodes outside any
    /// elastic pool (those are never scale-down candidates).
    pub pool_id: Option<PoolId>,
    pub capacity: Resources,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub ready: bool,
    /// Unix timestamp (seconds) of node creation.
    pub created_at: u64,
}

// ── Pod ───────────────────────────────────────────────────────────

/// What owns a pod — drives eviction-safety classification and
/// disruption-budget matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner", rename_all = "snake_case")]
pub enum PodOwner {
    /// Managed by a DaemonSet: recreated on every node, never drained.
    DaemonSet { name: String },
    /// Static pod bound to its node's kubelet config.
    Static,
    /// Mirror pod reflecting a static pod into the API.
    Mirror,
    /// A replicated controller (Deployment, ReplicaSet, StatefulSet, Job).
    Controller { kind: String, name: String },
    /// No owner — losing the node loses the pod permanently.
    None,
}

/// A pod as observed in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub namespace: String,
    /// The node this pod is assigned to, or `None` if pending.
    pub node_id: Option<NodeId>,
    pub requests: Resources,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    pub owner: PodOwner,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Explicit eviction override from annotation; `None` when unset.
    #[serde(default)]
    pub safe_to_evict: Option<bool>,
}

impl Pod {
    /// DaemonSet pods are recreated wherever nodes exist; the drain
    /// simulation neither re-places nor counts them.
    pub fn is_daemon(&self) -> bool {
        matches!(self.owner, PodOwner::DaemonSet { .. })
    }

    /// Whether this pod may be evicted for a scale-down. Static, mirror,
    /// and controller-less pods pin their node; an explicit
    /// `safe_to_evict = false` annotation does the same.
    pub fn is_evictable(&self) -> bool {
        if self.safe_to_evict == Some(false) {
            return false;
        }
        match self.owner {
            PodOwner::Static | PodOwner::Mirror | PodOwner::None => false,
            PodOwner::DaemonSet { .. } | PodOwner::Controller { .. } => true,
        }
    }
}

// ── Disruption budgets ────────────────────────────────────────────

/// A pod disruption budget. Matches pods in its namespace whose labels
/// contain every selector entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    pub id: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    /// How many matched pods may currently be disrupted. Zero blocks
    /// eviction of every matched pod.
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.namespace == self.namespace
            && self
                .selector
                .iter()
                .all(|(k, v)| pod.labels.get(k) == Some(v))
    }
}
