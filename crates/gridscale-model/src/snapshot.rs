//! Immutable per-tick cluster snapshot with cheap what-if forks.
//!
//! The live snapshot is built once per tick and never mutated. Scale-down
//! simulation calls [`ClusterSnapshot::fork`] and mutates the fork; nodes
//! and pods are held behind `Arc`, so a fork copies only the index maps and
//! shares every record it does not touch.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;
use crate::types::{Node, NodeId, Pod, PodDisruptionBudget, PodId};

/// Point-in-time view of the cluster: nodes, pods, disruption budgets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    nodes: BTreeMap<NodeId, Arc<Node>>,
    pods: BTreeMap<PodId, Arc<Pod>>,
    pdbs: Vec<Arc<PodDisruptionBudget>>,
    /// node id → pods assigned to it (sorted by pod id for determinism).
    pods_by_node: BTreeMap<NodeId, Vec<PodId>>,
}

impl ClusterSnapshot {
    /// Build a snapshot from observed cluster objects. Pods assigned to a
    /// node absent from `nodes` keep their assignment but are not indexed
    /// under any node.
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>, pdbs: Vec<PodDisruptionBudget>) -> Self {
        let nodes: BTreeMap<NodeId, Arc<Node>> = nodes
            .into_iter()
            .map(|n| (n.id.clone(), Arc::new(n)))
            .collect();

        let mut pods_by_node: BTreeMap<NodeId, Vec<PodId>> = BTreeMap::new();
        let mut pod_map = BTreeMap::new();
        for pod in pods {
            if let Some(node_id) = &pod.node_id
                && nodes.contains_key(node_id)
            {
                pods_by_node
                    .entry(node_id.clone())
                    .or_default()
                    .push(pod.id.clone());
            }
            pod_map.insert(pod.id.clone(), Arc::new(pod));
        }
        for ids in pods_by_node.values_mut() {
            ids.sort();
        }

        Self {
            nodes,
            pods: pod_map,
            pdbs: pdbs.into_iter().map(Arc::new).collect(),
            pods_by_node,
        }
    }

    /// Fork for what-if simulation. O(index size); all records shared.
    pub fn fork(&self) -> ClusterSnapshot {
        self.clone()
    }

    // ── Read access ───────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pod(&self, id: &str) -> Option<&Arc<Pod>> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Arc<Pod>> {
        self.pods.values()
    }

    pub fn pdbs(&self) -> &[Arc<PodDisruptionBudget>] {
        &self.pdbs
    }

    /// Pods assigned to the given node, in pod-id order.
    pub fn pods_on(&self, node_id: &str) -> impl Iterator<Item = &Arc<Pod>> {
        self.pods_by_node
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.pods.get(id))
    }

    /// Pods with no node assignment, in pod-id order.
    pub fn unscheduled_pods(&self) -> Vec<Arc<Pod>> {
        self.pods
            .values()
            .filter(|p| p.node_id.is_none())
            .cloned()
            .collect()
    }

    /// Sum of resource requests of pods assigned to the node.
    pub fn used(&self, node_id: &str) -> Resources {
        let mut total = Resources::default();
        for pod in self.pods_on(node_id) {
            total.accumulate(&pod.requests);
        }
        total
    }

    /// Capacity minus used, clamped at zero per component.
    pub fn remaining(&self, node_id: &str) -> Resources {
        match self.nodes.get(node_id) {
            Some(node) => node.capacity.saturating_sub(&self.used(node_id)),
            None => Resources::default(),
        }
    }

    // ── Fork mutation (what-if simulation only) ───────────────────

    /// Add a hypothetical node (e.g. pending scale-up capacity).
    pub fn add_node(&mut self, node: Node) {
        self.pods_by_node.entry(node.id.clone()).or_default();
        self.nodes.insert(node.id.clone(), Arc::new(node));
    }

    /// Remove a node and unassign its pods. Returns the evicted pods in
    /// pod-id order (already rewritten as unassigned).
    pub fn remove_node(&mut self, node_id: &str) -> Vec<Arc<Pod>> {
        self.nodes.remove(node_id);
        let pod_ids = self.pods_by_node.remove(node_id).unwrap_or_default();
        let mut evicted = Vec::with_capacity(pod_ids.len());
        for pod_id in pod_ids {
            if let Some(pod) = self.pods.get(&pod_id) {
                let mut unassigned = (**pod).clone();
                unassigned.node_id = None;
                let arc = Arc::new(unassigned);
                self.pods.insert(pod_id, arc.clone());
                evicted.push(arc);
            }
        }
        evicted
    }

    /// Assign a pod to a node, updating the per-node index. No fit check —
    /// callers commit only placements the simulator already validated.
    pub fn assign_pod(&mut self, pod_id: &str, node_id: &str) {
        let Some(pod) = self.pods.get(pod_id) else {
            return;
        };
        if let Some(old_node) = &pod.node_id
            && let Some(ids) = self.pods_by_node.get_mut(old_node)
        {
            ids.retain(|id| id != pod_id);
        }
        let mut reassigned = (**pod).clone();
        reassigned.node_id = Some(node_id.to_string());
        self.pods.insert(pod_id.to_string(), Arc::new(reassigned));

        let ids = self.pods_by_node.entry(node_id.to_string()).or_default();
        ids.push(pod_id.to_string());
        ids.sort();
    }
}
