//! Node pools: templates, similarity fingerprints, and the abstract
//! provider interface.
//!
//! The engine never talks to a cloud API. Provider adapters implement
//! [`NodePool`]; the engine reads sizes and templates, and issues
//! `set_target_size` / `delete_nodes` calls whose completion it polls on
//! later ticks.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resources::Resources;
use crate::types::{Node, NodeId, PoolId, Taint};

/// Boxed future used by the object-safe [`NodePool`] mutators.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Label keys that identify a node rather than describe its shape.
/// Excluded from the similarity fingerprint so two pools in different
/// zones with identical machine shapes still balance together.
const FINGERPRINT_IGNORED_LABELS: &[&str] = &[
    "kubernetes.io/hostname",
    "topology.kubernetes.io/zone",
    "topology.kubernetes.io/region",
    "failure-domain.beta.kubernetes.io/zone",
];

/// Synthetic descriptor of what a newly created pool member looks like:
/// capacity, labels, taints — not backed by any real instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub capacity: Resources,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl NodeTemplate {
    /// Similarity fingerprint: sha256 over the normalized capacity, labels
    /// (identity labels excluded), and taints. Pools with equal
    /// fingerprints are substitutable for balanced scaling.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.capacity.cpu_millis.to_be_bytes());
        hasher.update(self.capacity.memory_bytes.to_be_bytes());
        hasher.update(self.capacity.ephemeral_storage_bytes.to_be_bytes());
        for (name, qty) in &self.capacity.extended {
            hasher.update(name.as_bytes());
            hasher.update(qty.to_be_bytes());
        }
        for (key, value) in &self.labels {
            if FINGERPRINT_IGNORED_LABELS.contains(&key.as_str()) {
                continue;
            }
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        for taint in &self.taints {
            hasher.update(taint.key.as_bytes());
            hasher.update([0]);
            hasher.update(taint.value.as_bytes());
            hasher.update([0]);
            hasher.update(format!("{:?}", taint.effect).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Materialize a hypothetical node from this template, for binpacking
    /// estimates and pending-capacity simulation.
    pub fn instantiate(&self, pool_id: &str, seq: u32) -> Node {
        Node {
            id: format!("template-{pool_id}-{seq}"),
            pool_id: Some(pool_id.to_string()),
            capacity: self.capacity.clone(),
            labels: self.labels.clone(),
            taints: self.taints.clone(),
            ready: true,
            created_at: 0,
        }
    }
}

/// Abstract, elastically resizable node pool — the only surface through
/// which the engine touches infrastructure. Size reads are cheap and
/// synchronous (adapters cache them); mutators are network-bound and
/// return boxed futures the engine drives under a timeout.
pub trait NodePool: Send + Sync {
    fn id(&self) -> &str;

    /// Desired size as last requested from the provider.
    fn target_size(&self) -> u32;

    fn min_size(&self) -> u32;

    fn max_size(&self) -> u32;

    /// What a newly created member of this pool would look like.
    fn template(&self) -> NodeTemplate;

    /// Request a new target size. The provider acknowledges asynchronously;
    /// the engine records the request as in-flight and reconciles later.
    fn set_target_size(&self, n: u32) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Request deletion of specific nodes (drained or unregistered).
    fn delete_nodes(&self, ids: Vec<NodeId>) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Find the pool owning a node id, if any.
pub fn pool_of<'a>(
    pools: &'a [std::sync::Arc<dyn NodePool>],
    pool_id: &str,
) -> Option<&'a std::sync::Arc<dyn NodePool>> {
    pools.iter().find(|p| p.id() == pool_id)
}

/// Remaining headroom before a pool hits its max size.
pub fn headroom(pool: &dyn NodePool) -> u32 {
    pool.max_size().saturating_sub(pool.target_size())
}

/// Group pool ids by template fingerprint.
pub fn similarity_groups(
    pools: &[std::sync::Arc<dyn NodePool>],
) -> BTreeMap<String, Vec<PoolId>> {
    let mut groups: BTreeMap<String, Vec<PoolId>> = BTreeMap::new();
    for pool in pools {
        groups
            .entry(pool.template().fingerprint())
            .or_default()
            .push(pool.id().to_string());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(cpu: i64, mem: i64) -> NodeTemplate {
        NodeTemplate {
            capacity: Resources::new(cpu, mem),
            labels: BTreeMap::new(),
            taints: Vec::new(),
        }
    }

    #[test]
    fn identical_templates_share_fingerprint() {
        assert_eq!(template(4000, 8192).fingerprint(), template(4000, 8192).fingerprint());
    }

    #[test]
    fn capacity_changes_fingerprint() {
        assert_ne!(template(4000, 8192).fingerprint(), template(8000, 8192).fingerprint());
    }

    #[test]
    fn zone_label_does_not_change_fingerprint() {
        let mut a = template(4000, 8192);
        a.labels
            .insert("topology.kubernetes.io/zone".to_string(), "us-east-1a".to_string());
        let mut b = template(4000, 8192);
        b.labels
            .insert("topology.kubernetes.io/zone".to_string(), "us-east-1b".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn workload_label_changes_fingerprint() {
        let mut a = template(4000, 8192);
        a.labels.insert("gpu".to_string(), "true".to_string());
        let b = template(4000, 8192);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn instantiate_carries_template_shape() {
        let mut t = template(4000, 8192);
        t.labels.insert("disk".to_string(), "ssd".to_string());
        let node = t.instantiate("pool-a", 3);
        assert_eq!(node.id, "template-pool-a-3");
        assert_eq!(node.pool_id.as_deref(), Some("pool-a"));
        assert_eq!(node.capacity.cpu_millis, 4000);
        assert_eq!(node.labels.get("disk").map(String::as_str), Some("ssd"));
        assert!(node.ready);
    }
}
