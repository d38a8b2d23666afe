//! Decisions emitted by the engine.
//!
//! Produced fresh each tick and handed to the executing collaborator; the
//! only trace they leave behind is the pending-acknowledgment records the
//! registry keeps until the provider confirms.

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PoolId};

/// Grow a pool by `delta` nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpDecision {
    pub pool_id: PoolId,
    pub delta: u32,
}

/// Why a node was selected for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDownReason {
    /// Sustained low utilization with all pods re-placeable elsewhere.
    Underutilized,
    /// Never registered after a scale-up; forced removal.
    Unregistered,
}

/// Remove a specific node, after draining it within the grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleDownDecision {
    pub node_id: NodeId,
    pub pool_id: PoolId,
    pub reason: ScaleDownReason,
    /// Seconds the executor grants running pods before termination.
    pub grace_period_secs: u64,
}
