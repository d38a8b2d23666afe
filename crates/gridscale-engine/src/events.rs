//! Status events emitted by the control loop.
//!
//! Every noteworthy per-tick observation is both logged and collected on
//! the [`TickOutcome`](crate::engine::TickOutcome) so callers (and tests)
//! can inspect what the engine saw without parsing log output.

use serde::{Deserialize, Serialize};

use gridscale_model::{NodeId, PodId, PoolId};
use gridscale_scaledown::SkipReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// An entity with a negative resource quantity was dropped from the
    /// tick's snapshot.
    InvalidResources { kind: EntityKind, id: String },
    /// A node references a pool no provider adapter serves.
    UnknownPool { node_id: NodeId, pool_id: PoolId },
    /// A node never became Ready within the registration grace period.
    NodeUnregistered { node_id: NodeId, pool_id: PoolId },
    /// A pod no pool's template can host.
    PodUnschedulable { pod_id: PodId },
    /// The pool entered backoff this tick.
    PoolBackoff { pool_id: PoolId, until: u64 },
    /// The pool left backoff this tick.
    PoolRecovered { pool_id: PoolId },
    /// A scale-down candidate was not turned into a decision.
    ScaleDownSkipped { node_id: NodeId, reason: SkipReason },
    ScaleUpIssued { pool_id: PoolId, delta: u32 },
    ScaleUpFailed { pool_id: PoolId, delta: u32 },
    ScaleDownIssued { node_id: NodeId, pool_id: PoolId },
    ScaleDownFailed { node_id: NodeId, pool_id: PoolId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Pod,
}
