//! gridscale-model — domain types for the scaling decision engine.
//!
//! Everything the engine reasons about lives here: resource quantities with
//! exact integer comparison, nodes and pods with their scheduling
//! constraints, disruption budgets, the immutable per-tick
//! [`ClusterSnapshot`] (copy-on-write via `Arc` structural sharing), node
//! pool templates with similarity fingerprints, the abstract [`NodePool`]
//! interface implemented by provider adapters, and the decision types the
//! engine emits.
//!
//! This crate holds data, not policy. Fit checks live in `gridscale-sim`,
//! health/backoff state in `gridscale-registry`.

pub mod decision;
pub mod pool;
pub mod resources;
pub mod snapshot;
pub mod types;

pub use decision::{ScaleDownDecision, ScaleDownReason, ScaleUpDecision};
pub use pool::{BoxFuture, NodePool, NodeTemplate, headroom, pool_of, similarity_groups};
pub use resources::{ResourceError, Resources};
pub use snapshot::ClusterSnapshot;
pub use types::*;
