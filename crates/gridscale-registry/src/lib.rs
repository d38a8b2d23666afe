//! gridscale-registry — the cluster state registry.
//!
//! The one component with long-lived mutable state. Tracks, per pool:
//! health phase, exponential backoff, expected registrations after a
//! scale-up, and in-flight drain records; plus the per-node
//! unneeded-since map the scale-down observation window reads.
//!
//! The orchestrator and planner only *read* health state and report
//! outcomes back — they never synthesize it. All state is in-memory and
//! rebuilt from observation after a restart (backoff history loss is
//! accepted).
//!
//! # Pool state machine
//!
//! ```text
//! Stable ──scale-up attempt──▶ ScalingUp ──ready catches up──▶ Stable
//! Stable ──provider failure──▶ Backoff(until) ──timer──▶ Stable
//! Stable ──ready < target────▶ Unhealthy ──ready catches up──▶ Stable
//! ```
//!
//! Mutators are idempotent within a tick: the same outcome applied twice
//! changes state once.

pub mod error;
pub mod health;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use health::{BackoffConfig, PoolHealth, PoolPhase};
pub use registry::{DrainRecord, ObservedNode, Outcome, RegistryConfig, ScalingRegistry};
