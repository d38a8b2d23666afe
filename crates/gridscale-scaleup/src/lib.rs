//! gridscale-scaleup — the scale-up orchestrator.
//!
//! Turns a set of unschedulable pods into `ScaleUpDecision`s:
//!
//! 1. Filter pools to those healthy, out of backoff, and below max size
//! 2. Per-pool binpacking estimate (greedy packing onto hypothetical
//!    template nodes) — fanned out over a `JoinSet`, read-only
//! 3. An expander strategy picks the winning pool
//! 4. Balanced scaling spreads the new nodes across pools with the same
//!    template fingerprint
//! 5. Global resource limits trim whole decisions from the tail
//!
//! Pods no pool's template can host are reported as permanently
//! unschedulable — a terminal classification, not an error.

pub mod binpack;
pub mod expander;
pub mod orchestrator;

pub use binpack::{BinpackEstimate, estimate};
pub use expander::ExpanderStrategy;
pub use orchestrator::{GlobalLimits, ScaleUpConfig, ScaleUpPlan, plan_scale_up};
