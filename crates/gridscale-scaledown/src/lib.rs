//! gridscale-scaledown — the scale-down planner.
//!
//! Finds nodes whose sustained utilization is below threshold, then proves
//! each one removable by simulated drain: fork the snapshot, evict the
//! node's pods, re-place every one of them on the remaining nodes (plus
//! any capacity the scale-up pass just ordered) without violating a
//! disruption budget. Confirmed removals are committed into the working
//! fork before the next candidate is checked, so a later candidate can
//! never double-claim capacity.
//!
//! The eligibility pre-pass only reads; the feasibility pass is strictly
//! serial in candidate order (lowest utilization first).

pub mod eligibility;
pub mod planner;

pub use eligibility::{Candidate, eligible_candidates};
pub use planner::{ScaleDownConfig, ScaleDownPlan, SkipReason, SkippedCandidate, plan_scale_down};
