//! gridscale-sim — the scheduling-feasibility simulator.
//!
//! Pure functions answering one question: can this pod run on this node
//! (or somewhere in this snapshot)? Hard constraints are evaluated in a
//! fixed short-circuit order — selector/required affinity, taints,
//! resource fit — and resource fit uses exact integer comparison against
//! the node's *remaining* allocatable. Preferred affinity and spread are
//! soft signals used only to break ties between feasible nodes.
//!
//! Stateless and `Send + Sync`: everything here only reads its inputs, so
//! binpacking estimates can call it concurrently over a shared snapshot.

pub mod fit;
pub mod placement;

pub use fit::{UnfitReason, can_schedule, check_fit};
pub use placement::{find_placement, find_placement_excluding};
