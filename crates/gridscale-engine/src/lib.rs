//! gridscale-engine — the control loop that turns cluster snapshots into
//! provider calls.
//!
//! Each tick is a strictly ordered pipeline over one immutable snapshot:
//! validate, observe pool health, force-remove unregistered nodes, find
//! pods that fit nowhere, plan and apply scale-ups, then plan and apply
//! scale-downs (which may re-place evicted pods onto capacity the
//! scale-up just ordered). Decisions within a tick never see each other's
//! provider effects — only the next tick's snapshot does.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;

pub use config::EngineConfig;
pub use engine::{Engine, SnapshotSource, TickOutcome};
pub use error::{EngineError, EngineResult};
pub use events::{EntityKind, StatusEvent};
