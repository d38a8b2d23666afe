use thiserror::Error;

use gridscale_registry::RegistryError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The snapshot source failed; the whole tick is aborted, no decisions
    /// are made on stale data.
    #[error("snapshot source failed: {0}")]
    Snapshot(#[source] anyhow::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type EngineResult<T> = Result<T, EngineError>;
