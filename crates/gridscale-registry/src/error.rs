//! Registry error types.

use thiserror::Error;

/// Errors from registry mutators.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown pool: {0}")]
    UnknownPool(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
