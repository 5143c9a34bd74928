//! Controller error types

use spot_cache::CacheError;
use spot_provider::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// Provider failures pass through with their original text.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
