use thiserror::Error;

use crate::core_backend::ApiError;
use crate::persistence::PersistenceError;

pub type IdsResult<T> = Result<T, IdsError>;

#[derive(Debug, Error)]
pub enum IdsError {
    #[error("Identifier backend error: {0}")]
    Api(#[from] ApiError),

    #[error("Identifier persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl IdsError {
    /// Whether repeating the call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            IdsError::Api(e) => e.is_transient(),
            IdsError::Persistence(_) => false,
        }
    }
}
