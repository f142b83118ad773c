//! Group store error types

use thiserror::Error;

use super::types::GroupId;
use crate::core_backend::ApiError;
use crate::core_ids::IdsError;
use crate::persistence::PersistenceError;

/// Result type for store operations
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Group {0} not found")]
    NotFound(GroupId),

    #[error("Backend error: {0}")]
    Api(#[from] ApiError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<IdsError> for SyncError {
    fn from(e: IdsError) -> Self {
        match e {
            IdsError::Api(e) => SyncError::Api(e),
            IdsError::Persistence(e) => SyncError::Persistence(e),
        }
    }
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Api(e) => e.is_not_found(),
            _ => false,
        }
    }
}
