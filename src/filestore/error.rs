//! Error taxonomy for filestore operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilestoreError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid parent '{parent_id}': {reason}")]
    InvalidParent { parent_id: String, reason: &'static str },

    #[error("moving '{id}' under '{parent_id}' would make it its own ancestor")]
    CycleDetected { id: String, parent_id: String },

    #[error("folder depth {depth} exceeds the limit of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("entry '{id}' not found")]
    NotFound { id: String },

    #[error("entry '{id}' must be in the trash before it can be deleted permanently")]
    NotTrashed { id: String },

    #[error("entry '{id}' belongs to another owner")]
    OwnershipMismatch { id: String },

    #[error("create for dedup token '{token}' has not finished; retry later")]
    CreateInProgress { token: String },

    #[error("content rejected: {reason}")]
    InvalidContent { reason: String },

    #[error("content storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("hierarchy inconsistent at '{id}': {reason}")]
    Inconsistent { id: String, reason: &'static str },

    #[error("stored entry could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl FilestoreError {
    /// Stable snake_case code used by protocol frontends.
    pub fn code(&self) -> &'static str {
        match self {
            FilestoreError::InvalidName { .. } => "invalid_name",
            FilestoreError::InvalidParent { .. } => "invalid_parent",
            FilestoreError::CycleDetected { .. } => "cycle_detected",
            FilestoreError::DepthExceeded { .. } => "depth_exceeded",
            FilestoreError::NotFound { .. } => "not_found",
            FilestoreError::NotTrashed { .. } => "not_trashed",
            FilestoreError::OwnershipMismatch { .. } => "ownership_mismatch",
            FilestoreError::CreateInProgress { .. } => "create_in_progress",
            FilestoreError::InvalidContent { .. } => "invalid_content",
            FilestoreError::StorageUnavailable(_) => "storage_unavailable",
            FilestoreError::Inconsistent { .. } => "inconsistent_hierarchy",
            FilestoreError::Corrupt(_) => "corrupt_entry",
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        FilestoreError::NotFound { id: id.into() }
    }
}

pub type FilestoreResult<T> = Result<T, FilestoreError>;
