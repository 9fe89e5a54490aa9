use thiserror::Error;

use crate::{SagaId, SagaState, Version};

/// Errors that can occur when reading or writing saga state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row was written by someone else since it was read.
    #[error("Version conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga with this ID was already inserted.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The saga reached a terminal state and can no longer be written.
    #[error("Saga {saga_id} is in terminal state {state} and cannot be modified")]
    TerminalSaga { saga_id: SagaId, state: SagaState },

    /// The requested state change is not in the transition table.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A conditional write found fields the caller relied on changed since
    /// its read.
    #[error("Saga {saga_id} changed since it was read: {detail}")]
    Stale { saga_id: SagaId, detail: String },

    /// A persisted value could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns true if retrying the read-modify-write may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
