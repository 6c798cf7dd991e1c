//! Record store trait abstraction.

use async_trait::async_trait;
use asyncop_core::{OperationId, OperationRecord, OperationStatus, RecordFilter, TransitionError};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(OperationId),

    /// An item with the same ID already exists
    #[error("Already exists: {0}")]
    AlreadyExists(OperationId),

    /// The record already left RUNNING
    #[error("Operation {id} already finished with status {status}")]
    AlreadyTerminal {
        /// Operation ID
        id: OperationId,
        /// Status currently stored
        status: OperationStatus,
    },

    /// The requested write is not a terminal transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A stored record could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Record store location could not be resolved
    #[error("Invalid record store location: {0}")]
    InvalidLocation(String),
}

impl From<TransitionError> for StorageError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::AlreadyTerminal { id, status } => {
                StorageError::AlreadyTerminal { id, status }
            }
            other @ TransitionError::NotTerminal { .. } => {
                StorageError::InvalidTransition(other.to_string())
            }
        }
    }
}

/// Durable keyed storage for operation records.
///
/// Pure CRUD. The only mutation after creation is the single terminal write,
/// which backends apply atomically per key and refuse once a record is
/// terminal.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record. Fails with `AlreadyExists` on an ID collision.
    async fn create(&self, record: &OperationRecord) -> Result<()>;

    /// Load a record. Fails with `NotFound` if absent.
    async fn get(&self, id: OperationId) -> Result<OperationRecord>;

    /// Write the terminal status and output, returning the stored record.
    async fn update_terminal(
        &self,
        id: OperationId,
        status: OperationStatus,
        output: serde_json::Value,
    ) -> Result<OperationRecord>;

    /// List records matching the filter, newest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>>;
}
