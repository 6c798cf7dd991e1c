//! Async operation core data models.
//!
//! This crate defines the operation record shared by the submitter and the
//! runner, and the execution context configuration that travels between them.

#![warn(missing_docs)]

// Core identities
mod id;

// Operation lifecycle
mod operation;
mod context;

// Re-exports
pub use id::*;

pub use operation::{
    OperationRecord, OperationStatus, ParseStatusError, RecordFilter, TransitionError,
    failure_output, now_millis,
};
pub use context::{ExecutionContext, ContextError, CONTEXT_ENV, CONTEXT_VERSION};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
