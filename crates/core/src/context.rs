//! Execution context configuration handed from the launcher to the runner.
//!
//! The launcher serializes an [`ExecutionContext`] into the environment of the
//! execution context it starts. The runner, started in a separate process,
//! reads it back before doing anything else. The document is versioned so a
//! runner never guesses at fields written by a newer launcher.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::OperationId;

/// Environment variable carrying the serialized context.
pub const CONTEXT_ENV: &str = "ASYNC_OPERATION_CONTEXT";

/// Schema version written by this build.
pub const CONTEXT_VERSION: u32 = 1;

/// Errors resolving an execution context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The context variable is not set
    #[error("execution context variable {0} is not set")]
    Missing(String),

    /// The context document is not valid
    #[error("malformed execution context: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The context was written by an incompatible launcher
    #[error("unsupported execution context version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the document
        found: u32,
        /// Version this build understands
        expected: u32,
    },
}

/// Configuration injected into an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Schema version
    pub version: u32,
    /// Operation this context reports for
    pub operation_id: OperationId,
    /// Where the runner finds the record store
    pub record_store_location: String,
    /// Function to invoke
    pub target_function_id: String,
    /// Location of the input payload
    pub payload_reference_uri: String,
}

impl ExecutionContext {
    /// Create a context at the current schema version.
    pub fn new(
        operation_id: OperationId,
        record_store_location: impl Into<String>,
        target_function_id: impl Into<String>,
        payload_reference_uri: impl Into<String>,
    ) -> Self {
        Self {
            version: CONTEXT_VERSION,
            operation_id,
            record_store_location: record_store_location.into(),
            target_function_id: target_function_id.into(),
            payload_reference_uri: payload_reference_uri.into(),
        }
    }

    /// Serialize into the environment entries injected at launch.
    pub fn to_env(&self) -> Result<HashMap<String, String>, ContextError> {
        let encoded = serde_json::to_string(self)?;
        Ok(HashMap::from([(CONTEXT_ENV.to_string(), encoded)]))
    }

    /// Parse a serialized context document.
    pub fn decode(encoded: &str) -> Result<Self, ContextError> {
        let context: ExecutionContext = serde_json::from_str(encoded)?;
        if context.version != CONTEXT_VERSION {
            return Err(ContextError::UnsupportedVersion {
                found: context.version,
                expected: CONTEXT_VERSION,
            });
        }
        Ok(context)
    }

    /// Resolve from an injected environment map.
    pub fn from_env_map(env: &HashMap<String, String>) -> Result<Self, ContextError> {
        let encoded = env
            .get(CONTEXT_ENV)
            .ok_or_else(|| ContextError::Missing(CONTEXT_ENV.to_string()))?;
        Self::decode(encoded)
    }

    /// Resolve from the current process environment.
    pub fn from_process_env() -> Result<Self, ContextError> {
        let encoded =
            std::env::var(CONTEXT_ENV).map_err(|_| ContextError::Missing(CONTEXT_ENV.to_string()))?;
        Self::decode(&encoded)
    }
}
