//! Target function abstraction.

use async_trait::async_trait;

/// Error raised by a target function's own logic.
///
/// The message is recorded verbatim as the operation's failure output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FunctionError {
    /// Human readable message
    pub message: String,
}

impl FunctionError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors invoking a function by identifier.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// No function is registered under the identifier
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// The payload bytes are not valid JSON
    #[error("Unable to parse payload: {0}")]
    PayloadParse(#[from] serde_json::Error),

    /// The function ran and failed
    #[error("{0}")]
    Failed(#[from] FunctionError),
}

/// A named unit of business logic.
#[async_trait]
pub trait TargetFunction: Send + Sync {
    /// Get function name.
    fn name(&self) -> &str;

    /// Get function description.
    fn description(&self) -> &str;

    /// Run the function against a deserialized payload.
    async fn call(&self, payload: serde_json::Value) -> Result<serde_json::Value, FunctionError>;
}

/// Function invoker - runs functions by identifier.
///
/// Resolution happens before the payload is parsed, so an unknown identifier
/// is reported even when the payload is also unreadable.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Resolve `function_id`, parse `payload` and run the function.
    async fn invoke(&self, function_id: &str, payload: &[u8]) -> Result<serde_json::Value, InvokeError>;
}
