//! Function registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::builtin::{EchoFunction, FailFunction, SleepFunction};
use crate::r#trait::{FunctionInvoker, InvokeError, TargetFunction};

/// Registry of target functions, keyed by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TargetFunction>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoFunction));
        registry.register(Arc::new(FailFunction));
        registry.register(Arc::new(SleepFunction));
        registry
    }

    /// Register a function under its own name, replacing any previous one.
    pub fn register(&mut self, function: Arc<dyn TargetFunction>) -> Option<Arc<dyn TargetFunction>> {
        self.functions.insert(function.name().to_string(), function)
    }

    /// Unregister a function.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn TargetFunction>> {
        self.functions.remove(name)
    }

    /// Get a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TargetFunction>> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl FunctionInvoker for FunctionRegistry {
    async fn invoke(&self, function_id: &str, payload: &[u8]) -> Result<serde_json::Value, InvokeError> {
        let function = self
            .get(function_id)
            .ok_or_else(|| InvokeError::FunctionNotFound(function_id.to_string()))?;

        let input: serde_json::Value = serde_json::from_slice(payload)?;

        debug!("Invoking function {}", function_id);
        Ok(function.call(input).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_round_trip() {
        let registry = FunctionRegistry::with_builtins();
        let output = registry.invoke("echo", b"[1,2,3]").await.unwrap();
        assert_eq!(output, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_unknown_function_wins_over_bad_payload() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.invoke("does-not-exist", b"invalid JSON").await.unwrap_err();
        assert!(matches!(err, InvokeError::FunctionNotFound(ref id) if id == "does-not-exist"));
        assert!(err.to_string().contains("Function not found"));
    }

    #[tokio::test]
    async fn test_bad_payload() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.invoke("echo", b"invalid JSON").await.unwrap_err();
        assert!(matches!(err, InvokeError::PayloadParse(_)));
        assert!(err.to_string().starts_with("Unable to parse payload: "));
    }

    #[tokio::test]
    async fn test_failure_message_is_verbatim() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.invoke("fail", b"[1,2,3]").await.unwrap_err();
        assert_eq!(err.to_string(), "triggered failure");
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.register(Arc::new(EchoFunction)).is_none());
        assert!(registry.register(Arc::new(EchoFunction)).is_some());
        assert_eq!(registry.names(), vec!["echo"]);

        assert!(registry.unregister("echo").is_some());
        assert!(registry.get("echo").is_none());
    }
}
