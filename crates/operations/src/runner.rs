//! Operation runner.
//!
//! Runs once inside an execution context: fetch the payload, invoke the
//! target function, then write the terminal status exactly once. Every
//! failure is terminal and nothing is retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use asyncop_core::{
    failure_output, ContextError, ExecutionContext, OperationRecord, OperationStatus,
};
use asyncop_executor::Entrypoint;
use asyncop_functions::{FunctionInvoker, InvokeError};
use asyncop_storage::{open_record_store, PayloadFetcher, StorageError};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Runner timeouts.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bound on fetching the payload
    pub fetch_timeout: Duration,
    /// Bound on the function invocation
    pub invoke_timeout: Duration,
    /// Bound on the terminal write
    pub write_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(60),
            invoke_timeout: Duration::from_secs(15 * 60),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Set the invocation timeout.
    pub fn with_invoke_timeout(mut self, invoke_timeout: Duration) -> Self {
        self.invoke_timeout = invoke_timeout;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

/// Why an operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The runner could not set up the call (payload or function unavailable)
    RunnerInfrastructure(String),
    /// The call itself failed (bad input, function error, timeout)
    TargetLogic(String),
}

impl RunFailure {
    /// Terminal status recorded for this failure.
    pub fn status(&self) -> OperationStatus {
        match self {
            RunFailure::RunnerInfrastructure(_) => OperationStatus::RunnerFailed,
            RunFailure::TargetLogic(_) => OperationStatus::TaskFailed,
        }
    }

    /// Message recorded as `output.message`.
    pub fn message(&self) -> &str {
        match self {
            RunFailure::RunnerInfrastructure(message) | RunFailure::TargetLogic(message) => message,
        }
    }
}

/// Failures that cannot be recorded on the operation.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The execution context configuration is missing or invalid
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The record store could not be opened or written
    #[error("Failed to record result: {0}")]
    Storage(#[from] StorageError),

    /// The terminal write did not finish in time
    #[error("Timed out writing result after {0:?}")]
    WriteTimeout(Duration),
}

/// Runs a single operation inside its execution context.
pub struct OperationRunner {
    fetcher: Arc<dyn PayloadFetcher>,
    invoker: Arc<dyn FunctionInvoker>,
    config: RunnerConfig,
}

impl OperationRunner {
    /// Create a runner with default timeouts.
    pub fn new(fetcher: Arc<dyn PayloadFetcher>, invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            fetcher,
            invoker,
            config: RunnerConfig::default(),
        }
    }

    /// Replace the timeouts.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the operation described by `context` and record its result.
    pub async fn run(&self, context: &ExecutionContext) -> Result<OperationRecord, RunnerError> {
        let records = open_record_store(&context.record_store_location).await?;
        info!(
            "Running operation {} with function {}",
            context.operation_id, context.target_function_id
        );

        let (status, output) = match self.execute(context).await {
            Ok(value) => (OperationStatus::Succeeded, value),
            Err(failure) => {
                warn!("Operation {} failed: {}", context.operation_id, failure.message());
                (failure.status(), failure_output(failure.message()))
            }
        };

        let write = records.update_terminal(context.operation_id, status, output);
        let record = timeout(self.config.write_timeout, write)
            .await
            .map_err(|_| RunnerError::WriteTimeout(self.config.write_timeout))??;
        info!("Operation {} finished with {}", record.id, record.status);
        Ok(record)
    }

    /// Resolve the context from an injected environment and run it.
    pub async fn run_from_env(
        &self,
        environment: &HashMap<String, String>,
    ) -> Result<OperationRecord, RunnerError> {
        let context = ExecutionContext::from_env_map(environment)?;
        self.run(&context).await
    }

    /// Fetch, parse and invoke, classifying any failure.
    pub async fn execute(&self, context: &ExecutionContext) -> Result<Value, RunFailure> {
        let uri = &context.payload_reference_uri;
        let payload = match timeout(self.config.fetch_timeout, self.fetcher.fetch(uri)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                return Err(RunFailure::RunnerInfrastructure(format!(
                    "Failed to fetch {}: {}",
                    uri, e
                )))
            }
            Err(_) => {
                return Err(RunFailure::RunnerInfrastructure(format!(
                    "Failed to fetch {}: timed out after {:?}",
                    uri, self.config.fetch_timeout
                )))
            }
        };

        let function_id = &context.target_function_id;
        let invocation = self.invoker.invoke(function_id, &payload);
        match timeout(self.config.invoke_timeout, invocation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ InvokeError::FunctionNotFound(_))) => {
                Err(RunFailure::RunnerInfrastructure(e.to_string()))
            }
            Ok(Err(e)) => Err(RunFailure::TargetLogic(e.to_string())),
            Err(_) => Err(RunFailure::TargetLogic(format!(
                "Function {} timed out after {:?}",
                function_id, self.config.invoke_timeout
            ))),
        }
    }
}

#[async_trait]
impl Entrypoint for OperationRunner {
    async fn run(&self, environment: HashMap<String, String>) -> i32 {
        match self.run_from_env(&environment).await {
            Ok(_) => 0,
            Err(e) => {
                error!("Runner failed: {}", e);
                1
            }
        }
    }
}
