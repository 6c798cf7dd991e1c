//! Completion waiter.
//!
//! Blocks until an operation's execution context has stopped and its record
//! holds a terminal status, or until a deadline passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use asyncop_core::{failure_output, OperationId, OperationRecord, OperationStatus, TaskHandle};
use asyncop_executor::{ExecutorError, ExitInfo, TaskExecutor};
use asyncop_storage::{RecordStore, StorageError};
use tracing::{debug, info, warn};

/// Waiter settings.
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    /// Delay between checks
    pub poll_interval: Duration,
    /// Mark operations whose context stopped without a result as RUNNER_FAILED
    pub reconcile_unexpected_stop: bool,
    /// How long a stopped context's record may stay RUNNING before reconciling
    pub stop_grace: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            reconcile_unexpected_stop: false,
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl WaiterConfig {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Enable or disable reconciliation of stopped contexts.
    pub fn with_reconcile_unexpected_stop(mut self, enabled: bool) -> Self {
        self.reconcile_unexpected_stop = enabled;
        self
    }

    /// Set the grace period before reconciling.
    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }
}

/// Errors waiting for an operation.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The deadline passed first
    #[error("Operation {id} did not complete within {waited:?}")]
    Timeout {
        /// Operation ID
        id: OperationId,
        /// Time spent waiting
        waited: Duration,
    },

    /// Record store error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Executor error
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Waits for operations to complete.
pub struct CompletionWaiter {
    records: Arc<dyn RecordStore>,
    executor: Arc<dyn TaskExecutor>,
    config: WaiterConfig,
}

impl CompletionWaiter {
    /// Create a waiter with default settings.
    pub fn new(records: Arc<dyn RecordStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            records,
            executor,
            config: WaiterConfig::default(),
        }
    }

    /// Replace the settings.
    pub fn with_config(mut self, config: WaiterConfig) -> Self {
        self.config = config;
        self
    }

    /// Wait for the context to stop and the record to become terminal.
    ///
    /// Once both are observed the executor forgets the context, so a handle
    /// can be waited on only once.
    pub async fn wait(
        &self,
        id: OperationId,
        task_handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<OperationRecord, WaitError> {
        let start = Instant::now();
        let mut stopped_since: Option<Instant> = None;

        loop {
            let exit = self.executor.poll_stop(task_handle).await?;
            let record = self.records.get(id).await?;

            if let Some(exit) = exit {
                if record.is_terminal() {
                    info!("Operation {} completed with {}", id, record.status);
                    self.forget(task_handle).await;
                    return Ok(record);
                }

                let since = *stopped_since.get_or_insert_with(Instant::now);
                if self.config.reconcile_unexpected_stop && since.elapsed() >= self.config.stop_grace {
                    let record = self.reconcile(id, task_handle, &exit).await?;
                    self.forget(task_handle).await;
                    return Ok(record);
                }
                debug!("Task {} stopped, operation {} still running", task_handle, id);
            }

            if start.elapsed() >= timeout {
                warn!("Timed out waiting for operation {}", id);
                return Err(WaitError::Timeout {
                    id,
                    waited: start.elapsed(),
                });
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn forget(&self, task_handle: &TaskHandle) {
        if let Err(e) = self.executor.forget(task_handle).await {
            debug!("Task {} not forgotten: {}", task_handle, e);
        }
    }

    async fn reconcile(
        &self,
        id: OperationId,
        task_handle: &TaskHandle,
        exit: &ExitInfo,
    ) -> Result<OperationRecord, WaitError> {
        let message = format!(
            "Execution context {} stopped before the operation reported a result ({})",
            task_handle, exit
        );
        match self
            .records
            .update_terminal(id, OperationStatus::RunnerFailed, failure_output(message))
            .await
        {
            Ok(record) => {
                warn!("Operation {} marked {}: task {} stopped", id, record.status, task_handle);
                Ok(record)
            }
            // The runner won the race.
            Err(StorageError::AlreadyTerminal { .. }) => Ok(self.records.get(id).await?),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Payload;
    use crate::test_support::Harness;
    use serde_json::json;

    fn fast() -> WaiterConfig {
        WaiterConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_record() {
        let harness = Harness::new();
        let response = harness
            .launcher()
            .start(harness.request("echo", Payload::Inline(json!([1, 2, 3]))))
            .await
            .unwrap();

        let record = harness
            .waiter(fast())
            .wait(response.id, &response.task_handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.status, OperationStatus::Succeeded);
        assert_eq!(record.output, Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_wait_forgets_finished_context() {
        let harness = Harness::new();
        let waiter = harness.waiter(fast());
        for i in 0..3 {
            let response = harness
                .launcher()
                .start(harness.request("echo", Payload::Inline(json!(i))))
                .await
                .unwrap();
            waiter
                .wait(response.id, &response.task_handle, Duration::from_secs(5))
                .await
                .unwrap();

            assert!(matches!(
                harness.executor.poll_stop(&response.task_handle).await,
                Err(ExecutorError::UnknownTask(_))
            ));
            let err = waiter
                .wait(response.id, &response.task_handle, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, WaitError::Executor(ExecutorError::UnknownTask(_))));
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_on_hung_context() {
        let harness = Harness::hanging();
        let response = harness
            .launcher()
            .start(harness.request("echo", Payload::Inline(json!(null))))
            .await
            .unwrap();

        let err = harness
            .waiter(fast())
            .wait(response.id, &response.task_handle, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { id, .. } if id == response.id));
    }

    #[tokio::test]
    async fn test_stopped_context_left_running_without_reconciliation() {
        let harness = Harness::hanging();
        let response = harness
            .launcher()
            .start(harness.request("echo", Payload::Inline(json!(null))))
            .await
            .unwrap();
        harness.executor.terminate(&response.task_handle).await.unwrap();

        let err = harness
            .waiter(fast())
            .wait(response.id, &response.task_handle, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));
        let record = harness.records.get(response.id).await.unwrap();
        assert_eq!(record.status, OperationStatus::Running);
    }

    #[tokio::test]
    async fn test_reconcile_terminated_context() {
        let harness = Harness::hanging();
        let response = harness
            .launcher()
            .start(harness.request("echo", Payload::Inline(json!(null))))
            .await
            .unwrap();
        harness.executor.terminate(&response.task_handle).await.unwrap();

        let config = fast()
            .with_reconcile_unexpected_stop(true)
            .with_stop_grace(Duration::from_millis(30));
        let record = harness
            .waiter(config)
            .wait(response.id, &response.task_handle, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(record.status, OperationStatus::RunnerFailed);
        let message = record.error_message().unwrap();
        assert!(message.starts_with(&format!("Execution context {} stopped", response.task_handle)));
        assert_eq!(harness.records.get(response.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_override_result() {
        let harness = Harness::new();
        let response = harness
            .launcher()
            .start(harness.request("fail", Payload::Inline(json!({}))))
            .await
            .unwrap();

        let config = fast()
            .with_reconcile_unexpected_stop(true)
            .with_stop_grace(Duration::ZERO);
        let record = harness
            .waiter(config)
            .wait(response.id, &response.task_handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.status, OperationStatus::TaskFailed);
        assert_eq!(record.error_message(), Some("triggered failure"));
    }
}
