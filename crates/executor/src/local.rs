//! In-process task executor.
//!
//! Each launch runs the configured [`Entrypoint`] on its own tokio task with
//! the launch environment, standing in for a container that starts the runner
//! binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use asyncop_core::TaskHandle;
use tracing::{info, warn};

use crate::executor::{
    report_exit, ExecutorError, ExitInfo, LaunchError, LaunchSpec, StopSignal, TaskExecutor,
    TaskTable,
};

/// The program an execution context runs.
#[async_trait]
pub trait Entrypoint: Send + Sync + 'static {
    /// Run to completion with `environment` and return an exit code.
    async fn run(&self, environment: HashMap<String, String>) -> i32;
}

/// Executor that runs an [`Entrypoint`] on tokio tasks.
pub struct LocalTaskExecutor<E: Entrypoint> {
    entrypoint: Arc<E>,
    task_definitions: Vec<String>,
    table: TaskTable,
}

impl<E: Entrypoint> LocalTaskExecutor<E> {
    /// Create an executor accepting any task definition ID.
    pub fn new(entrypoint: E) -> Self {
        Self {
            entrypoint: Arc::new(entrypoint),
            task_definitions: Vec::new(),
            table: TaskTable::default(),
        }
    }

    /// Only accept the listed task definition.
    pub fn with_task_definition(mut self, id: impl Into<String>) -> Self {
        self.task_definitions.push(id.into());
        self
    }

    /// Limit concurrently running tasks on a cluster.
    pub fn with_cluster_capacity(mut self, cluster_id: impl Into<String>, limit: usize) -> Self {
        self.table.set_capacity(cluster_id, limit);
        self
    }

    /// Stop a running context. Returns false if it had already stopped.
    pub async fn terminate(&self, handle: &TaskHandle) -> Result<bool, ExecutorError> {
        self.table.terminate(handle).await
    }
}

#[async_trait]
impl<E: Entrypoint> TaskExecutor for LocalTaskExecutor<E> {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskHandle, LaunchError> {
        if !self.task_definitions.is_empty()
            && !self.task_definitions.contains(&spec.task_definition_id)
        {
            return Err(LaunchError::UnknownTaskDefinition(spec.task_definition_id));
        }

        let exit = self.table.reserve(&spec).await?;
        let handle = spec.handle.clone();

        let entrypoint = self.entrypoint.clone();
        let environment = spec.environment;
        let work = tokio::spawn(async move { entrypoint.run(environment).await });
        self.table
            .attach_stop(&handle, StopSignal::Abort(work.abort_handle()))
            .await;

        let monitored = handle.clone();
        tokio::spawn(async move {
            let info = match work.await {
                Ok(code) => ExitInfo::exited(code),
                Err(e) if e.is_cancelled() => ExitInfo::terminated("Task stopped by user"),
                Err(e) => {
                    warn!("Task {} panicked: {}", monitored, e);
                    ExitInfo::terminated(format!("Task failed: {}", e))
                }
            };
            info!("Task {} stopped: {}", monitored, info);
            report_exit(&exit, info);
        });

        info!(
            "Launched task {} ({}) on cluster {}",
            handle, spec.task_definition_id, spec.cluster_id
        );
        Ok(handle)
    }

    async fn poll_stop(&self, handle: &TaskHandle) -> Result<Option<ExitInfo>, ExecutorError> {
        self.table.poll(handle).await
    }

    async fn wait_for_stop(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError> {
        self.table.wait(handle).await
    }

    async fn forget(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError> {
        self.table.forget(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ExitWith(i32);

    #[async_trait]
    impl Entrypoint for ExitWith {
        async fn run(&self, environment: HashMap<String, String>) -> i32 {
            environment
                .get("EXIT_CODE")
                .and_then(|code| code.parse().ok())
                .unwrap_or(self.0)
        }
    }

    struct Hang;

    #[async_trait]
    impl Entrypoint for Hang {
        async fn run(&self, _environment: HashMap<String, String>) -> i32 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            0
        }
    }

    fn spec(env: &[(&str, &str)]) -> LaunchSpec {
        LaunchSpec {
            handle: TaskHandle::new(),
            cluster_id: "local".to_string(),
            task_definition_id: "runner".to_string(),
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_launch_passes_environment() {
        let executor = LocalTaskExecutor::new(ExitWith(0));
        let handle = executor.launch(spec(&[("EXIT_CODE", "7")])).await.unwrap();

        let exit = executor.wait_for_stop(&handle).await.unwrap();
        assert_eq!(exit.exit_code, Some(7));
        assert_eq!(executor.poll_stop(&handle).await.unwrap(), Some(exit));
    }

    #[tokio::test]
    async fn test_unknown_task_definition() {
        let executor = LocalTaskExecutor::new(ExitWith(0)).with_task_definition("runner");
        let mut other = spec(&[]);
        other.task_definition_id = "something-else".to_string();

        let err = executor.launch(other).await.unwrap_err();
        assert!(matches!(err, LaunchError::UnknownTaskDefinition(ref id) if id == "something-else"));
        executor.launch(spec(&[])).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_running_task() {
        let executor = LocalTaskExecutor::new(Hang).with_cluster_capacity("local", 1);
        let handle = executor.launch(spec(&[])).await.unwrap();
        assert_eq!(executor.poll_stop(&handle).await.unwrap(), None);
        assert!(matches!(
            executor.launch(spec(&[])).await,
            Err(LaunchError::CapacityExhausted { .. })
        ));

        assert!(executor.terminate(&handle).await.unwrap());
        let exit = executor.wait_for_stop(&handle).await.unwrap();
        assert_eq!(exit.exit_code, None);
        assert!(!exit.success());

        assert!(!executor.terminate(&handle).await.unwrap());
        executor.launch(spec(&[])).await.unwrap();
    }
}
