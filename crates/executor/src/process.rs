//! Child-process task executor.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use asyncop_core::TaskHandle;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::executor::{
    report_exit, ExecutorError, ExitInfo, LaunchError, LaunchSpec, StopSignal, TaskExecutor,
    TaskTable,
};

/// Program started for a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Executable path
    pub program: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl TaskDefinition {
    /// Create a definition.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Executor that starts each context as a child process.
#[derive(Clone, Default)]
pub struct ProcessTaskExecutor {
    definitions: HashMap<String, TaskDefinition>,
    table: TaskTable,
}

impl ProcessTaskExecutor {
    /// Create an executor with no task definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task definition.
    pub fn with_task_definition(mut self, id: impl Into<String>, definition: TaskDefinition) -> Self {
        self.definitions.insert(id.into(), definition);
        self
    }

    /// Limit concurrently running tasks on a cluster.
    pub fn with_cluster_capacity(mut self, cluster_id: impl Into<String>, limit: usize) -> Self {
        self.table.set_capacity(cluster_id, limit);
        self
    }

    /// Kill a running context. Returns false if it had already stopped.
    pub async fn terminate(&self, handle: &TaskHandle) -> Result<bool, ExecutorError> {
        self.table.terminate(handle).await
    }
}

#[async_trait]
impl TaskExecutor for ProcessTaskExecutor {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskHandle, LaunchError> {
        let definition = self
            .definitions
            .get(&spec.task_definition_id)
            .ok_or_else(|| LaunchError::UnknownTaskDefinition(spec.task_definition_id.clone()))?;

        let exit = self.table.reserve(&spec).await?;
        let handle = spec.handle.clone();

        let spawned = Command::new(&definition.program)
            .args(&definition.args)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.table.release(&handle).await;
                return Err(LaunchError::Spawn(e));
            }
        };
        debug!("Task {} started as pid {:?}", handle, child.id());

        let (kill_tx, kill_rx) = oneshot::channel();
        self.table.attach_stop(&handle, StopSignal::Kill(kill_tx)).await;

        let monitored = handle.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };

            let info = match status {
                Some(Ok(status)) => match status.code() {
                    Some(code) => ExitInfo::exited(code),
                    None => ExitInfo::terminated(format!("Task killed ({})", status)),
                },
                Some(Err(e)) => ExitInfo::terminated(format!("Task lost: {}", e)),
                None => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill task {}: {}", monitored, e);
                    }
                    ExitInfo::terminated("Task stopped by user")
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
