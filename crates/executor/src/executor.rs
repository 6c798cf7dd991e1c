//! Task executor abstraction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use asyncop_core::{now_millis, TaskHandle, Time};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::AbortHandle;

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Handle the context will be known by
    pub handle: TaskHandle,
    /// Cluster to run on
    pub cluster_id: String,
    /// Task definition to run
    pub task_definition_id: String,
    /// Environment injected into the context
    pub environment: HashMap<String, String>,
}

/// How an execution context stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Process exit code, if the context exited on its own
    pub exit_code: Option<i32>,
    /// Human readable stop reason
    pub reason: String,
    /// When the stop was observed
    pub stopped_at: Time,
}

impl ExitInfo {
    /// The context exited with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            reason: format!("exited with code {}", code),
            stopped_at: now_millis(),
        }
    }

    /// The context was stopped from outside or died without an exit code.
    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            reason: reason.into(),
            stopped_at: now_millis(),
        }
    }

    /// Whether the context exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Errors launching an execution context.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// No task definition registered under the identifier
    #[error("unknown task definition: {0}")]
    UnknownTaskDefinition(String),

    /// The cluster has no free capacity
    #[error("cluster {cluster} is at capacity ({limit} running tasks)")]
    CapacityExhausted {
        /// Cluster ID
        cluster: String,
        /// Configured limit
        limit: usize,
    },

    /// The handle is already in use
    #[error("task handle {0} is already in use")]
    DuplicateHandle(TaskHandle),

    /// The context could not be started
    #[error("failed to start execution context: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors observing an execution context.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The handle was never launched by this executor
    #[error("unknown task: {0}")]
    UnknownTask(TaskHandle),

    /// The context has not stopped yet
    #[error("task {0} is still running")]
    StillRunning(TaskHandle),
}

/// Abstraction over a container/task-launching facility.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Launch an isolated execution context.
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskHandle, LaunchError>;

    /// Non-blocking stop check.
    async fn poll_stop(&self, handle: &TaskHandle) -> Result<Option<ExitInfo>, ExecutorError>;

    /// Resolve once the context has stopped.
    async fn wait_for_stop(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError>;

    /// Drop a stopped context's bookkeeping, returning how it stopped.
    ///
    /// The handle is unknown to the executor afterwards.
    async fn forget(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError>;
}

/// How to stop a running context from outside.
pub(crate) enum StopSignal {
    Abort(AbortHandle),
    Kill(oneshot::Sender<()>),
}

struct TaskSlot {
    cluster_id: String,
    exit: Arc<watch::Sender<Option<ExitInfo>>>,
    stop: Option<StopSignal>,
}

impl TaskSlot {
    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

/// Bookkeeping shared by the executors: launched handles, their exit state
/// and per-cluster capacity.
#[derive(Clone, Default)]
pub(crate) struct TaskTable {
    slots: Arc<Mutex<HashMap<TaskHandle, TaskSlot>>>,
    capacity: HashMap<String, usize>,
}

impl TaskTable {
    pub(crate) fn set_capacity(&mut self, cluster_id: impl Into<String>, limit: usize) {
        self.capacity.insert(cluster_id.into(), limit);
    }

    /// Reserve a slot for `spec`, returning the sender that reports its exit.
    pub(crate) async fn reserve(
        &self,
        spec: &LaunchSpec,
    ) -> Result<Arc<watch::Sender<Option<ExitInfo>>>, LaunchError> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&spec.handle) {
            return Err(LaunchError::DuplicateHandle(spec.handle.clone()));
        }

        if let Some(&limit) = self.capacity.get(&spec.cluster_id) {
            let running = slots
                .values()
                .filter(|slot| slot.cluster_id == spec.cluster_id && slot.is_running())
                .count();
            if running >= limit {
                return Err(LaunchError::CapacityExhausted {
                    cluster: spec.cluster_id.clone(),
                    limit,
                });
            }
        }

        let (tx, _rx) = watch::channel(None);
        let exit = Arc::new(tx);
        slots.insert(
            spec.handle.clone(),
            TaskSlot {
                cluster_id: spec.cluster_id.clone(),
                exit: exit.clone(),
                stop: None,
            },
        );
        Ok(exit)
    }

    pub(crate) async fn attach_stop(&self, handle: &TaskHandle, stop: StopSignal) {
        if let Some(slot) = self.slots.lock().await.get_mut(handle) {
            slot.stop = Some(stop);
        }
    }

    pub(crate) async fn release(&self, handle: &TaskHandle) {
        self.slots.lock().await.remove(handle);
    }

    pub(crate) async fn poll(&self, handle: &TaskHandle) -> Result<Option<ExitInfo>, ExecutorError> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(handle)
            .ok_or_else(|| ExecutorError::UnknownTask(handle.clone()))?;
        let exit = slot.exit.borrow().clone();
        Ok(exit)
    }

    pub(crate) async fn wait(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError> {
        let mut rx = {
            let slots = self.slots.lock().await;
            slots
                .get(handle)
                .ok_or_else(|| ExecutorError::UnknownTask(handle.clone()))?
                .exit
                .subscribe()
        };

        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        Ok(exit.unwrap_or_else(|| ExitInfo::terminated("execution context lost")))
    }

    pub(crate) async fn forget(&self, handle: &TaskHandle) -> Result<ExitInfo, ExecutorError> {
        let mut slots = self.slots.lock().await;
        let exit = slots
            .get(handle)
            .ok_or_else(|| ExecutorError::UnknownTask(handle.clone()))?
            .exit
            .borrow()
            .clone();
        match exit {
            Some(exit) => {
                slots.remove(handle);
                Ok(exit)
            }
            None => Err(ExecutorError::StillRunning(handle.clone())),
        }
    }

    /// Stop a running context. Returns false if it already stopped.
    pub(crate) async fn terminate(&self, handle: &TaskHandle) -> Result<bool, ExecutorError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(handle)
            .ok_or_else(|| ExecutorError::UnknownTask(handle.clone()))?;
        if !slot.is_running() {
            return Ok(false);
        }
        match slot.stop.take() {
            Some(StopSignal::Abort(abort)) => abort.abort(),
            Some(StopSignal::Kill(kill)) => {
                let _ = kill.send(());
            }
            None => return Ok(false),
        }
        Ok(true)
    }
}

/// Record `exit` unless the context already reported a stop.
pub(crate) fn report_exit(sender: &watch::Sender<Option<ExitInfo>>, exit: ExitInfo) {
    sender.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(exit);
            true
        } else {
            false
        }
    });
}
