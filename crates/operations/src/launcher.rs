//! Operation launcher.
//!
//! Accepts a submission, records it as RUNNING and starts an execution
//! context that will run it. Returns as soon as the context is launched.

use std::sync::Arc;

use asyncop_core::{ContextError, ExecutionContext, OperationId, OperationRecord, TaskHandle};
use asyncop_executor::{LaunchError, LaunchSpec, TaskExecutor};
use asyncop_storage::{PayloadError, PayloadStore, RecordStore, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Input payload of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    /// Payload value, stored by the launcher before launch
    Inline(serde_json::Value),
    /// URI of a payload that is already stored
    Reference(String),
}

/// Submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Function the execution context invokes
    pub target_function_id: String,
    /// Cluster to launch on
    pub execution_cluster_id: String,
    /// Task definition to launch
    pub task_definition_id: String,
    /// Free text stored on the record
    #[serde(default)]
    pub description: String,
    /// Category stored on the record
    #[serde(default)]
    pub operation_type: String,
    /// Function input
    pub payload: Payload,
}

/// Submission response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Operation ID to poll
    pub id: OperationId,
    /// Execution context running the operation
    pub task_handle: TaskHandle,
}

/// Errors submitting an operation.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    /// The inline payload could not be encoded
    #[error("Failed to encode payload: {0}")]
    EncodePayload(#[from] serde_json::Error),

    /// The inline payload could not be stored
    #[error("Failed to store payload: {0}")]
    PayloadStore(#[from] PayloadError),

    /// The execution context configuration could not be encoded
    #[error("Failed to encode execution context: {0}")]
    Context(#[from] ContextError),

    /// The RUNNING record could not be created
    #[error("Failed to create operation record: {0}")]
    CreateRecord(#[from] StorageError),

    /// The record exists but no execution context was started
    #[error("Failed to launch operation {id}: {source}")]
    Launch {
        /// Operation left in RUNNING
        id: OperationId,
        /// Executor error
        #[source]
        source: LaunchError,
    },
}

/// Starts operations.
pub struct OperationLauncher {
    records: Arc<dyn RecordStore>,
    payloads: Arc<dyn PayloadStore>,
    executor: Arc<dyn TaskExecutor>,
    record_store_location: String,
}

impl OperationLauncher {
    /// Create a launcher.
    ///
    /// `record_store_location` must resolve to the same store as `records`
    /// from inside the execution context.
    pub fn new(
        records: Arc<dyn RecordStore>,
        payloads: Arc<dyn PayloadStore>,
        executor: Arc<dyn TaskExecutor>,
        record_store_location: impl Into<String>,
    ) -> Self {
        Self {
            records,
            payloads,
            executor,
            record_store_location: record_store_location.into(),
        }
    }

    /// Submit an operation.
    pub async fn start(&self, request: StartRequest) -> Result<StartResponse, SubmissionError> {
        let id = OperationId::new();
        let task_handle = TaskHandle::new();

        let payload_uri = match request.payload {
            Payload::Inline(value) => {
                let body = serde_json::to_vec(&value)?;
                self.payloads.put(&format!("payloads/{}.json", id), body).await?
            }
            Payload::Reference(uri) => uri,
        };
        debug!("Operation {} payload at {}", id, payload_uri);

        let context = ExecutionContext::new(
            id,
            self.record_store_location.clone(),
            request.target_function_id.clone(),
            payload_uri,
        );
        let environment = context.to_env()?;

        let record = OperationRecord::new(
            id,
            task_handle.clone(),
            request.description,
            request.operation_type,
        );
        self.records.create(&record).await?;
        info!("Created operation {} for function {}", id, request.target_function_id);

        let spec = LaunchSpec {
            handle: task_handle,
            cluster_id: request.execution_cluster_id,
            task_definition_id: request.task_definition_id,
            environment,
        };
        let task_handle = match self.executor.launch(spec).await {
            Ok(handle) => handle,
            Err(source) => {
                error!("Failed to launch operation {}: {}", id, source);
                return Err(SubmissionError::Launch { id, source });
            }
        };

        Ok(StartResponse { id, task_handle })
    }
}
