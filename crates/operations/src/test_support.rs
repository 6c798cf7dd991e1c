//! Shared fixtures for the operation tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use asyncop_core::OperationId;
use asyncop_executor::{Entrypoint, LocalTaskExecutor};
use asyncop_functions::FunctionRegistry;
use asyncop_storage::{MemoryPayloadStore, MemoryRecordStore};

use crate::{CompletionWaiter, OperationLauncher, OperationRunner, Payload, StartRequest, WaiterConfig};

pub(crate) const CLUSTER: &str = "local";
pub(crate) const TASK_DEFINITION: &str = "runner";

/// Context that never finishes on its own.
pub(crate) struct Hang;

#[async_trait]
impl Entrypoint for Hang {
    async fn run(&self, _environment: HashMap<String, String>) -> i32 {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        0
    }
}

pub(crate) struct Harness<E: Entrypoint> {
    pub records: MemoryRecordStore,
    pub location: String,
    pub payloads: MemoryPayloadStore,
    pub executor: Arc<LocalTaskExecutor<E>>,
}

impl Harness<OperationRunner> {
    /// Contexts run the real runner against the built-in functions.
    pub fn new() -> Self {
        let payloads = MemoryPayloadStore::new();
        let runner = OperationRunner::new(
            Arc::new(payloads.clone()),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        Self::with_parts(payloads, runner)
    }
}

impl Harness<Hang> {
    /// Contexts hang until terminated.
    pub fn hanging() -> Self {
        Self::with_parts(MemoryPayloadStore::new(), Hang)
    }
}

impl<E: Entrypoint> Harness<E> {
    fn with_parts(payloads: MemoryPayloadStore, entrypoint: E) -> Self {
        let name = OperationId::new().to_string();
        Self {
            records: MemoryRecordStore::named(&name),
            location: format!("memory:{}", name),
            payloads,
            executor: Arc::new(LocalTaskExecutor::new(entrypoint).with_task_definition(TASK_DEFINITION)),
        }
    }

    pub fn launcher(&self) -> OperationLauncher {
        OperationLauncher::new(
            Arc::new(self.records.clone()),
            Arc::new(self.payloads.clone()),
            self.executor.clone(),
            self.location.clone(),
        )
    }

    pub fn waiter(&self, config: WaiterConfig) -> CompletionWaiter {
        CompletionWaiter::new(Arc::new(self.records.clone()), self.executor.clone()).with_config(config)
    }

    pub fn request(&self, function: &str, payload: Payload) -> StartRequest {
        StartRequest {
            target_function_id: function.to_string(),
            execution_cluster_id: CLUSTER.to_string(),
            task_definition_id: TASK_DEFINITION.to_string(),
            description: format!("test {}", function),
            operation_type: "test".to_string(),
            payload,
        }
    }
}
