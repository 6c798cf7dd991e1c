//! In-memory record store.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use asyncop_core::{OperationId, OperationRecord, OperationStatus, RecordFilter};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RecordStore, Result, StorageError};

/// Process-local record store.
///
/// Clones share the same records. Named stores are registered process-wide so
/// a `memory:<name>` location resolves to the same instance everywhere in the
/// process.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<Mutex<HashMap<OperationId, OperationRecord>>>,
}

fn registry() -> &'static std::sync::Mutex<HashMap<String, MemoryRecordStore>> {
    static STORES: OnceLock<std::sync::Mutex<HashMap<String, MemoryRecordStore>>> = OnceLock::new();
    STORES.get_or_init(Default::default)
}

impl MemoryRecordStore {
    /// Create an unregistered store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the store registered under `name`.
    pub fn named(name: &str) -> Self {
        let mut stores = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stores.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &OperationRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        debug!("Created operation {} in memory", record.id);
        Ok(())
    }

    async fn get(&self, id: OperationId) -> Result<OperationRecord> {
        let records = self.records.lock().await;
        records.get(&id).cloned().ok_or(StorageError::NotFound(id))
    }

    async fn update_terminal(
        &self,
        id: OperationId,
        status: OperationStatus,
        output: serde_json::Value,
    ) -> Result<OperationRecord> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        record.finish(status, output)?;
        Ok(record.clone())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>> {
        let records = self.records.lock().await;
        Ok(filter.apply(records.values().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asyncop_core::{failure_output, TaskHandle};
    use serde_json::json;

    fn create_test_record() -> OperationRecord {
        OperationRecord::new(OperationId::new(), TaskHandle::new(), "Some description", "ES Index")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryRecordStore::new();
        let record = create_test_record();

        store.create(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryRecordStore::new();
        let record = create_test_record();

        store.create(&record).await.unwrap();
        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(id) if id == record.id));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryRecordStore::new();
        let id = OperationId::new();
        assert!(matches!(store.get(id).await, Err(StorageError::NotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn test_terminal_write_happens_once() {
        let store = MemoryRecordStore::new();
        let record = create_test_record();
        store.create(&record).await.unwrap();

        let finished = store
            .update_terminal(record.id, OperationStatus::Succeeded, json!([1, 2, 3]))
            .await
            .unwrap();
        assert!(finished.updated_at > record.updated_at);

        let err = store
            .update_terminal(record.id, OperationStatus::TaskFailed, failure_output("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyTerminal { status: OperationStatus::Succeeded, .. }));

        assert_eq!(store.get(record.id).await.unwrap(), finished);
        assert_eq!(store.get(record.id).await.unwrap(), finished);
    }

    #[tokio::test]
    async fn test_running_is_not_a_terminal_write() {
        let store = MemoryRecordStore::new();
        let record = create_test_record();
        store.create(&record).await.unwrap();

        let err = store
            .update_terminal(record.id, OperationStatus::Running, json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_named_stores_are_shared() {
        let name = format!("shared-{}", OperationId::new());
        let first = MemoryRecordStore::named(&name);
        let record = create_test_record();
        first.create(&record).await.unwrap();

        let second = MemoryRecordStore::named(&name);
        assert_eq!(second.get(record.id).await.unwrap(), record);
        assert!(MemoryRecordStore::new().get(record.id).await.is_err());
    }
}
