//! JSON file storage implementation.
//!
//! Stores one pretty-printed JSON document per operation under a root
//! directory. Every write goes to a temporary file first and is renamed into
//! place, so readers in other processes see either the old or the new record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use asyncop_core::{OperationId, OperationRecord, OperationStatus, RecordFilter};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{RecordStore, Result, StorageError};

/// File-based JSON record store.
#[derive(Clone)]
pub struct JsonRecordStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonRecordStore {
    /// Create storage, creating the root directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: OperationId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn write_record(&self, record: &OperationRecord) -> Result<()> {
        let path = self.record_path(record.id);
        let tmp = self.root.join(format!("{}.json.tmp", record.id));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonRecordStore {
    async fn create(&self, record: &OperationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.record_path(record.id)).await? {
            return Err(StorageError::AlreadyExists(record.id));
        }
        self.write_record(record).await?;
        debug!("Created operation {} at {}", record.id, self.root.display());
        Ok(())
    }

    async fn get(&self, id: OperationId) -> Result<OperationRecord> {
        read_json(&self.record_path(id))
            .await?
            .ok_or(StorageError::NotFound(id))
    }

    async fn update_terminal(
        &self,
        id: OperationId,
        status: OperationStatus,
        output: serde_json::Value,
    ) -> Result<OperationRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record: OperationRecord = read_json(&self.record_path(id))
            .await?
            .ok_or(StorageError::NotFound(id))?;
        record.finish(status, output)?;
        self.write_record(&record).await?;
        Ok(record)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>> {
        let all = list_dir(&self.root).await?;
        Ok(filter.apply(all))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }
    Ok(items)
}
