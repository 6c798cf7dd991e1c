//! SQLite storage backend.
//!
//! Records live in a single `async_operations` table with one column per
//! attribute. The terminal write is a conditional `UPDATE` guarded on
//! `status = 'RUNNING'`, which gives per-key atomicity across processes
//! sharing the database file.

use async_trait::async_trait;
use asyncop_core::{OperationId, OperationRecord, OperationStatus, RecordFilter, TaskHandle, Time};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::trait_::{RecordStore, Result, StorageError};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteRecordStore {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteRecordStore {
    /// Open (creating if needed) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS async_operations (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                output TEXT,
                task_handle TEXT NOT NULL,
                description TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_async_operations_status ON async_operations(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<OperationRecord> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let output: Option<String> = row.try_get("output")?;
        let task_handle: String = row.try_get("task_handle")?;

        Ok(OperationRecord {
            id: id
                .parse::<OperationId>()
                .map_err(|e| StorageError::Corrupt(format!("id {}: {}", id, e)))?,
            status: status
                .parse::<OperationStatus>()
                .map_err(|e| StorageError::Corrupt(e.to_string()))?,
            output: output.map(|s| serde_json::from_str(&s)).transpose()?,
            task_handle: TaskHandle(task_handle),
            description: row.try_get("description")?,
            operation_type: row.try_get("operation_type")?,
            created_at: millis_to_time(row.try_get("created_at")?),
            updated_at: millis_to_time(row.try_get("updated_at")?),
        })
    }
}

fn millis_to_time(millis: i64) -> Time {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, record: &OperationRecord) -> Result<()> {
        let output = record.output.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "INSERT INTO async_operations
                (id, status, output, task_handle, description, operation_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(output)
        .bind(record.task_handle.as_str())
        .bind(&record.description)
        .bind(&record.operation_type)
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Created operation {} in sqlite", record.id);
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::AlreadyExists(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: OperationId) -> Result<OperationRecord> {
        let row = sqlx::query("SELECT * FROM async_operations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::record_from_row(&row),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn update_terminal(
        &self,
        id: OperationId,
        status: OperationStatus,
        output: serde_json::Value,
    ) -> Result<OperationRecord> {
        let mut record = self.get(id).await?;
        record.finish(status, output)?;
        let encoded = record.output.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "UPDATE async_operations SET status = ?, output = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(record.status.as_str())
        .bind(encoded)
        .bind(record.updated_at.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Another writer finished the record between the read and the update.
            let current = self.get(id).await?;
            return Err(StorageError::AlreadyTerminal {
                id,
                status: current.status,
            });
        }

        Ok(record)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query("SELECT * FROM async_operations WHERE status = ? ORDER BY created_at DESC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM async_operations ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let records = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(filter.apply(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asyncop_core::failure_output;
    use serde_json::json;

    fn create_test_record() -> OperationRecord {
        OperationRecord::new(OperationId::new(), TaskHandle::new(), "Some description", "ES Index")
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = SqliteRecordStore::in_memory().await.unwrap();
        let record = create_test_record();

        storage.create(&record).await.unwrap();
        let loaded = storage.get(record.id).await.unwrap();
        assert_eq!(loaded, record);

        let err = storage.create(&record).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_terminal_update() {
        let storage = SqliteRecordStore::in_memory().await.unwrap();
        let record = create_test_record();
        storage.create(&record).await.unwrap();

        let finished = storage
            .update_terminal(record.id, OperationStatus::RunnerFailed, failure_output("Function not found: nope"))
            .await
            .unwrap();
        assert_eq!(storage.get(record.id).await.unwrap(), finished);
        assert!(finished.updated_at > record.created_at);

        let err = storage
            .update_terminal(record.id, OperationStatus::Succeeded, json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyTerminal { status: OperationStatus::RunnerFailed, .. }));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let storage = SqliteRecordStore::in_memory().await.unwrap();
        for i in 0..4 {
            let record = create_test_record();
            storage.create(&record).await.unwrap();
            if i % 2 == 0 {
                storage
                    .update_terminal(record.id, OperationStatus::Succeeded, json!(i))
                    .await
                    .unwrap();
            }
        }

        let filter = RecordFilter {
            status: Some(OperationStatus::Succeeded),
            ..Default::default()
        };
        assert_eq!(storage.list(&filter).await.unwrap().len(), 2);
        assert_eq!(storage.list(&RecordFilter::default()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.db");
        let record = create_test_record();

        SqliteRecordStore::new_from_path(&path).await.unwrap().create(&record).await.unwrap();

        let reopened = SqliteRecordStore::new_from_path(&path).await.unwrap();
        assert_eq!(reopened.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_unknown_status_row_is_corrupt() {
        let storage = SqliteRecordStore::in_memory().await.unwrap();
        let record = create_test_record();
        storage.create(&record).await.unwrap();

        sqlx::query("UPDATE async_operations SET status = 'DONE' WHERE id = ?")
            .bind(record.id.to_string())
            .execute(&storage.pool)
            .await
            .unwrap();

        let err = storage.get(record.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(ref msg) if msg.contains("DONE")));
    }
}
