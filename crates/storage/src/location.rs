//! Record store location strings.
//!
//! A location is how the launcher tells a separately started runner where the
//! records live:
//!
//! - `json:<dir>` - [`JsonRecordStore`] rooted at `<dir>`
//! - `sqlite:<path>` - SQLite database file (requires the `sqlite` feature)
//! - `memory:<name>` - process-local [`MemoryRecordStore`] registered as `<name>`
//! - anything else is treated as a JSON store directory

use std::sync::Arc;

use crate::{JsonRecordStore, MemoryRecordStore, RecordStore, Result, StorageError};

/// Parsed record store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// JSON files under a directory
    Json(std::path::PathBuf),
    /// SQLite database file
    Sqlite(std::path::PathBuf),
    /// Named process-local store
    Memory(String),
}

impl StoreLocation {
    /// Parse a location string.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(StorageError::InvalidLocation("empty location".to_string()));
        }

        if let Some(dir) = location.strip_prefix("json:") {
            Ok(StoreLocation::Json(dir.into()))
        } else if let Some(path) = location.strip_prefix("sqlite:") {
            Ok(StoreLocation::Sqlite(path.into()))
        } else if let Some(name) = location.strip_prefix("memory:") {
            Ok(StoreLocation::Memory(name.to_string()))
        } else {
            Ok(StoreLocation::Json(location.into()))
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::Json(dir) => write!(f, "json:{}", dir.display()),
            StoreLocation::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
            StoreLocation::Memory(name) => write!(f, "memory:{}", name),
        }
    }
}

/// Open the record store a location string points at.
pub async fn open_record_store(location: &str) -> Result<Arc<dyn RecordStore>> {
    match StoreLocation::parse(location)? {
        StoreLocation::Json(dir) => Ok(Arc::new(JsonRecordStore::new(dir).await?)),
        StoreLocation::Memory(name) => Ok(Arc::new(MemoryRecordStore::named(&name))),
        #[cfg(feature = "sqlite")]
        StoreLocation::Sqlite(path) => {
            Ok(Arc::new(crate::SqliteRecordStore::new_from_path(&path).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreLocation::Sqlite(path) => Err(StorageError::InvalidLocation(format!(
            "sqlite:{} requires the sqlite feature",
            path.display()
        ))),
    }
}
