//! Record and payload storage for async operations.
//!
//! This crate provides the trait-based operation record store with JSON,
//! in-memory and (feature `sqlite`) SQLite backends, plus the payload
//! reference store/fetchers the launcher and runner share.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;
pub mod location;
pub mod payload;

pub use trait_::{RecordStore, StorageError, Result};
pub use memory::MemoryRecordStore;
pub use json_storage::JsonRecordStore;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteRecordStore;
pub use location::{open_record_store, StoreLocation};
pub use payload::{
    FsPayloadStore, HttpPayloadFetcher, MemoryPayloadStore, PayloadError, PayloadFetcher,
    PayloadRouter, PayloadStore,
};
