//! Persistent job records.
//!
//! Every submitted job gets one record, written as `waiting` right after
//! submission and updated once to its terminal status:
//! - **JobRecordStore**: the store abstraction
//! - **SqliteJobStore**: SQLite implementation, one database file per run
//! - **OptionalStore**: wrapper that turns every call into a no-op when
//!   persistence is disabled
//!
//! # Usage
//!
//! ```rust,ignore
//! use gridjobs::storage::{OptionalStore, SqliteJobStore};
//! use std::sync::Arc;
//!
//! let store = SqliteJobStore::create("/scratch/proj_ab12cd34.db").await?;
//! let store = OptionalStore::some(Arc::new(store));
//!
//! let records = store.list_group("align").await?;
//! ```

pub mod records;
pub mod schema;
pub mod sqlite;

// Re-export main types for convenience
pub use records::{JobRecord, JobRecordStore, OptionalStore, StoreError};
pub use sqlite::SqliteJobStore;
