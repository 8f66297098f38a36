//! Job records and the store abstraction that persists them.
//!
//! One record exists per submitted job. It is inserted with status
//! `waiting` right after the scheduler acknowledges the submission and is
//! updated exactly once afterwards, to `success` or `error`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::JobStatus;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The requested status change is not a `waiting -> terminal` transition.
    #[error("Invalid status transition for job {job_id} to '{to}'")]
    InvalidTransition { job_id: u64, to: JobStatus },

    /// A stored status value could not be parsed.
    #[error("Invalid status '{0}' in store")]
    InvalidStatus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted view of a single submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub scheduler_job_id: u64,
    pub job_name: String,
    pub working_dir: PathBuf,
    pub group_id: String,
    pub queue: String,
    pub resource_hints: Vec<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Durable mapping from scheduler job id to job status.
///
/// Implementations must serialize their own writes; several groups may call
/// into the same store concurrently, but never for the same record.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Inserts a freshly submitted job. The stored status is always `waiting`.
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Moves a `waiting` record to a terminal status.
    async fn update_status(&self, job_id: u64, status: JobStatus) -> Result<(), StoreError>;

    /// Returns the record for a scheduler job id, if any.
    async fn get(&self, job_id: u64) -> Result<Option<JobRecord>, StoreError>;

    /// Returns all records of a group ordered by scheduler job id.
    async fn list_group(&self, group_id: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Releases the underlying connection.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Wraps an optional store so groups work with or without persistence.
#[derive(Clone)]
pub struct OptionalStore(pub Option<Arc<dyn JobRecordStore>>);

impl std::fmt::Debug for OptionalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(_) => write!(f, "OptionalStore(active)"),
            None => write!(f, "OptionalStore(none)"),
        }
    }
}

impl OptionalStore {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(store: Arc<dyn JobRecordStore>) -> Self {
        Self(Some(store))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        match &self.0 {
            Some(s) => s.insert(record).await,
            None => Ok(()),
        }
    }

    pub async fn update_status(&self, job_id: u64, status: JobStatus) -> Result<(), StoreError> {
        match &self.0 {
            Some(s) => s.update_status(job_id, status).await,
            None => Ok(()),
        }
    }

    pub async fn list_group(&self, group_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        match &self.0 {
            Some(s) => s.list_group(group_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        match &self.0 {
            Some(s) => s.close().await,
            None => Ok(()),
        }
    }
}
