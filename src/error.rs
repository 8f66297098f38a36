//! Error types for gridjobs operations.
//!
//! `JobError` is the single taxonomy surfaced by the scheduler layer:
//! - Job construction and group bookkeeping mistakes
//! - Scheduler configuration problems (unknown scheduler, queue, group)
//! - Submission and active-list query failures
//! - Terminal-status resolution failures
//! - Configuration and record store failures

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StoreError;

/// Errors that can occur while submitting, tracking or resolving jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job '{name}': {reason}")]
    InvalidJobSpec { name: String, reason: String },

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Unknown scheduler '{0}'")]
    UnknownScheduler(String),

    #[error("Job group '{0}' already exists")]
    DuplicateGroup(String),

    #[error("Job group '{0}' not found")]
    UnknownGroup(String),

    #[error("Job '{name}' already exists in group '{group_id}'")]
    DuplicateJob { group_id: String, name: String },

    #[error("Group '{group_id}' has no job at index {index}")]
    UnknownJobIndex { group_id: String, index: usize },

    #[error("Group '{0}' already started submitting, no more jobs can be inserted")]
    GroupSealed(String),

    #[error("Submission of job '{name}' failed: {reason}")]
    SubmissionFailed { name: String, reason: String },

    #[error("Scheduler query failed: {0}")]
    SchedulerQuery(String),

    #[error("Output of job unavailable at '{}': {source}", path.display())]
    OutputUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failure of job {name} (group={group_id}, id={job_id})\nlook into {}",
        output.display()
    )]
    JobFailed {
        name: String,
        group_id: String,
        job_id: u64,
        output: PathBuf,
        #[source]
        cause: Option<Box<JobError>>,
    },

    #[error("Polling of group '{0}' was cancelled")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Returns whether this error reports a job that ended in error status.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, JobError::JobFailed { .. })
    }
}
