//! Boundary between job bookkeeping and a concrete batch scheduler.
//!
//! Everything above this trait reasons about jobs purely through integer
//! scheduler ids and statuses. Rendering command lines and parsing the
//! scheduler's free-text replies happens only in the implementations.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

use super::sge::SgeAdapter;

/// Supported scheduler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Sun Grid Engine and its descendants (`qsub`/`qstat`/`qconf`).
    #[serde(rename = "SGE")]
    Sge,
}

impl SchedulerKind {
    /// Builds the adapter for this scheduler kind.
    pub fn adapter(self) -> Arc<dyn SchedulerAdapter> {
        match self {
            SchedulerKind::Sge => Arc::new(SgeAdapter::new()),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Sge => write!(f, "SGE"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SGE" => Ok(SchedulerKind::Sge),
            _ => Err(JobError::UnknownScheduler(s.to_string())),
        }
    }
}

/// What the scheduler should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitPayload {
    /// Script text passed to the scheduler on stdin.
    Inline(String),
    /// Path of a script file the scheduler reads itself.
    ScriptFile(PathBuf),
}

/// Structured submission request handed to a `SchedulerAdapter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub payload: SubmitPayload,
    pub queue: String,
    pub name: String,
    pub working_dir: PathBuf,
    pub resource_hints: Vec<String>,
}

/// Capability interface implemented once per scheduler kind.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Returns the kind of scheduler behind this adapter.
    fn kind(&self) -> SchedulerKind;

    /// Fails with `JobError::UnknownQueue` if the scheduler does not list `queue`.
    async fn validate_queue(&self, queue: &str) -> Result<(), JobError>;

    /// Submits one job and returns the scheduler-assigned id.
    ///
    /// Fails with `JobError::SubmissionFailed` if the scheduler rejects the
    /// request or its acknowledgement carries no integer id.
    async fn submit(&self, request: &SubmitRequest) -> Result<u64, JobError>;

    /// Returns the ids currently active (queued, running, held...) for `user`
    /// on `queue`.
    ///
    /// The answer may race with submissions made concurrently by other
    /// groups; it only reflects jobs known to the scheduler when it replied.
    async fn list_active_job_ids(&self, user: &str, queue: &str)
        -> Result<HashSet<u64>, JobError>;
}
