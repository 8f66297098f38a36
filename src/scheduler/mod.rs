//! Batch job submission and tracking on a cluster scheduler.
//!
//! This module submits jobs to a batch scheduler and blocks until they finish:
//!
//! - **SchedulerAdapter**: the only place that knows scheduler commands and
//!   output formats (`SgeAdapter` for Sun Grid Engine)
//! - **Job**: one unit of work, with a sentinel-based success check
//! - **JobGroup**: jobs sharing a queue, polled together with a backoff schedule
//! - **JobManager**: registry of groups, owning the record store and cancellation
//!
//! # Architecture
//!
//! ```text
//!   JobManager ──owns──▶ JobGroup ──owns──▶ Job
//!       │                   │
//!       │                   ├── submit ─────────────┐
//!       │                   └── wait (poll loop) ───┤
//!       │                                           ▼
//!       └── OptionalStore (SQLite)          SchedulerAdapter
//!                                          (qconf/qsub/qstat)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridjobs::config::ManagerConfig;
//! use gridjobs::scheduler::{Job, JobManager};
//!
//! let config = ManagerConfig::from_env()?;
//! let mut manager = JobManager::new(config).await?;
//!
//! manager.create_group("align", "normal.q", vec!["h_vmem=4g".into()]).await?;
//! manager.insert_job("align", Job::command_job("sample1", "bwa mem ref.fa s1.fq > s1.sam"))?;
//! manager.insert_job("align", Job::command_job("sample2", "bwa mem ref.fa s2.fq > s2.sam"))?;
//!
//! manager.submit("align", None).await?;
//! manager.wait("align", true).await?;
//! manager.shutdown().await?;
//! ```
//!
//! # Completion detection
//!
//! A job is finished once the scheduler stops listing it as active. It
//! succeeded only if the last line of its captured output is the sentinel
//! `END OF job <name> from group <groupId>`, which the generated wrapper
//! prints after the command exits cleanly.

pub mod adapter;
pub mod backoff;
pub mod group;
pub mod job;
pub mod manager;
pub mod sge;

// Re-export main types for convenience
pub use adapter::{SchedulerAdapter, SchedulerKind, SubmitPayload, SubmitRequest};
pub use backoff::BackoffSchedule;
pub use group::{JobGroup, PollContext, WaitReport};
pub use job::{sentinel_line, Job, JobStatus};
pub use manager::{CancelHandle, JobManager};
pub use sge::{SgeAdapter, SgeCommands};
