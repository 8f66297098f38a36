//! gridjobs: submit groups of shell jobs to a cluster batch scheduler and
//! wait for them to finish.
//!
//! Jobs are grouped per queue, submitted through a scheduler adapter, then
//! polled with a front-loaded backoff until the scheduler stops listing them.
//! A finished job succeeded only if its captured output ends with a
//! completion marker written by the generated wrapper script.

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ManagerConfig};
pub use error::JobError;
pub use scheduler::{Job, JobGroup, JobManager, JobStatus};
pub use storage::StoreError;
