//! Sun Grid Engine adapter.
//!
//! Wraps the three SGE command-line tools used by the job lifecycle:
//!
//! - `qconf -sql` lists the configured queues, one per line
//! - `qsub` submits a job and acknowledges with
//!   `Your job <id> ("<name>") has been submitted`
//! - `qstat -u <user> -q <queue>` prints a two-line header followed by one
//!   row per active job, the job id in the first column
//!
//! Jobs are submitted with `-cwd -j y -V`, so stdout and stderr are merged
//! into `<working_dir>/<name>.o<id>`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::JobError;

use super::adapter::{SchedulerAdapter, SchedulerKind, SubmitPayload, SubmitRequest};

/// Number of header rows `qstat` prints before the job table.
const QSTAT_HEADER_LINES: usize = 2;

/// Position of the job id in the `qsub` acknowledgement.
const SUBMIT_ACK_ID_TOKEN: usize = 2;

/// Locations of the SGE binaries.
#[derive(Debug, Clone)]
pub struct SgeCommands {
    pub qsub: PathBuf,
    pub qstat: PathBuf,
    pub qconf: PathBuf,
}

impl Default for SgeCommands {
    fn default() -> Self {
        Self {
            qsub: PathBuf::from("qsub"),
            qstat: PathBuf::from("qstat"),
            qconf: PathBuf::from("qconf"),
        }
    }
}

/// `SchedulerAdapter` for Sun Grid Engine.
#[derive(Debug, Clone, Default)]
pub struct SgeAdapter {
    commands: SgeCommands,
}

impl SgeAdapter {
    /// Creates an adapter that finds the SGE tools on `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an adapter using explicit tool locations.
    pub fn with_commands(commands: SgeCommands) -> Self {
        Self { commands }
    }

    /// Runs a read-only query and returns its stdout.
    async fn run_query(&self, program: &Path, args: &[&str]) -> Result<String, JobError> {
        debug!(program = %program.display(), args = ?args, "Running scheduler query");

        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                JobError::SchedulerQuery(format!("failed to run {}: {}", program.display(), e))
            })?;

        if !out.status.success() {
            return Err(JobError::SchedulerQuery(format!(
                "{} exited with {}: {}",
                program.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl SchedulerAdapter for SgeAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Sge
    }

    async fn validate_queue(&self, queue: &str) -> Result<(), JobError> {
        let listing = self.run_query(&self.commands.qconf, &["-sql"]).await?;
        if parse_queue_list(&listing).contains(queue) {
            Ok(())
        } else {
            Err(JobError::UnknownQueue(queue.to_string()))
        }
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<u64, JobError> {
        let failed = |reason: String| JobError::SubmissionFailed {
            name: request.name.clone(),
            reason,
        };

        let mut cmd = Command::new(&self.commands.qsub);
        cmd.args(["-cwd", "-j", "y", "-V"])
            .arg("-q")
            .arg(&request.queue)
            .arg("-N")
            .arg(&request.name);
        for hint in &request.resource_hints {
            cmd.arg("-l").arg(hint);
        }
        cmd.current_dir(&request.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match &request.payload {
            SubmitPayload::ScriptFile(path) => {
                cmd.arg(path).stdin(Stdio::null());
            }
            SubmitPayload::Inline(_) => {
                cmd.stdin(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| failed(format!("failed to run qsub: {}", e)))?;

        if let SubmitPayload::Inline(script) = &request.payload {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(script.as_bytes())
                    .await
                    .map_err(|e| failed(format!("failed to write job script to qsub: {}", e)))?;
            }
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| failed(format!("qsub did not complete: {}", e)))?;

        if !out.status.success() {
            return Err(failed(format!(
                "qsub exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let ack = String::from_utf8_lossy(&out.stdout);
        parse_submit_ack(&ack).ok_or_else(|| {
            failed(format!(
                "unrecognized qsub acknowledgement: '{}'",
                ack.trim()
            ))
        })
    }

    async fn list_active_job_ids(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<HashSet<u64>, JobError> {
        let table = self
            .run_query(&self.commands.qstat, &["-u", user, "-q", queue])
            .await?;
        parse_qstat_job_ids(&table)
    }
}

/// Parses the output of `qconf -sql` into queue names.
pub fn parse_queue_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extracts the job id from a `qsub` acknowledgement.
///
/// `Your job 4242 ("align") has been submitted` yields `Some(4242)`.
pub fn parse_submit_ack(output: &str) -> Option<u64> {
    output
        .split_whitespace()
        .nth(SUBMIT_ACK_ID_TOKEN)?
        .parse()
        .ok()
}

/// Extracts the active job ids from a `qstat` table.
///
/// An empty listing is valid and means no active jobs.
pub fn parse_qstat_job_ids(output: &str) -> Result<HashSet<u64>, JobError> {
    let mut ids = HashSet::new();

    for line in output.lines().skip(QSTAT_HEADER_LINES) {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        let id = first.parse::<u64>().map_err(|_| {
            JobError::SchedulerQuery(format!("unexpected qstat row: '{}'", line.trim()))
        })?;
        ids.insert(id);
    }

    Ok(ids)
}
