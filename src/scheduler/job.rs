//! Job definitions for the scheduler.
//!
//! A `Job` is one unit of work handed to the batch scheduler. It carries
//! either a shell command, which gets wrapped in a generated bash script, or
//! the path of a ready-made script. Its lifecycle is
//! `Pending -> Waiting -> Success | Error`:
//!
//! - `submit` assigns the scheduler id and moves it to `Waiting`
//! - group reconciliation moves it to a terminal status once the scheduler
//!   stops listing it, based on the last line of its captured output

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use crate::error::JobError;
use crate::storage::JobRecord;

use super::adapter::{SchedulerAdapter, SubmitPayload, SubmitRequest};

/// Status of a job as tracked by its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet submitted.
    Pending,
    /// Accepted by the scheduler, outcome unknown.
    Waiting,
    /// Left the scheduler and printed its sentinel line.
    Success,
    /// Left the scheduler without a matching sentinel line.
    Error,
}

impl JobStatus {
    /// Returns whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "waiting" => Ok(JobStatus::Waiting),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Bytes read from the end of an output file to find its last line.
const OUTPUT_TAIL_LEN: u64 = 64 * 1024;

/// Returns the line a job prints last when it completes normally.
pub fn sentinel_line(job_name: &str, group_id: &str) -> String {
    format!("END OF job {} from group {}", job_name, group_id)
}

/// A single unit of work submitted to the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
    name: String,
    group_id: String,
    command: Option<String>,
    script_path: Option<PathBuf>,
    wrapper_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    queue: String,
    resource_hints: Vec<String>,
    scheduler_job_id: Option<u64>,
    status: JobStatus,
    submitted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a job with neither command nor script; set exactly one of
    /// them before submission.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_id: String::new(),
            command: None,
            script_path: None,
            wrapper_path: None,
            working_dir: None,
            queue: String::new(),
            resource_hints: Vec::new(),
            scheduler_job_id: None,
            status: JobStatus::Pending,
            submitted_at: None,
        }
    }

    /// Creates a job running a (possibly multi-line) bash command.
    pub fn command_job(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name).with_command(command)
    }

    /// Creates a job running an existing script.
    ///
    /// The script must print the sentinel line itself, see [`sentinel_line`].
    pub fn script_job(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self::new(name).with_script(script)
    }

    /// Sets the bash command.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Sets the script path.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script_path = Some(script.into());
        self
    }

    /// Writes the generated wrapper of a command job to this path instead
    /// of piping it to the scheduler. A relative path is taken relative to
    /// the working directory.
    pub fn with_wrapper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wrapper_path = Some(path.into());
        self
    }

    /// Sets the directory the job runs in and writes its output to.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn resource_hints(&self) -> &[String] {
        &self.resource_hints
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn scheduler_job_id(&self) -> Option<u64> {
        self.scheduler_job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Stamps the owning group's identity and defaults onto the job.
    pub(crate) fn attach(&mut self, group_id: &str, queue: &str, resource_hints: &[String]) {
        self.group_id = group_id.to_string();
        self.queue = queue.to_string();
        self.resource_hints = resource_hints.to_vec();
    }

    /// Returns the sentinel line this job prints on normal completion.
    pub fn sentinel(&self) -> String {
        sentinel_line(&self.name, &self.group_id)
    }

    /// Returns where the scheduler captures the merged stdout/stderr.
    ///
    /// Only known once the job has been submitted.
    pub fn output_path(&self) -> Option<PathBuf> {
        let dir = self.working_dir.as_ref()?;
        let id = self.scheduler_job_id?;
        Some(dir.join(format!("{}.o{}", self.name, id)))
    }

    /// Renders the bash wrapper around a command.
    ///
    /// The wrapper stops at the first failing command, so the sentinel is
    /// only printed when everything before it succeeded.
    pub fn render_wrapper(&self, command: &str) -> String {
        let lines = [
            "#!/usr/bin/env bash".to_string(),
            "set -e".to_string(),
            "set -o pipefail".to_string(),
            "date".to_string(),
            command.to_string(),
            "date".to_string(),
            format!("echo {}", shell_quote(&self.sentinel())),
        ];
        lines.join("\n") + "\n"
    }

    fn invalid(&self, reason: &str) -> JobError {
        JobError::InvalidJobSpec {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Submits the job through `adapter`.
    ///
    /// On success the job moves from `Pending` to `Waiting` and keeps the
    /// returned scheduler id for the rest of its life.
    pub async fn submit(
        &mut self,
        adapter: &dyn SchedulerAdapter,
        queue: &str,
        resource_hints: &[String],
    ) -> Result<u64, JobError> {
        if let Some(id) = self.scheduler_job_id {
            return Err(JobError::InvalidJobSpec {
                name: self.name.clone(),
                reason: format!("already submitted as job {}", id),
            });
        }
        if !is_valid_job_name(&self.name) {
            return Err(self.invalid(
                "name must be non-empty and only contain letters, digits, '-', '_' or '.'",
            ));
        }

        let working_dir = match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => std::env::current_dir()?.join(dir),
            None => std::env::current_dir()?,
        };

        let payload = match (&self.command, &self.script_path) {
            (Some(command), None) => {
                let wrapper = self.render_wrapper(command);
                match &self.wrapper_path {
                    Some(path) => {
                        let path = working_dir.join(path);
                        write_wrapper(&path, &wrapper).await?;
                        SubmitPayload::ScriptFile(path)
                    }
                    None => SubmitPayload::Inline(wrapper),
                }
            }
            (None, Some(script)) => SubmitPayload::ScriptFile(script.clone()),
            (None, None) => return Err(self.invalid("neither a command nor a script is set")),
            (Some(_), Some(_)) => return Err(self.invalid("both a command and a script are set")),
        };

        let request = SubmitRequest {
            payload,
            queue: queue.to_string(),
            name: self.name.clone(),
            working_dir: working_dir.clone(),
            resource_hints: resource_hints.to_vec(),
        };

        let id = adapter.submit(&request).await?;

        self.queue = queue.to_string();
        self.resource_hints = resource_hints.to_vec();
        self.working_dir = Some(working_dir);
        self.scheduler_job_id = Some(id);
        self.submitted_at = Some(Utc::now());
        self.status = JobStatus::Waiting;

        info!(
            job = %self.name,
            group_id = %self.group_id,
            job_id = id,
            queue = %self.queue,
            "Job submitted"
        );
        Ok(id)
    }

    /// Decides the terminal status from the captured output file.
    ///
    /// `Success` only if the last line equals the sentinel; an empty file,
    /// a partial write or another job's sentinel all give `Error`. Only the
    /// tail of the file is read and it is compared byte-wise, so output that
    /// is not UTF-8 is fine. Fails with `JobError::OutputUnavailable` if the
    /// file cannot be read.
    pub async fn resolve_terminal_status(
        &self,
        captured_output: &Path,
    ) -> Result<JobStatus, JobError> {
        let (tail, truncated) = read_tail(captured_output, OUTPUT_TAIL_LEN)
            .await
            .map_err(|source| JobError::OutputUnavailable {
                path: captured_output.to_path_buf(),
                source,
            })?;

        let status = match last_line(&tail, truncated) {
            Some(line) if line == self.sentinel().as_bytes() => JobStatus::Success,
            _ => JobStatus::Error,
        };

        debug!(
            job = %self.name,
            output = %captured_output.display(),
            status = %status,
            "Resolved terminal status"
        );
        Ok(status)
    }

    /// Records a terminal status. Only a `Waiting` job can finish.
    pub(crate) fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        if self.status == JobStatus::Waiting && status.is_terminal() {
            self.status = status;
        }
    }

    /// Builds the persisted record of a submitted job.
    pub fn to_record(&self) -> Option<JobRecord> {
        Some(JobRecord {
            scheduler_job_id: self.scheduler_job_id?,
            job_name: self.name.clone(),
            working_dir: self.working_dir.clone()?,
            group_id: self.group_id.clone(),
            queue: self.queue.clone(),
            resource_hints: self.resource_hints.clone(),
            status: self.status,
            submitted_at: self.submitted_at?,
        })
    }
}

fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Single-quotes a string for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Reads at most `max_len` bytes from the end of `path`.
///
/// The flag is set when the file is longer than what was read.
async fn read_tail(path: &Path, max_len: u64) -> std::io::Result<(Vec<u8>, bool)> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_len);
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    let mut tail = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut tail).await?;
    Ok((tail, start > 0))
}

/// Last line of `tail` with its line ending and trailing whitespace removed.
///
/// `None` when the line may start before `tail` does.
fn last_line(tail: &[u8], truncated: bool) -> Option<&[u8]> {
    let body = tail.strip_suffix(b"\n").unwrap_or(tail);
    let line = match body.iter().rposition(|&b| b == b'\n') {
        Some(pos) => &body[pos + 1..],
        None if truncated => return None,
        None => body,
    };
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    Some(&line[..end])
}

/// Writes the wrapper script, readable and executable by the owner only.
///
/// A wrapper left by an earlier run is read-only, so it is removed first.
async fn write_wrapper(path: &Path, content: &str) -> Result<(), JobError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Replacing existing wrapper script"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o500)).await?;
    }
    Ok(())
}
