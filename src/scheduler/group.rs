//! Job groups and their reconciliation loop.
//!
//! All jobs of a group share one queue and one set of default resource
//! hints. The group owns the only mapping from scheduler job id to job, and
//! that mapping is what protects it from other groups of the same user on
//! the same queue: an id the scheduler reports active is only considered
//! if this group submitted it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::storage::OptionalStore;

use super::adapter::SchedulerAdapter;
use super::backoff::BackoffSchedule;
use super::job::{Job, JobStatus};

/// Everything a wait loop needs besides the group itself.
pub struct PollContext<'a> {
    pub adapter: &'a dyn SchedulerAdapter,
    pub store: &'a OptionalStore,
    /// Owner of the jobs, as the scheduler knows them.
    pub user: &'a str,
    pub schedule: &'a BackoffSchedule,
}

/// Outcome of a completed wait loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitReport {
    /// Number of active-list queries made.
    pub polls: usize,
    /// Number of jobs resolved during this wait.
    pub finished: usize,
}

/// An ordered collection of jobs sharing a queue and resource hints.
#[derive(Debug)]
pub struct JobGroup {
    id: String,
    queue: String,
    resource_hints: Vec<String>,
    jobs: Vec<Job>,
    /// Append-only, filled as submissions are acknowledged.
    index_by_job_id: HashMap<u64, usize>,
    /// Set once submission starts; no more inserts afterwards.
    sealed: bool,
    /// Submitted jobs whose record insert failed. Written again before
    /// their status update.
    unrecorded: HashSet<u64>,
}

impl JobGroup {
    /// Creates an empty group. The queue is expected to be validated by the
    /// caller, see `JobManager::create_group`.
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        resource_hints: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            resource_hints,
            jobs: Vec::new(),
            index_by_job_id: HashMap::new(),
            sealed: false,
            unrecorded: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn resource_hints(&self) -> &[String] {
        &self.resource_hints
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Looks up a job by the id the scheduler assigned to it.
    pub fn job_by_scheduler_id(&self, job_id: u64) -> Option<&Job> {
        self.index_by_job_id.get(&job_id).map(|&idx| &self.jobs[idx])
    }

    /// Number of jobs currently in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status() == status).count()
    }

    /// Appends a job, stamping this group's id, queue and resource hints on it.
    ///
    /// Returns the job's index in the group.
    pub fn insert(&mut self, mut job: Job) -> Result<usize, JobError> {
        if self.sealed {
            return Err(JobError::GroupSealed(self.id.clone()));
        }
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(JobError::DuplicateJob {
                group_id: self.id.clone(),
                name: job.name().to_string(),
            });
        }

        job.attach(&self.id, &self.queue, &self.resource_hints);
        self.jobs.push(job);
        Ok(self.jobs.len() - 1)
    }

    /// Submits the selected jobs (all of them when `selection` is `None`)
    /// in group order and records each one in `store`.
    ///
    /// Jobs that already carry a scheduler id are skipped. The first failure
    /// aborts the rest of the batch; jobs submitted before it keep their id
    /// and stay `Waiting`.
    pub async fn submit(
        &mut self,
        adapter: &dyn SchedulerAdapter,
        store: &OptionalStore,
        selection: Option<&[usize]>,
    ) -> Result<Vec<u64>, JobError> {
        let indices: Vec<usize> = match selection {
            Some(indices) => indices.to_vec(),
            None => (0..self.jobs.len()).collect(),
        };
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.jobs.len()) {
            return Err(JobError::UnknownJobIndex {
                group_id: self.id.clone(),
                index: bad,
            });
        }

        self.sealed = true;
        let mut submitted = Vec::with_capacity(indices.len());

        for idx in indices {
            let job = &mut self.jobs[idx];
            if let Some(existing) = job.scheduler_job_id() {
                warn!(
                    group_id = %self.id,
                    job = %job.name(),
                    job_id = existing,
                    "Job already submitted, skipping"
                );
                continue;
            }

            let queue = job.queue().to_string();
            let hints = job.resource_hints().to_vec();
            let job_id = job.submit(adapter, &queue, &hints).await?;

            if let Some(&other) = self.index_by_job_id.get(&job_id) {
                return Err(JobError::SubmissionFailed {
                    name: self.jobs[idx].name().to_string(),
                    reason: format!(
                        "scheduler reused id {} already held by job '{}'",
                        job_id,
                        self.jobs[other].name()
                    ),
                });
            }
            self.index_by_job_id.insert(job_id, idx);

            if let Some(record) = self.jobs[idx].to_record() {
                if let Err(e) = store.insert(&record).await {
                    warn!(
                        group_id = %self.id,
                        job_id = job_id,
                        error = %e,
                        "Job record insert failed, retrying before its status update"
                    );
                    self.unrecorded.insert(job_id);
                    return Err(e.into());
                }
            }
            submitted.push(job_id);
        }

        info!(
            group_id = %self.id,
            submitted = submitted.len(),
            "Job group submitted"
        );
        Ok(submitted)
    }

    /// Restricts the scheduler's active ids to the ones this group owns.
    ///
    /// Ids belonging to other groups of the same user on the same queue are
    /// dropped. The result is sorted.
    pub fn compute_unfinished(&self, active_ids: &HashSet<u64>) -> Vec<u64> {
        let mut unfinished: Vec<u64> = active_ids
            .iter()
            .copied()
            .filter(|id| self.index_by_job_id.contains_key(id))
            .collect();
        unfinished.sort_unstable();
        unfinished
    }

    /// Resolves every `Waiting` job whose id is not in `unfinished`.
    ///
    /// Each transition is written to `store` before the in-memory status
    /// changes. Stops at the first job found in error and returns
    /// `JobError::JobFailed` for it; siblings are left for a later pass.
    /// Returns the number of jobs resolved.
    pub async fn reconcile_finished(
        &mut self,
        unfinished: &[u64],
        store: &OptionalStore,
    ) -> Result<usize, JobError> {
        let still_active: HashSet<u64> = unfinished.iter().copied().collect();
        let finished: Vec<(usize, u64)> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status() == JobStatus::Waiting)
            .filter_map(|(idx, j)| j.scheduler_job_id().map(|id| (idx, id)))
            .filter(|(_, id)| !still_active.contains(id))
            .collect();

        let mut resolved = 0;
        for (idx, job_id) in finished {
            let job = &self.jobs[idx];
            let Some(output) = job.output_path() else {
                continue;
            };

            let (status, cause) = match job.resolve_terminal_status(&output).await {
                Ok(status) => (status, None),
                Err(e @ JobError::OutputUnavailable { .. }) => (JobStatus::Error, Some(e)),
                Err(e) => return Err(e),
            };

            if self.unrecorded.contains(&job_id) {
                if let Some(record) = self.jobs[idx].to_record() {
                    store.insert(&record).await?;
                }
                self.unrecorded.remove(&job_id);
            }
            store.update_status(job_id, status).await?;
            self.jobs[idx].finish(status);
            resolved += 1;

            if status == JobStatus::Error {
                let job = &self.jobs[idx];
                error!(
                    group_id = %self.id,
                    job = %job.name(),
                    job_id = job_id,
                    output = %output.display(),
                    cause = ?cause,
                    "Job finished in error"
                );
                return Err(JobError::JobFailed {
                    name: job.name().to_string(),
                    group_id: self.id.clone(),
                    job_id,
                    output,
                    cause: cause.map(Box::new),
                });
            }

            debug!(group_id = %self.id, job_id = job_id, "Job finished successfully");
        }

        Ok(resolved)
    }

    /// Polls the scheduler on `ctx.schedule` until none of this group's jobs
    /// is active any more, resolving jobs as they leave the active set.
    ///
    /// Never times out. Returns `JobError::Cancelled` if `cancel` flips to
    /// `true`; this is checked before and during every sleep and leaves the
    /// submitted jobs untouched.
    pub async fn wait(
        &mut self,
        ctx: &PollContext<'_>,
        mut cancel: Option<watch::Receiver<bool>>,
        verbose: bool,
    ) -> Result<WaitReport, JobError> {
        let mut report = WaitReport::default();
        if self.count(JobStatus::Waiting) == 0 {
            debug!(group_id = %self.id, "No waiting jobs, nothing to poll");
            return Ok(report);
        }

        let first = self.jobs.iter().find_map(Job::scheduler_job_id).unwrap_or(0);
        let last = self.jobs.iter().rev().find_map(Job::scheduler_job_id).unwrap_or(0);
        let total = self.jobs.len();
        if verbose {
            info!(group_id = %self.id, "nb of jobs: {} (first={} last={})", total, first, last);
        } else {
            debug!(group_id = %self.id, "nb of jobs: {} (first={} last={})", total, first, last);
        }

        for delay in ctx.schedule.delays() {
            if sleep_unless_cancelled(delay, cancel.as_mut()).await {
                info!(group_id = %self.id, polls = report.polls, "Polling cancelled");
                return Err(JobError::Cancelled(self.id.clone()));
            }

            report.polls += 1;
            let active = ctx
                .adapter
                .list_active_job_ids(ctx.user, &self.queue)
                .await?;
            let unfinished = self.compute_unfinished(&active);
            report.finished += self.reconcile_finished(&unfinished, ctx.store).await?;

            debug!(
                group_id = %self.id,
                poll = report.polls,
                unfinished = unfinished.len(),
                "Polled scheduler"
            );
            if unfinished.is_empty() {
                break;
            }
        }

        if verbose {
            info!(group_id = %self.id, "all job(s) finished ({})", self.jobs.len());
        } else {
            debug!(group_id = %self.id, "all job(s) finished ({})", self.jobs.len());
        }
        Ok(report)
    }
}

/// Sleeps for `delay` unless cancellation is requested first.
///
/// Returns `true` if cancelled.
async fn sleep_unless_cancelled(
    delay: Duration,
    cancel: Option<&mut watch::Receiver<bool>>,
) -> bool {
    let Some(rx) = cancel else {
        tokio::time::sleep(delay).await;
        return false;
    };
    if *rx.borrow_and_update() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = rx.changed() => match changed {
                Ok(()) if *rx.borrow_and_update() => return true,
                Ok(()) => continue,
                // Sender gone, nobody can cancel any more.
                Err(_) => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}
