//! End-to-end job lifecycle tests against an in-process fake scheduler.
//!
//! The fake hands out increasing job ids, "runs" every job at submission time
//! by writing its captured output file, and keeps each job in the active list
//! for a configurable number of polls.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gridjobs::config::ManagerConfig;
use gridjobs::scheduler::{
    sentinel_line, BackoffSchedule, Job, JobManager, JobStatus, SchedulerAdapter, SchedulerKind,
    SubmitPayload, SubmitRequest,
};
use gridjobs::storage::{JobRecordStore, SqliteJobStore};
use gridjobs::JobError;

/// Id the fake always reports active, owned by some other user session.
const FOREIGN_JOB_ID: u64 = 999_999;

#[derive(Default)]
struct FakeState {
    /// Queue and remaining active polls, per job id.
    active: HashMap<u64, (String, usize)>,
    submissions: Vec<SubmitRequest>,
}

struct FakeScheduler {
    queues: HashSet<String>,
    default_active_polls: usize,
    active_polls_by_name: HashMap<String, usize>,
    /// Jobs whose command "fails": the output lacks the sentinel.
    failing: HashSet<String>,
    /// Jobs whose output file never appears.
    lost_output: HashSet<String>,
    fail_queries: AtomicBool,
    next_id: AtomicU64,
    polls: AtomicUsize,
    state: Mutex<FakeState>,
}

impl FakeScheduler {
    fn new(active_polls: usize) -> Self {
        Self {
            queues: ["normal.q", "long.q"].iter().map(|q| q.to_string()).collect(),
            default_active_polls: active_polls,
            active_polls_by_name: HashMap::new(),
            failing: HashSet::new(),
            lost_output: HashSet::new(),
            fail_queries: AtomicBool::new(false),
            next_id: AtomicU64::new(1000),
            polls: AtomicUsize::new(0),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn with_active_polls(mut self, name: &str, polls: usize) -> Self {
        self.active_polls_by_name.insert(name.to_string(), polls);
        self
    }

    fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    fn losing_output(mut self, name: &str) -> Self {
        self.lost_output.insert(name.to_string());
        self
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    fn submissions(&self) -> Vec<SubmitRequest> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// What the job prints when run: a date line, then whatever the last
    /// `echo` of its script prints.
    fn emulated_output(&self, request: &SubmitRequest) -> String {
        let script = match &request.payload {
            SubmitPayload::Inline(text) => text.clone(),
            SubmitPayload::ScriptFile(path) => std::fs::read_to_string(path).unwrap_or_default(),
        };
        let mut output = String::from("Thu Oct 16 10:00:00 UTC 2026\n");
        if self.failing.contains(&request.name) {
            output.push_str("bwa: command not found\n");
            return output;
        }
        if let Some(printed) = script
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.strip_prefix("echo "))
        {
            output.push_str(printed.trim().trim_matches('\''));
            output.push('\n');
        }
        output
    }
}

#[async_trait]
impl SchedulerAdapter for FakeScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Sge
    }

    async fn validate_queue(&self, queue: &str) -> Result<(), JobError> {
        if self.queues.contains(queue) {
            Ok(())
        } else {
            Err(JobError::UnknownQueue(queue.to_string()))
        }
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<u64, JobError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        if !self.lost_output.contains(&request.name) {
            let output = request.working_dir.join(format!("{}.o{}", request.name, id));
            std::fs::write(output, self.emulated_output(request))?;
        }

        let polls = self
            .active_polls_by_name
            .get(&request.name)
            .copied()
            .unwrap_or(self.default_active_polls);
        let mut state = self.state.lock().unwrap();
        state.active.insert(id, (request.queue.clone(), polls));
        state.submissions.push(request.clone());
        Ok(id)
    }

    async fn list_active_job_ids(&self, user: &str, queue: &str) -> Result<HashSet<u64>, JobError> {
        assert_eq!(user, "jdoe");
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(JobError::SchedulerQuery("qstat exited with status 1".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        let mut ids = HashSet::from([FOREIGN_JOB_ID]);
        for (id, (job_queue, remaining)) in state.active.iter_mut() {
            if job_queue == queue && *remaining > 0 {
                *remaining -= 1;
                ids.insert(*id);
            }
        }
        Ok(ids)
    }
}

fn config(dir: &Path) -> ManagerConfig {
    ManagerConfig::new()
        .with_project_id("lifecycle")
        .with_user("jdoe")
        .with_database_dir(dir)
        .with_backoff(BackoffSchedule::constant(Duration::from_millis(2)))
}

async fn manager_with(fake: &Arc<FakeScheduler>, config: ManagerConfig) -> JobManager {
    JobManager::with_adapter(fake.clone(), config).await.unwrap()
}

async fn add_group(manager: &mut JobManager, group: &str, queue: &str, dir: &Path, names: &[&str]) {
    manager
        .create_group(group, queue, vec!["h_vmem=1g".to_string()])
        .await
        .unwrap();
    for name in names {
        let job =
            Job::command_job(*name, format!("echo running {}", name)).with_working_dir(dir);
        manager.insert_job(group, job).unwrap();
    }
}

#[tokio::test]
async fn test_three_jobs_active_for_two_polls() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(2));
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "align", "normal.q", dir.path(), &["s1", "s2", "s3"]).await;

    let ids = manager.submit("align", None).await.unwrap();
    assert_eq!(ids.len(), 3);
    let group = manager.group("align").unwrap();
    assert_eq!(group.count(JobStatus::Waiting), 3);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);

    let report = manager.wait("align", true).await.unwrap();

    assert_eq!(fake.polls(), 3);
    assert_eq!(report.polls, 3);
    assert_eq!(report.finished, 3);
    assert_eq!(manager.group("align").unwrap().count(JobStatus::Success), 3);

    let records = manager.store().list_group("align").await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == JobStatus::Success));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submission_carries_group_settings() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "align", "long.q", dir.path(), &["s1"]).await;

    manager.submit("align", None).await.unwrap();

    let submissions = fake.submissions();
    assert_eq!(submissions.len(), 1);
    let request = &submissions[0];
    assert_eq!(request.queue, "long.q");
    assert_eq!(request.name, "s1");
    assert_eq!(request.working_dir, dir.path());
    assert_eq!(request.resource_hints, vec!["h_vmem=1g"]);
    match &request.payload {
        SubmitPayload::Inline(script) => {
            assert!(script.starts_with("#!/usr/bin/env bash\n"));
            assert!(script.contains("echo running s1"));
            assert!(script.trim_end().ends_with(&format!("'{}'", sentinel_line("s1", "align"))));
        }
        other => panic!("expected inline payload, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resubmission_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a", "b", "c"]).await;

    let first = manager.submit("g", None).await.unwrap();
    let second = manager.submit("g", None).await.unwrap();
    let subset = manager.submit("g", Some(&[1])).await.unwrap();

    assert_eq!(first.len(), 3);
    assert!(second.is_empty());
    assert!(subset.is_empty());
    assert_eq!(fake.submission_count(), 3);

    let ids: Vec<u64> = manager
        .group("g")
        .unwrap()
        .jobs()
        .iter()
        .filter_map(Job::scheduler_job_id)
        .collect();
    assert_eq!(ids, first);
}

#[tokio::test]
async fn test_compute_unfinished_ignores_foreign_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(5));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a", "b"]).await;
    let ids = manager.submit("g", None).await.unwrap();

    let group = manager.group("g").unwrap();
    let active = fake.list_active_job_ids("jdoe", "normal.q").await.unwrap();
    assert!(active.contains(&FOREIGN_JOB_ID));

    let unfinished = group.compute_unfinished(&active);
    assert_eq!(unfinished, ids);
    assert_eq!(group.compute_unfinished(&active), unfinished);
}

#[tokio::test]
async fn test_groups_on_same_queue_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(
        FakeScheduler::new(0)
            .with_active_polls("a1", 1)
            .with_active_polls("a2", 2),
    );
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "first", "normal.q", dir.path(), &["a1", "a2"]).await;
    add_group(&mut manager, "second", "normal.q", dir.path(), &["b1", "b2"]).await;
    manager.submit("first", None).await.unwrap();
    manager.submit("second", None).await.unwrap();

    // Jobs of "second" already left the active list, but only "first" is waited on.
    manager.wait("first", false).await.unwrap();

    assert_eq!(manager.group("first").unwrap().count(JobStatus::Success), 2);
    assert_eq!(manager.group("second").unwrap().count(JobStatus::Waiting), 2);
    let second = manager.store().list_group("second").await.unwrap();
    assert!(second.iter().all(|r| r.status == JobStatus::Waiting));

    manager.wait("second", false).await.unwrap();
    assert_eq!(manager.group("second").unwrap().count(JobStatus::Success), 2);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_reported_with_output_location() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(1).failing("bad"));
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["bad"]).await;
    let ids = manager.submit("g", None).await.unwrap();

    let err = manager.wait("g", false).await.unwrap_err();

    assert!(err.is_job_failure());
    let msg = err.to_string();
    assert!(msg.contains("failure of job bad"));
    assert!(msg.contains("group=g"));
    assert!(msg.contains(&format!("id={}", ids[0])));
    assert!(msg.contains(&dir.path().join(format!("bad.o{}", ids[0])).display().to_string()));

    assert_eq!(manager.group("g").unwrap().jobs()[0].status(), JobStatus::Error);
    let records = manager.store().list_group("g").await.unwrap();
    assert_eq!(records[0].status, JobStatus::Error);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_output_counts_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0).losing_output("ghost"));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["ghost"]).await;
    manager.submit("g", None).await.unwrap();

    let err = manager.wait("g", false).await.unwrap_err();

    match err {
        JobError::JobFailed { name, cause, .. } => {
            assert_eq!(name, "ghost");
            assert!(matches!(cause.as_deref(), Some(JobError::OutputUnavailable { .. })));
        }
        other => panic!("expected JobFailed, got {:?}", other),
    }
    assert_eq!(manager.group("g").unwrap().jobs()[0].status(), JobStatus::Error);
}

#[tokio::test]
async fn test_output_deleted_before_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(3));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["keep", "gone"]).await;
    manager.submit("g", None).await.unwrap();

    let gone = manager.group("g").unwrap().jobs()[1].output_path().unwrap();
    std::fs::remove_file(&gone).unwrap();

    let err = manager.wait("g", false).await.unwrap_err();
    assert!(matches!(err, JobError::JobFailed { ref name, .. } if name == "gone"));
    let group = manager.group("g").unwrap();
    assert_eq!(group.jobs()[0].status(), JobStatus::Success);
    assert_eq!(group.jobs()[1].status(), JobStatus::Error);
}

#[tokio::test]
async fn test_reconcile_after_terminal_is_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0));
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a", "b"]).await;
    manager.submit("g", None).await.unwrap();
    manager.wait("g", false).await.unwrap();

    let store = manager.store().clone();
    let group = manager.group_mut("g").unwrap();
    assert_eq!(group.reconcile_finished(&[], &store).await.unwrap(), 0);
    assert_eq!(group.count(JobStatus::Success), 2);

    let polls = fake.polls();
    let report = manager.wait("g", false).await.unwrap();
    assert_eq!(report.polls, 0);
    assert_eq!(fake.polls(), polls);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_on_unsubmitted_group_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a"]).await;
    manager.create_group("empty", "normal.q", vec![]).await.unwrap();

    assert_eq!(manager.wait("g", true).await.unwrap().polls, 0);
    assert_eq!(manager.wait("empty", true).await.unwrap().polls, 0);
    assert_eq!(fake.polls(), 0);
}

#[tokio::test]
async fn test_wrapper_file_and_script_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(1));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    manager.create_group("g", "normal.q", vec![]).await.unwrap();

    let wrapper = dir.path().join("wrapped.bash");
    manager
        .insert_job(
            "g",
            Job::command_job("wrapped", "sort input.txt > sorted.txt")
                .with_working_dir(dir.path())
                .with_wrapper_path(&wrapper),
        )
        .unwrap();

    let script = dir.path().join("custom.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\nwc -l input.txt\necho '{}'\n", sentinel_line("custom", "g")),
    )
    .unwrap();
    manager
        .insert_job("g", Job::script_job("custom", &script).with_working_dir(dir.path()))
        .unwrap();

    manager.submit("g", None).await.unwrap();
    let submissions = fake.submissions();
    assert_eq!(submissions[0].payload, SubmitPayload::ScriptFile(wrapper.clone()));
    assert_eq!(submissions[1].payload, SubmitPayload::ScriptFile(script));
    assert!(std::fs::read_to_string(&wrapper)
        .unwrap()
        .contains("sort input.txt > sorted.txt"));

    manager.wait("g", false).await.unwrap();
    assert_eq!(manager.group("g").unwrap().count(JobStatus::Success), 2);
}

#[tokio::test]
async fn test_cancel_stops_waiting_and_keeps_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(usize::MAX));
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["slow"]).await;
    manager.submit("g", None).await.unwrap();

    let handle = manager.cancel_handle();
    let cancel_later = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
    };
    let (result, ()) = tokio::join!(manager.wait("g", false), cancel_later);

    assert!(matches!(result, Err(JobError::Cancelled(ref g)) if g == "g"));
    assert!(fake.polls() > 0);
    assert_eq!(manager.group("g").unwrap().jobs()[0].status(), JobStatus::Waiting);
    let records = manager.store().list_group("g").await.unwrap();
    assert_eq!(records[0].status, JobStatus::Waiting);

    // A cancelled manager stays cancelled for later waits.
    let err = manager.wait("g", false).await.unwrap_err();
    assert!(matches!(err, JobError::Cancelled(_)));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_all_runs_groups_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(2));
    let mut manager = manager_with(&fake, config(dir.path())).await;
    add_group(&mut manager, "beta", "long.q", dir.path(), &["b1"]).await;
    add_group(&mut manager, "alpha", "normal.q", dir.path(), &["a1", "a2"]).await;
    manager.submit("alpha", None).await.unwrap();
    manager.submit("beta", None).await.unwrap();

    let reports = manager.wait_all(false).await.unwrap();

    let names: Vec<&str> = reports.iter().map(|(g, _)| g.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(reports.iter().all(|(_, r)| r.polls == 3));
    assert!(manager.groups().all(|g| g.count(JobStatus::Success) == g.len()));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_all_fails_with_group_error() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0).failing("broken"));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "ok", "normal.q", dir.path(), &["fine"]).await;
    add_group(&mut manager, "ko", "long.q", dir.path(), &["broken"]).await;
    manager.submit("ok", None).await.unwrap();
    manager.submit("ko", None).await.unwrap();

    let err = manager.wait_all(false).await.unwrap_err();
    assert!(matches!(err, JobError::JobFailed { ref group_id, .. } if group_id == "ko"));
}

#[tokio::test]
async fn test_query_failure_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(1));
    fake.fail_queries.store(true, Ordering::SeqCst);
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a"]).await;
    manager.submit("g", None).await.unwrap();

    let err = manager.wait("g", false).await.unwrap_err();
    assert!(matches!(err, JobError::SchedulerQuery(_)));
    assert_eq!(manager.group("g").unwrap().jobs()[0].status(), JobStatus::Waiting);
}

#[tokio::test]
async fn test_manager_rejects_bad_groups() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(0));
    let mut manager = manager_with(&fake, config(dir.path()).with_persistence(false)).await;

    manager.create_group("g", "normal.q", vec![]).await.unwrap();
    assert!(matches!(
        manager.create_group("g", "long.q", vec![]).await.unwrap_err(),
        JobError::DuplicateGroup(_)
    ));
    assert!(matches!(
        manager.create_group("h", "missing.q", vec![]).await.unwrap_err(),
        JobError::UnknownQueue(_)
    ));
    assert!(matches!(
        manager.submit("nope", None).await.unwrap_err(),
        JobError::UnknownGroup(_)
    ));
    assert!(matches!(
        manager.submit("g", Some(&[3])).await.unwrap_err(),
        JobError::UnknownJobIndex { index: 3, .. }
    ));
}

#[tokio::test]
async fn test_kept_database_can_be_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeScheduler::new(1));
    let mut manager = manager_with(&fake, config(dir.path()).with_keep_database(true)).await;
    add_group(&mut manager, "g", "normal.q", dir.path(), &["a", "b"]).await;
    let ids = manager.submit("g", None).await.unwrap();
    manager.wait("g", false).await.unwrap();

    let path = manager.database_path().unwrap().to_path_buf();
    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("lifecycle_"));
    manager.shutdown().await.unwrap();

    let store = SqliteJobStore::open(&path).await.unwrap();
    let records = store.list_group("g").await.unwrap();
    let stored: Vec<u64> = records.iter().map(|r| r.scheduler_job_id).collect();
    assert_eq!(stored, ids);
    assert!(records.iter().all(|r| r.status == JobStatus::Success));
    assert_eq!(records[0].resource_hints, vec!["h_vmem=1g"]);
    store.close().await.unwrap();
}
