//! Job manager: registry of groups sharing one scheduler and one record store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::storage::{OptionalStore, SqliteJobStore};

use super::adapter::{SchedulerAdapter, SchedulerKind};
use super::backoff::BackoffSchedule;
use super::group::{JobGroup, PollContext, WaitReport};
use super::job::Job;

/// Length of the random suffix in record database file names.
const DB_SUFFIX_LEN: usize = 8;

/// Cloneable handle that cancels every wait loop of a [`JobManager`].
///
/// Cancelling only stops the local polling; jobs already handed to the
/// scheduler keep running.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Requests cancellation. Wait loops started later are cancelled too.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owns the job groups of one project.
///
/// Groups are independent: waiting on one never resolves jobs of another,
/// even when they share a queue.
pub struct JobManager {
    adapter: Arc<dyn SchedulerAdapter>,
    project_id: String,
    user: String,
    backoff: BackoffSchedule,
    groups: BTreeMap<String, JobGroup>,
    store: OptionalStore,
    database_path: Option<PathBuf>,
    keep_database: bool,
    cancel: CancelHandle,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("scheduler", &self.adapter.kind())
            .field("project_id", &self.project_id)
            .field("user", &self.user)
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl JobManager {
    /// Creates a manager for the scheduler named in `config`.
    pub async fn new(config: ManagerConfig) -> Result<Self, JobError> {
        let adapter = config.scheduler.adapter();
        Self::with_adapter(adapter, config).await
    }

    /// Creates a manager driving a caller-supplied adapter.
    ///
    /// With persistence enabled a fresh record database is created under
    /// `config.database_dir`.
    pub async fn with_adapter(
        adapter: Arc<dyn SchedulerAdapter>,
        config: ManagerConfig,
    ) -> Result<Self, JobError> {
        config.validate()?;

        let (store, database_path) = if config.persistence {
            let path = database_file_path(&config.database_dir, &config.project_id);
            let store = SqliteJobStore::create(&path).await?;
            (OptionalStore::some(Arc::new(store)), Some(path))
        } else {
            (OptionalStore::none(), None)
        };

        let (tx, _rx) = watch::channel(false);

        info!(
            scheduler = %adapter.kind(),
            project_id = %config.project_id,
            user = %config.user,
            persistence = store.is_enabled(),
            "Job manager started"
        );

        Ok(Self {
            adapter,
            project_id: config.project_id,
            user: config.user,
            backoff: config.backoff,
            groups: BTreeMap::new(),
            store,
            database_path,
            keep_database: config.keep_database,
            cancel: CancelHandle { tx: Arc::new(tx) },
        })
    }

    pub fn kind(&self) -> SchedulerKind {
        self.adapter.kind()
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn store(&self) -> &OptionalStore {
        &self.store
    }

    /// Path of the record database, if persistence is enabled.
    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    /// Registers a new group after checking that the scheduler knows `queue`.
    pub async fn create_group(
        &mut self,
        group_id: &str,
        queue: &str,
        resource_hints: Vec<String>,
    ) -> Result<&mut JobGroup, JobError> {
        if self.groups.contains_key(group_id) {
            return Err(JobError::DuplicateGroup(group_id.to_string()));
        }
        self.adapter.validate_queue(queue).await?;

        debug!(group_id = %group_id, queue = %queue, "Job group created");
        Ok(self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| JobGroup::new(group_id, queue, resource_hints)))
    }

    pub fn group(&self, group_id: &str) -> Result<&JobGroup, JobError> {
        self.groups
            .get(group_id)
            .ok_or_else(|| JobError::UnknownGroup(group_id.to_string()))
    }

    pub fn group_mut(&mut self, group_id: &str) -> Result<&mut JobGroup, JobError> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| JobError::UnknownGroup(group_id.to_string()))
    }

    /// Groups in id order.
    pub fn groups(&self) -> impl Iterator<Item = &JobGroup> {
        self.groups.values()
    }

    /// Inserts `job` into a group, returning its index there.
    pub fn insert_job(&mut self, group_id: &str, job: Job) -> Result<usize, JobError> {
        self.group_mut(group_id)?.insert(job)
    }

    /// Submits the selected jobs of a group, all of them when `selection` is `None`.
    pub async fn submit(
        &mut self,
        group_id: &str,
        selection: Option<&[usize]>,
    ) -> Result<Vec<u64>, JobError> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| JobError::UnknownGroup(group_id.to_string()))?;
        group
            .submit(self.adapter.as_ref(), &self.store, selection)
            .await
    }

    /// Blocks until every submitted job of the group has finished.
    pub async fn wait(&mut self, group_id: &str, verbose: bool) -> Result<WaitReport, JobError> {
        let ctx = PollContext {
            adapter: self.adapter.as_ref(),
            store: &self.store,
            user: &self.user,
            schedule: &self.backoff,
        };
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| JobError::UnknownGroup(group_id.to_string()))?;

        group
            .wait(&ctx, Some(self.cancel.tx.subscribe()), verbose)
            .await
    }

    /// Waits on all groups concurrently, failing with the first group error.
    ///
    /// Returns one report per group, in group id order.
    pub async fn wait_all(&mut self, verbose: bool) -> Result<Vec<(String, WaitReport)>, JobError> {
        let ctx = PollContext {
            adapter: self.adapter.as_ref(),
            store: &self.store,
            user: &self.user,
            schedule: &self.backoff,
        };
        let ctx = &ctx;
        let cancel = &self.cancel;

        let waits = self.groups.values_mut().map(|group| {
            let rx = cancel.tx.subscribe();
            async move {
                let report = group.wait(ctx, Some(rx), verbose).await?;
                Ok::<_, JobError>((group.id().to_string(), report))
            }
        });

        try_join_all(waits).await
    }

    /// Returns a handle that cancels this manager's wait loops.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Releases the record store and, unless asked to keep it, deletes the
    /// database file.
    pub async fn shutdown(self) -> Result<(), JobError> {
        self.store.close().await?;

        if let Some(path) = &self.database_path {
            if self.keep_database {
                info!(path = %path.display(), "Keeping job record database");
            } else {
                remove_database_files(path).await?;
                debug!(path = %path.display(), "Job record database removed");
            }
        }

        info!(project_id = %self.project_id, "Job manager shut down");
        Ok(())
    }
}

/// Builds `<dir>/<project>_<random>.db`.
fn database_file_path(dir: &Path, project_id: &str) -> PathBuf {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(DB_SUFFIX_LEN)
        .collect();
    dir.join(format!("{}_{}.db", project_id, suffix))
}

/// Removes the database file and any SQLite side files left next to it.
async fn remove_database_files(path: &Path) -> Result<(), JobError> {
    tokio::fs::remove_file(path).await?;

    for side in ["-wal", "-shm"] {
        let mut side_path = path.as_os_str().to_os_string();
        side_path.push(side);
        match tokio::fs::remove_file(PathBuf::from(side_path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove SQLite side file"),
        }
    }
    Ok(())
}
