//! SQLite-backed job record store.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::scheduler::JobStatus;

use super::records::{JobRecord, JobRecordStore, StoreError};
use super::schema;

/// Job record store backed by a single SQLite database file.
///
/// The pool is capped at one connection, so every write goes through the
/// same connection in submission order.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteJobStore {
    /// Creates a new database at `path`.
    ///
    /// Fails with `StoreError::ConnectionFailed` if the file already exists,
    /// so two runs never share a record table by accident.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::ConnectionFailed(format!(
                "database '{}' already exists",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    /// Opens an existing database, e.g. one kept after a previous run.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect(path.as_ref(), false).await
    }

    async fn connect(path: &Path, create: bool) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(path = %path.display(), "Job record store opened");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every record, ordered by group then scheduler id.
    pub async fn list_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY group_id, scheduler_job_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    fn row_to_record(row: &SqliteRow) -> Result<JobRecord, StoreError> {
        let status: String = row.get("status");
        let status =
            JobStatus::from_str(&status).map_err(|_| StoreError::InvalidStatus(status.clone()))?;
        let hints: String = row.get("resource_hints");
        let working_dir: String = row.get("working_dir");
        let submitted_at: DateTime<Utc> = row.get("submitted_at");

        Ok(JobRecord {
            scheduler_job_id: row.get::<i64, _>("scheduler_job_id") as u64,
            job_name: row.get("job_name"),
            working_dir: PathBuf::from(working_dir),
            group_id: row.get("group_id"),
            queue: row.get("queue"),
            resource_hints: hints.split_whitespace().map(str::to_string).collect(),
            status,
            submitted_at,
        })
    }
}

#[async_trait]
impl JobRecordStore for SqliteJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (
                scheduler_job_id, job_name, working_dir, group_id, queue,
                resource_hints, status, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'waiting', ?7)",
        )
        .bind(record.scheduler_job_id as i64)
        .bind(&record.job_name)
        .bind(record.working_dir.to_string_lossy().to_string())
        .bind(&record.group_id)
        .bind(&record.queue)
        .bind(record.resource_hints.join(" "))
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await?;

        debug!(
            job_id = record.scheduler_job_id,
            group_id = %record.group_id,
            "Job record inserted"
        );
        Ok(())
    }

    async fn update_status(&self, job_id: u64, status: JobStatus) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition { job_id, to: status });
        }

        let result = sqlx::query(
            "UPDATE jobs SET status = ?2 WHERE scheduler_job_id = ?1 AND status = 'waiting'",
        )
        .bind(job_id as i64)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition { job_id, to: status });
        }
        Ok(())
    }

    async fn get(&self, job_id: u64) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE scheduler_job_id = ?1")
            .bind(job_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_group(&self, group_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE group_id = ?1 ORDER BY scheduler_job_id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
