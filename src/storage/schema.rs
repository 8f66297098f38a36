//! Database schema constants for the SQLite job record store.

/// SQL schema for creating the jobs table.
///
/// `status` is one of `waiting`, `success` or `error`; `resource_hints`
/// holds the hints joined by single spaces.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    scheduler_job_id INTEGER PRIMARY KEY,
    job_name         TEXT    NOT NULL,
    working_dir      TEXT    NOT NULL,
    group_id         TEXT    NOT NULL,
    queue            TEXT    NOT NULL,
    resource_hints   TEXT    NOT NULL DEFAULT '',
    status           TEXT    NOT NULL DEFAULT 'waiting',
    submitted_at     TEXT    NOT NULL
)
"#;

/// Index used to list the records of a group.
pub const CREATE_GROUP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_group_id ON jobs(group_id)";

/// Index used to find jobs still waiting.
pub const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_JOBS_TABLE, CREATE_GROUP_INDEX, CREATE_STATUS_INDEX]
}
