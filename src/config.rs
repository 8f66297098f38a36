//! Job manager configuration.
//!
//! Settings can be built in code with the `with_*` methods or read from
//! `GRIDJOBS_*` environment variables with [`ManagerConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::{BackoffSchedule, SchedulerKind};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a [`JobManager`](crate::scheduler::JobManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Scheduler the manager talks to.
    pub scheduler: SchedulerKind,
    /// Project identifier, used to name the record database.
    pub project_id: String,
    /// User owning the submitted jobs, as the scheduler knows them.
    pub user: String,

    // Persistence
    /// Whether job records are written to a SQLite database.
    pub persistence: bool,
    /// Directory the record database is created in.
    pub database_dir: PathBuf,
    /// Keep the record database on shutdown instead of deleting it.
    pub keep_database: bool,

    // Polling
    pub backoff: BackoffSchedule,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Sge,
            project_id: "gridjobs".to_string(),
            user: String::new(),
            persistence: true,
            database_dir: PathBuf::from("."),
            keep_database: false,
            backoff: BackoffSchedule::default(),
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GRIDJOBS_SCHEDULER`: Scheduler kind (default: SGE)
    /// - `GRIDJOBS_PROJECT`: Project id (default: gridjobs)
    /// - `GRIDJOBS_USER`: Job owner, falling back to `USER` then `LOGNAME` (required)
    /// - `GRIDJOBS_PERSIST`: Enable the record database (default: true)
    /// - `GRIDJOBS_DB_DIR`: Record database directory (default: .)
    /// - `GRIDJOBS_KEEP_DB`: Keep the record database on shutdown (default: false)
    /// - `GRIDJOBS_BACKOFF_SECS`: Comma-separated warm-up delays (default: 2,2,2,5,5,5,10,10,10)
    /// - `GRIDJOBS_STEADY_SECS`: Steady polling interval (default: 15)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("GRIDJOBS_SCHEDULER") {
            config.scheduler = val.parse().map_err(|e: crate::error::JobError| {
                ConfigError::InvalidValue {
                    key: "GRIDJOBS_SCHEDULER".to_string(),
                    message: e.to_string(),
                }
            })?;
        }

        if let Some(val) = lookup("GRIDJOBS_PROJECT") {
            config.project_id = val;
        }

        config.user = ["GRIDJOBS_USER", "USER", "LOGNAME"]
            .iter()
            .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| ConfigError::MissingEnvVar("GRIDJOBS_USER".to_string()))?;

        // Persistence
        if let Some(val) = lookup("GRIDJOBS_PERSIST") {
            config.persistence = parse_env_bool(&val, "GRIDJOBS_PERSIST")?;
        }

        if let Some(val) = lookup("GRIDJOBS_DB_DIR") {
            config.database_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("GRIDJOBS_KEEP_DB") {
            config.keep_database = parse_env_bool(&val, "GRIDJOBS_KEEP_DB")?;
        }

        // Polling
        let mut warmup = config.backoff.warmup().to_vec();
        let mut steady = config.backoff.steady();

        if let Some(val) = lookup("GRIDJOBS_BACKOFF_SECS") {
            warmup = parse_secs_list(&val, "GRIDJOBS_BACKOFF_SECS")?;
        }

        if let Some(val) = lookup("GRIDJOBS_STEADY_SECS") {
            steady = Duration::from_secs(parse_env_value(&val, "GRIDJOBS_STEADY_SECS")?);
        }
        config.backoff = BackoffSchedule::new(warmup, steady);

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "project_id cannot be empty".to_string(),
            ));
        }

        if self.user.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "user cannot be empty".to_string(),
            ));
        }

        if self.backoff.steady().is_zero() {
            return Err(ConfigError::ValidationFailed(
                "steady polling interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the scheduler kind.
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Builder method to set the project id.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Builder method to set the job owner.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Builder method to enable or disable the record database.
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence = enabled;
        self
    }

    /// Builder method to set the record database directory.
    pub fn with_database_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.database_dir = dir.into();
        self
    }

    /// Builder method to keep the record database on shutdown.
    pub fn with_keep_database(mut self, keep: bool) -> Self {
        self.keep_database = keep;
        self
    }

    /// Builder method to set the polling schedule.
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse a comma-separated list of seconds. An empty value gives an empty list.
fn parse_secs_list(value: &str, key: &str) -> Result<Vec<Duration>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_env_value::<u64>(s, key).map(Duration::from_secs))
        .collect()
}
