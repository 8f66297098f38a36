//! Command-line interface for gridjobs.
//!
//! Provides commands to run a job manifest and to inspect kept job records.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
