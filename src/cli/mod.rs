//! Command-line interface for binforge.
//!
//! Provides the `run` crawl command and the `verify-image` check.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, ImageArgs, RunArgs, VerifyImageArgs};
