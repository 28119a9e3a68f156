//! Command-line interface for ackqueue.
//!
//! Provides commands for pushing, popping and acknowledging queue messages,
//! inspecting dead letters, scheduling delayed tasks and running listeners.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
