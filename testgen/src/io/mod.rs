//! I/O helpers for orchestration phases.

pub mod agent_cli;
pub mod artifacts;
pub mod cleanup;
pub mod command_runner;
pub mod config;
pub mod git;
pub mod manifest;
pub mod notify;
pub mod output_log;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod worktree;
