//! Internal test runner: execute the test command as a local child process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::core::extract::{ExtractedExecutionResult, ResultSource};
use crate::io::process::{run_command_with_timeout, shell_command};

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Runs a shell command locally and reports its result directly (no markers).
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<ExtractedExecutionResult>;
}

pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &CommandRequest) -> Result<ExtractedExecutionResult> {
        let cmd = shell_command(&request.command, &request.workdir);
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)?;
        let error_message = output.timed_out.then(|| {
            warn!(timeout_ms = request.timeout.as_millis() as u64, "test command timed out");
            format!(
                "test command timed out after {} ms",
                request.timeout.as_millis()
            )
        });
        let duration_ms = output.elapsed.as_millis() as u64;
        Ok(ExtractedExecutionResult {
            exit_code: output.status.code(),
            signal: output.signal_name(),
            duration_ms,
            reported_duration_ms: duration_ms,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            error_message,
            source: ResultSource::Process,
        })
    }
}

/// Convenience for callers that only have a path and a command string.
pub fn command_request(
    command: &str,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> CommandRequest {
    CommandRequest {
        command: command.to_string(),
        workdir: workdir.to_path_buf(),
        timeout,
        output_limit_bytes,
    }
}
