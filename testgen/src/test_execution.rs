//! Test execution controller: run the configured test command, either
//! directly or through a constrained agent, and always write a report.
//!
//! Delegated execution falls back to the internal runner when the agent's
//! answer looks like a refusal, unless the command may re-launch the host
//! tool and unsafe commands are not allowed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::command::looks_like_recursive_launch;
use crate::core::extract::{
    ExtractContext, ExtractedExecutionResult, ResultSource, extract_execution_result,
};
use crate::core::rejection::rejection_reason;
use crate::core::sanitize::sanitize;
use crate::core::truncate::truncate_chars;
use crate::core::types::{ExecutionStatus, TestRunner};
use crate::io::artifacts::{
    EXECUTION_REPORT_PREFIX, display_timestamp, file_timestamp, relative_display, write_artifact,
};
use crate::io::command_runner::{CommandRunner, command_request};
use crate::io::config::RunConfiguration;
use crate::io::manifest::read_test_script;
use crate::io::output_log::OutputLog;
use crate::io::prompt::PromptEngine;
use crate::io::provider::{
    AgentProvider, AgentTaskRequest, FileWrite, TEST_AGENT_TASK_SUFFIX, TaskEnd,
    TaskRun, run_task,
};
use crate::markdown::{details, fenced};

pub const SKIP_EMPTY_COMMAND: &str = "empty command: no test command is configured";
pub const SKIP_REJECTED_NO_SAFE_FALLBACK: &str = "delegated execution was rejected, no safe fallback: \
     the command may re-launch the host tool and unsafe commands are not allowed";

/// Captured output embedded in a report is cut beyond this many characters.
pub const REPORT_OUTPUT_LIMIT_CHARS: usize = 200_000;

/// Which runners actually produced the reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunnerUsed {
    None,
    Internal,
    Delegated,
    /// The agent refused; the internal runner produced the result.
    DelegatedWithFallback,
}

impl RunnerUsed {
    pub fn describe(self) -> &'static str {
        match self {
            RunnerUsed::None => "none",
            RunnerUsed::Internal => "internal",
            RunnerUsed::Delegated => "delegated",
            RunnerUsed::DelegatedWithFallback => "delegated (fell back to internal)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub command: String,
    pub runner: RunnerUsed,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub skip_reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    /// Sanitized agent log (delegated) or process output (internal).
    pub sanitized_log: String,
    pub file_writes: Vec<FileWrite>,
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    fn skipped(command: &str, runner: RunnerUsed, reason: &str) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            command: command.to_string(),
            runner,
            exit_code: None,
            signal: None,
            duration_ms: 0,
            skip_reason: Some(reason.to_string()),
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            sanitized_log: String::new(),
            file_writes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn executed(command: &str, runner: RunnerUsed, result: &ExtractedExecutionResult) -> Self {
        Self {
            status: ExecutionStatus::Executed,
            command: command.to_string(),
            runner,
            exit_code: result.exit_code,
            signal: result.signal.clone(),
            duration_ms: result.duration_ms,
            skip_reason: None,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            error_message: result.error_message.clone(),
            sanitized_log: String::new(),
            file_writes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Exit code the run resolves to; absent when tests did not run.
    pub fn resolved_exit_code(&self) -> Option<i32> {
        match self.status {
            ExecutionStatus::Executed => self.exit_code,
            ExecutionStatus::Skipped => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestExecutionOutcome {
    pub report: ExecutionReport,
    /// Saved report, absent only when writing it failed.
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TestExecutionRequest<'a> {
    pub run_id: &'a str,
    /// Where tests run; the local workspace after any apply-back.
    pub workspace_root: &'a Path,
    pub model: Option<&'a str>,
}

/// Execute the configured tests and save a report. Never fails the run.
#[instrument(skip_all, fields(run_id = request.run_id, runner = config.test_execution_runner.as_str()))]
pub fn run_test_execution<P, R>(
    request: &TestExecutionRequest<'_>,
    config: &RunConfiguration,
    provider: &P,
    runner: &R,
    log: &OutputLog,
) -> TestExecutionOutcome
where
    P: AgentProvider + ?Sized,
    R: CommandRunner + ?Sized,
{
    let report = Controller {
        request,
        config,
        provider,
        runner,
        log,
    }
    .execute();
    log.info(&format!(
        "Test execution {}: {}",
        report.status.as_str(),
        match (&report.skip_reason, report.exit_code) {
            (Some(reason), _) => reason.clone(),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "no exit code".to_string(),
        }
    ));

    let dir = config.execution_report_dir(request.workspace_root);
    let timestamp = file_timestamp(Local::now());
    let report_path = match write_artifact(
        &dir,
        EXECUTION_REPORT_PREFIX,
        &timestamp,
        "md",
        &render_report(&report),
    ) {
        Ok(path) => {
            log.info(&format!(
                "Saved test execution report: {}",
                relative_display(request.workspace_root, &path)
            ));
            Some(path)
        }
        Err(err) => {
            log.error(&format!("Failed to save test execution report: {err:#}"));
            None
        }
    };
    TestExecutionOutcome {
        report,
        report_path,
    }
}

struct Controller<'a, P: ?Sized, R: ?Sized> {
    request: &'a TestExecutionRequest<'a>,
    config: &'a RunConfiguration,
    provider: &'a P,
    runner: &'a R,
    log: &'a OutputLog,
}

impl<P, R> Controller<'_, P, R>
where
    P: AgentProvider + ?Sized,
    R: CommandRunner + ?Sized,
{
    fn execute(&self) -> ExecutionReport {
        let command = self.config.test_command.trim();
        if command.is_empty() {
            self.log
                .warn("Skipping test execution: no test command is configured");
            return ExecutionReport::skipped(command, RunnerUsed::None, SKIP_EMPTY_COMMAND);
        }

        let mut warnings = Vec::new();
        let manifest_script = read_test_script(self.request.workspace_root);
        let recursive = looks_like_recursive_launch(command, manifest_script.as_deref());
        if recursive {
            let warning = format!(
                "Test command `{command}` may launch the editor or agent host; running it can \
                 start a second instance"
            );
            self.log.warn(&warning);
            warnings.push(warning);
        }

        let mut report = match self.config.test_execution_runner {
            TestRunner::Internal => self.run_internal(command, RunnerUsed::Internal),
            TestRunner::Delegated => self.run_delegated(command, recursive, &mut warnings),
        };
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        report
    }

    fn run_internal(&self, command: &str, used: RunnerUsed) -> ExecutionReport {
        let cmd = command_request(
            command,
            self.request.workspace_root,
            self.config.test_execution_timeout(),
            self.config.output_limit_bytes,
        );
        let result = self
            .runner
            .run(&cmd)
            .unwrap_or_else(|err| ExtractedExecutionResult {
                exit_code: None,
                signal: None,
                duration_ms: 0,
                reported_duration_ms: 0,
                stdout: String::new(),
                stderr: String::new(),
                error_message: Some(format!("failed to run test command: {err:#}")),
                source: ResultSource::None,
            });
        let mut report = ExecutionReport::executed(command, used, &result);
        report.sanitized_log = sanitize(&join_output(&result.stdout, &result.stderr));
        report
    }

    fn run_delegated(
        &self,
        command: &str,
        recursive: bool,
        warnings: &mut Vec<String>,
    ) -> ExecutionReport {
        let run = match self.start_test_agent(command) {
            Ok(run) => run,
            Err(err) => {
                let message = format!("failed to start test agent: {err:#}");
                self.log.error(&message);
                let mut report = ExecutionReport::skipped(command, RunnerUsed::Delegated, &message);
                report.error_message = Some(message);
                return report;
            }
        };
        if run.end == TaskEnd::TimedOut {
            let warning = format!(
                "Test agent timed out after {} ms",
                self.config.test_execution_timeout().as_millis()
            );
            self.log.warn(&warning);
            warnings.push(warning);
        }

        let extracted = extract_execution_result(
            &run.log,
            ExtractContext {
                fallback_exit_code: run.end.exit_code(),
                measured_duration_ms: duration_ms(run.elapsed),
            },
        );
        let result = extracted.unwrap_or_else(|failure| {
            self.log
                .warn("Test agent output did not contain a readable result");
            failure.result
        });

        let mut report = match rejection_reason(&result) {
            Some(reason) => {
                let warning = format!("Delegated test execution looks rejected ({reason:?})");
                self.log.warn(&warning);
                warnings.push(warning);
                if recursive && !self.config.allow_unsafe_command {
                    ExecutionReport::skipped(
                        command,
                        RunnerUsed::Delegated,
                        SKIP_REJECTED_NO_SAFE_FALLBACK,
                    )
                } else {
                    self.log.info("Falling back to the internal test runner");
                    self.run_internal(command, RunnerUsed::DelegatedWithFallback)
                }
            }
            None => {
                info!(exit_code = ?result.exit_code, source = ?result.source, "delegated execution finished");
                ExecutionReport::executed(command, RunnerUsed::Delegated, &result)
            }
        };
        report.sanitized_log = sanitize(&run.log);
        report.file_writes = run.file_writes;
        report
    }

    fn start_test_agent(&self, command: &str) -> anyhow::Result<TaskRun> {
        let prompt = PromptEngine::new().render_test_execution(command)?;
        let task = AgentTaskRequest {
            task_id: format!("{}{}", self.request.run_id, TEST_AGENT_TASK_SUFFIX),
            workspace_root: self.request.workspace_root.to_path_buf(),
            command: self.config.agent.command.clone(),
            prompt,
            model: self.request.model.map(str::to_string),
            allow_write: self.config.force_write_for_delegated_execution,
        };
        run_task(
            self.provider,
            &task,
            Some(self.config.test_execution_timeout()),
            |_| {},
        )
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// Markdown rendering of a report.
pub fn render_report(report: &ExecutionReport) -> String {
    let mut out = String::from("# Test Execution Report\n\n");
    out.push_str(&format!("- generatedAt: {}\n", display_timestamp(Local::now())));
    out.push_str(&format!("- command: `{}`\n", report.command));
    out.push_str(&format!("- runner: {}\n", report.runner.describe()));
    out.push_str(&format!("- status: {}\n", report.status.as_str()));
    out.push_str(&format!("- exitCode: {}\n", display_opt(report.exit_code)));
    out.push_str(&format!("- signal: {}\n", report.signal.as_deref().unwrap_or("-")));
    out.push_str(&format!("- durationMs: {}\n", report.duration_ms));
    if let Some(reason) = &report.skip_reason {
        out.push_str(&format!("- skipReason: {reason}\n"));
    }
    if let Some(message) = &report.error_message {
        out.push_str(&format!("- errorMessage: {message}\n"));
    }

    if !report.warnings.is_empty() {
        out.push_str("\n## Warnings\n\n");
        for warning in &report.warnings {
            out.push_str(&format!("- {warning}\n"));
        }
    }

    for (title, body) in [("stdout", &report.stdout), ("stderr", &report.stderr)] {
        out.push_str(&format!("\n## {title}\n\n"));
        if body.is_empty() {
            out.push_str("(empty)\n");
        } else {
            out.push_str(&fenced(&truncate_chars(body, REPORT_OUTPUT_LIMIT_CHARS), "text"));
            out.push('\n');
        }
    }

    if !report.file_writes.is_empty() {
        out.push_str("\n## Files written by the test agent\n\n");
        for write in &report.file_writes {
            out.push_str(&format!(
                "- `{}` ({} lines, {} bytes)\n",
                write.path,
                display_opt(write.lines_created),
                display_opt(write.bytes_written)
            ));
        }
    }

    if !report.sanitized_log.trim().is_empty() {
        out.push('\n');
        out.push_str(&details(
            "test-execution-log",
            "Log (sanitized)",
            &fenced(
                &truncate_chars(&report.sanitized_log, REPORT_OUTPUT_LIMIT_CHARS),
                "text",
            ),
        ));
        out.push('\n');
    }
    out
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
