//! Perspective pipeline: generate a test perspective table before test
//! generation, save it as an artifact, and inject it into the main prompt.
//!
//! The pipeline never fails the run. A timeout or an unusable agent answer
//! still produces an artifact (a failure table) and leaves the prompt as is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{info, instrument, warn};

use crate::core::perspective::{PerspectiveTable, extract_perspective_table, failure_table};
use crate::core::sanitize::sanitize;
use crate::core::truncate::truncate_chars;
use crate::io::artifacts::{
    PERSPECTIVE_REPORT_PREFIX, display_timestamp, file_timestamp, relative_display,
    write_artifact,
};
use crate::io::config::RunConfiguration;
use crate::io::notify::Notifier;
use crate::io::output_log::OutputLog;
use crate::io::prompt::PromptEngine;
use crate::io::provider::{
    AgentEvent, AgentProvider, AgentTaskRequest, LogLevel,
    PERSPECTIVE_TASK_SUFFIX, TaskEnd, run_task,
};
use crate::markdown::{details, fenced};

/// Raw logs embedded in a failure artifact are cut beyond this many characters.
pub const RAW_LOG_LIMIT_CHARS: usize = 200_000;

const RAW_LOG_ANCHOR: &str = "perspective-raw-log";

/// Placed before the table when it is injected into the generation prompt.
pub const INJECTION_HEADER: &str = "## Test perspective table (generated before test generation)\n\n\
Use the following table as the basis for the tests you write. Implement a test for every case, \
and keep case IDs in test names or comments so they can be traced back to this table.";

/// Shown in notices when no artifact path is available.
pub const NO_ARTIFACT_PLACEHOLDER: &str = "(none)";

/// Terminal state of the perspective phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerspectiveStatus {
    Completed(PerspectiveTable),
    TimedOut { timeout: Duration },
    ExtractFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct PerspectiveOutcome {
    pub status: PerspectiveStatus,
    /// Saved artifact, absent only when writing it failed.
    pub artifact_path: Option<PathBuf>,
    /// Prompt for the main generation task (injected or original).
    pub prompt: String,
    pub injected: bool,
}

impl PerspectiveOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, PerspectiveStatus::Completed(_))
    }
}

/// Inputs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PerspectiveRequest<'a> {
    pub run_id: &'a str,
    /// Where the agent works (the isolated copy in worktree mode).
    pub workspace_root: &'a Path,
    /// Where artifacts are saved (always the local workspace).
    pub artifact_root: &'a Path,
    /// The main generation prompt, also the perspective target description.
    pub prompt: &'a str,
    pub model: Option<&'a str>,
}

/// Run the perspective sub-task, save its artifact, and build the generation prompt.
#[instrument(skip_all, fields(run_id = request.run_id))]
pub fn run_perspective_pipeline<P: AgentProvider + ?Sized>(
    request: &PerspectiveRequest<'_>,
    config: &RunConfiguration,
    provider: &P,
    log: &OutputLog,
) -> PerspectiveOutcome {
    let task_id = format!("{}{}", request.run_id, PERSPECTIVE_TASK_SUFFIX);
    log.info(&format!("Generating test perspectives ({task_id})"));

    let (status, raw_log) = generate(request, config, provider, &task_id, log);

    let artifact = render_artifact(&task_id, &status, &raw_log);
    let dir = config.perspective_dir(request.artifact_root);
    let timestamp = file_timestamp(Local::now());
    let artifact_path =
        match write_artifact(&dir, PERSPECTIVE_REPORT_PREFIX, &timestamp, "md", &artifact) {
            Ok(path) => {
                log.info(&format!(
                    "Saved test perspectives: {}",
                    relative_display(request.artifact_root, &path)
                ));
                Some(path)
            }
            Err(err) => {
                log.error(&format!("Failed to save test perspectives: {err:#}"));
                None
            }
        };

    let (prompt, injected) = match &status {
        PerspectiveStatus::Completed(table) if !table.is_blank() => {
            (inject_table(&table.markdown, request.prompt), true)
        }
        _ => (request.prompt.to_string(), false),
    };
    if !injected {
        log.info("Continuing without a perspective table in the prompt");
    }

    PerspectiveOutcome {
        status,
        artifact_path,
        prompt,
        injected,
    }
}

fn generate<P: AgentProvider + ?Sized>(
    request: &PerspectiveRequest<'_>,
    config: &RunConfiguration,
    provider: &P,
    task_id: &str,
    log: &OutputLog,
) -> (PerspectiveStatus, String) {
    let prompt = match PromptEngine::new().render_perspectives(request.prompt) {
        Ok(prompt) => prompt,
        Err(err) => {
            let reason = format!("failed to render perspective prompt: {err:#}");
            log.error(&reason);
            return (PerspectiveStatus::ExtractFailed { reason }, String::new());
        }
    };
    let task = AgentTaskRequest {
        task_id: task_id.to_string(),
        workspace_root: request.workspace_root.to_path_buf(),
        command: config.agent.command.clone(),
        prompt,
        model: request.model.map(str::to_string),
        allow_write: false,
    };
    let timeout = config.perspective_timeout();

    let run = match run_task(provider, &task, timeout, |event| {
        if let AgentEvent::Log {
            level: LogLevel::Error,
            message,
        } = event
        {
            log.warn(&format!("[perspectives] {message}"));
        }
    }) {
        Ok(run) => run,
        Err(err) => {
            let reason = format!("failed to start perspective task: {err:#}");
            log.error(&reason);
            return (PerspectiveStatus::ExtractFailed { reason }, String::new());
        }
    };

    if run.end == TaskEnd::TimedOut {
        let timeout = timeout.unwrap_or_default();
        log.warn(&format!(
            "Perspective generation timed out after {} ms; continuing without it",
            timeout.as_millis()
        ));
        return (PerspectiveStatus::TimedOut { timeout }, run.log);
    }

    match extract_perspective_table(&run.log) {
        Ok(table) => {
            info!(cases = table.cases.len(), "extracted perspective table");
            (PerspectiveStatus::Completed(table), run.log)
        }
        Err(reason) => {
            warn!(reason = %reason, "perspective extraction failed");
            log.warn(&format!("Could not extract test perspectives: {reason}"));
            (PerspectiveStatus::ExtractFailed { reason }, run.log)
        }
    }
}

/// Prepend the fixed header and table to `original`, which is kept verbatim.
pub fn inject_table(table_markdown: &str, original: &str) -> String {
    format!("{INJECTION_HEADER}\n\n{}\n\n---\n\n{original}", table_markdown.trim())
}

fn render_artifact(task_id: &str, status: &PerspectiveStatus, raw_log: &str) -> String {
    let (label, table, note) = match status {
        PerspectiveStatus::Completed(table) => ("completed", table.clone(), None),
        PerspectiveStatus::TimedOut { timeout } => {
            let note = format!(
                "Perspective generation timed out after {} ms. The run continued without the table.",
                timeout.as_millis()
            );
            ("timed out", failure_table(&note, RAW_LOG_ANCHOR), Some(note))
        }
        PerspectiveStatus::ExtractFailed { reason } => (
            "extraction failed",
            failure_table(reason, RAW_LOG_ANCHOR),
            Some(reason.clone()),
        ),
    };

    let mut out = String::new();
    out.push_str("# Test Perspective Table\n\n");
    out.push_str(&format!("- Generated at: {}\n", display_timestamp(Local::now())));
    out.push_str(&format!("- Task: `{task_id}`\n"));
    out.push_str(&format!("- Status: {label}\n\n"));
    out.push_str(&table.markdown);
    out.push('\n');

    if let Some(note) = note {
        out.push_str(&format!("\n> {note}\n\n"));
        let sanitized = truncate_chars(&sanitize(raw_log), RAW_LOG_LIMIT_CHARS);
        let body = if sanitized.trim().is_empty() {
            "(the agent produced no output)".to_string()
        } else {
            fenced(&sanitized, "text")
        };
        out.push_str(&details(RAW_LOG_ANCHOR, "Raw agent log (sanitized)", &body));
        out.push('\n');
    }
    out
}

/// Notices shown when the run stops after perspectives.
pub fn notify_perspective_only(
    outcome: &PerspectiveOutcome,
    artifact_root: &Path,
    notifier: &dyn Notifier,
) {
    let shown = outcome
        .artifact_path
        .as_deref()
        .map(|path| relative_display(artifact_root, path))
        .filter(|shown| !shown.is_empty())
        .unwrap_or_else(|| NO_ARTIFACT_PLACEHOLDER.to_string());
    if outcome.succeeded() {
        notifier.info(&format!("Test perspective table saved: {shown}"));
    } else {
        notifier.warning(
            &format!("Test perspective table could not be generated. See {shown}"),
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::perspective::{ERROR_CASE_ID, PerspectiveCase};

    #[test]
    fn injection_keeps_original_prompt_verbatim() {
        let injected = inject_table("| table |", "  original\nprompt ");
        assert!(injected.starts_with(INJECTION_HEADER));
        assert!(injected.contains("| table |"));
        assert!(injected.ends_with("  original\nprompt "));
    }

    #[test]
    fn injection_with_empty_prompt() {
        let injected = inject_table("| table |", "");
        assert!(injected.ends_with("---\n\n"));
    }

    #[test]
    fn success_artifact_has_no_raw_log() {
        let table = PerspectiveTable::from_cases(vec![PerspectiveCase {
            case_id: "TC-N-01".to_string(),
            input_precondition: String::new(),
            perspective: String::new(),
            expected_result: String::new(),
            notes: String::new(),
        }]);
        let artifact = render_artifact("r-perspectives", &PerspectiveStatus::Completed(table), "raw");
        assert!(artifact.contains("TC-N-01"));
        assert!(!artifact.contains(RAW_LOG_ANCHOR));
    }

    #[test]
    fn failure_artifact_links_truncated_sanitized_log() {
        let raw = format!("\x1b[31m{}\x1b[0m", "x".repeat(RAW_LOG_LIMIT_CHARS + 10));
        let artifact = render_artifact(
            "r-perspectives",
            &PerspectiveStatus::ExtractFailed {
                reason: "bad".to_string(),
            },
            &raw,
        );
        assert!(artifact.contains(ERROR_CASE_ID));
        assert!(artifact.contains(&format!("(#{RAW_LOG_ANCHOR})")));
        assert!(artifact.contains(&format!("<details id=\"{RAW_LOG_ANCHOR}\">")));
        assert!(artifact.contains("(truncated 10 characters)"));
        assert!(!artifact.contains('\x1b'));
    }

    #[test]
    fn timeout_artifact_has_note() {
        let artifact = render_artifact(
            "r-perspectives",
            &PerspectiveStatus::TimedOut {
                timeout: Duration::from_millis(50),
            },
            "",
        );
        assert!(artifact.contains("timed out after 50 ms"));
        assert!(artifact.contains("(the agent produced no output)"));
    }
}
