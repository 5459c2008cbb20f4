//! Run orchestrator: sequence one test-generation run.
//!
//! Phases run strictly one after another:
//!
//! 1. isolated-workspace acquisition (worktree mode only)
//! 2. perspective pipeline
//! 3. main generation task
//! 4. apply-back of isolated changes (worktree mode only)
//! 5. stray-artifact cleanup
//! 6. test execution
//!
//! Cancellation is checked before each phase. No phase error escapes: every
//! failure is logged, optionally surfaced as a notification, and the run
//! degrades to whatever report it can still produce.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, instrument};

use crate::cancel::CancellationToken;
use crate::core::types::{RunLocation, RunMode};
use crate::io::artifacts::{file_timestamp, relative_display};
use crate::io::cleanup::{CleanupOutcome, cleanup_stray_artifacts};
use crate::io::command_runner::CommandRunner;
use crate::io::config::RunConfiguration;
use crate::io::notify::{NotificationAction, Notifier};
use crate::io::output_log::OutputLog;
use crate::io::provider::{
    AgentEvent, AgentProvider, AgentTaskRequest, FileWrite, LogLevel, TaskEnd,
    run_task,
};
use crate::io::worktree::{ApplyBackOutcome, IsolatedWorkspace, WorkspaceIsolation, apply_back};
use crate::perspective::{
    PerspectiveOutcome, PerspectiveRequest, notify_perspective_only, run_perspective_pipeline,
};
use crate::test_execution::{TestExecutionOutcome, TestExecutionRequest, run_test_execution};

/// Phase boundaries at which cancellation is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Isolation,
    Perspectives,
    Generation,
    ApplyBack,
    Cleanup,
    TestExecution,
}

/// What the run was asked to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    /// The user's local workspace.
    pub workspace_root: PathBuf,
    /// Main generation prompt.
    pub prompt: String,
    /// Overrides `[agent] model` when set.
    pub model: Option<String>,
}

impl RunRequest {
    /// Run id derived from the current local time.
    pub fn generated_run_id() -> String {
        format!("testgen-{}", file_timestamp(Local::now()))
    }
}

/// External collaborators for one run.
pub struct Collaborators<'a> {
    pub provider: &'a dyn AgentProvider,
    pub command_runner: &'a dyn CommandRunner,
    pub isolation: &'a dyn WorkspaceIsolation,
    pub notifier: &'a dyn Notifier,
    pub log: &'a OutputLog,
}

/// How the main generation task ended.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// `None` when the task could not be started.
    pub end: Option<TaskEnd>,
    pub file_writes: Vec<FileWrite>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub perspective: Option<PerspectiveOutcome>,
    pub generation: GenerationResult,
    pub apply_back: Option<ApplyBackOutcome>,
    pub cleanup: Vec<CleanupOutcome>,
    pub execution: TestExecutionOutcome,
}

impl CompletedRun {
    /// Exit code of the test run; `None` when test execution was skipped.
    pub fn exit_code(&self) -> Option<i32> {
        self.execution.report.resolved_exit_code()
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Cancelled before `phase` started.
    Cancelled { phase: Phase },
    /// The isolated workspace could not be acquired; nothing was generated.
    Aborted { reason: String },
    /// Perspective-only mode stops after the pipeline.
    PerspectiveOnly(PerspectiveOutcome),
    Completed(Box<CompletedRun>),
}

/// Run one generation end to end.
#[instrument(skip_all, fields(run_id = %request.run_id, root = %request.workspace_root.display()))]
pub fn run_generation(
    request: &RunRequest,
    config: &RunConfiguration,
    deps: &Collaborators<'_>,
    cancel: &CancellationToken,
) -> RunOutcome {
    let log = deps.log;
    let local_root = request.workspace_root.as_path();
    let model = request.model.as_deref().or(config.agent.model.as_deref());
    log.info(&format!(
        "Starting test generation run {} ({}, {})",
        request.run_id,
        config.run_mode.as_str(),
        config.run_location.as_str()
    ));

    if config.run_mode == RunMode::PerspectiveOnly {
        if let Some(outcome) = check_cancel(cancel, Phase::Perspectives, log) {
            return outcome;
        }
        let perspective = run_perspective_pipeline(
            &PerspectiveRequest {
                run_id: &request.run_id,
                workspace_root: local_root,
                artifact_root: local_root,
                prompt: &request.prompt,
                model,
            },
            config,
            deps.provider,
            log,
        );
        notify_perspective_only(&perspective, local_root, deps.notifier);
        return RunOutcome::PerspectiveOnly(perspective);
    }

    let mut isolated = None;
    if config.run_location == RunLocation::IsolatedWorkspace {
        if let Some(outcome) = check_cancel(cancel, Phase::Isolation, log) {
            return outcome;
        }
        match deps.isolation.acquire(local_root, &request.run_id) {
            Ok(workspace) => {
                log.info(&format!(
                    "Generating in isolated workspace {}",
                    workspace.root.display()
                ));
                isolated = Some(workspace);
            }
            Err(err) => {
                let reason = format!("could not create an isolated workspace: {err:#}");
                log.error(&reason);
                deps.notifier
                    .warning(&format!("Test generation aborted: {reason}"), &[]);
                return RunOutcome::Aborted { reason };
            }
        }
    }
    let generation_root = isolated.as_ref().map_or(local_root, |ws| ws.root.as_path());

    let outcome = generate_and_apply(
        request,
        config,
        deps,
        cancel,
        generation_root,
        model,
        isolated.as_ref(),
    );
    if let Some(workspace) = &isolated {
        release(deps, workspace);
    }
    let (perspective, generation, apply_back) = match outcome {
        Ok(parts) => parts,
        Err(cancelled) => return cancelled,
    };

    if let Some(outcome) = check_cancel(cancel, Phase::Cleanup, log) {
        return outcome;
    }
    let cleanup = run_cleanup(local_root, log);

    if let Some(outcome) = check_cancel(cancel, Phase::TestExecution, log) {
        return outcome;
    }
    let execution = run_test_execution(
        &TestExecutionRequest {
            run_id: &request.run_id,
            workspace_root: local_root,
            model,
        },
        config,
        deps.provider,
        deps.command_runner,
        log,
    );

    let completed = CompletedRun {
        perspective,
        generation,
        apply_back,
        cleanup,
        execution,
    };
    let shown_code = completed
        .exit_code()
        .map_or_else(|| "null".to_string(), |code| code.to_string());
    let report = completed
        .execution
        .report_path
        .as_deref()
        .map(|path| relative_display(local_root, path))
        .unwrap_or_else(|| "(none)".to_string());
    log.info(&format!("Run {} finished with exit code {shown_code}", request.run_id));
    deps.notifier.info(&format!(
        "Test generation finished (exit code: {shown_code}). Report: {report}"
    ));
    RunOutcome::Completed(Box::new(completed))
}

type GenerationParts = (
    Option<PerspectiveOutcome>,
    GenerationResult,
    Option<ApplyBackOutcome>,
);

/// Perspectives, generation, and apply-back. The isolated workspace (if any)
/// is released by the caller regardless of how this returns.
fn generate_and_apply(
    request: &RunRequest,
    config: &RunConfiguration,
    deps: &Collaborators<'_>,
    cancel: &CancellationToken,
    generation_root: &Path,
    model: Option<&str>,
    isolated: Option<&IsolatedWorkspace>,
) -> Result<GenerationParts, RunOutcome> {
    let log = deps.log;
    let local_root = request.workspace_root.as_path();

    let mut prompt = request.prompt.clone();
    let mut perspective = None;
    if config.wants_perspectives() {
        if let Some(outcome) = check_cancel(cancel, Phase::Perspectives, log) {
            return Err(outcome);
        }
        let outcome = run_perspective_pipeline(
            &PerspectiveRequest {
                run_id: &request.run_id,
                workspace_root: generation_root,
                artifact_root: local_root,
                prompt: &request.prompt,
                model,
            },
            config,
            deps.provider,
            log,
        );
        prompt.clone_from(&outcome.prompt);
        perspective = Some(outcome);
    }

    if let Some(outcome) = check_cancel(cancel, Phase::Generation, log) {
        return Err(outcome);
    }
    let generation = run_main_generation(request, config, deps, generation_root, model, prompt);

    let mut applied = None;
    if let Some(workspace) = isolated {
        if let Some(outcome) = check_cancel(cancel, Phase::ApplyBack, log) {
            return Err(outcome);
        }
        let timestamp = file_timestamp(Local::now());
        let outcome = apply_back(
            deps.isolation,
            workspace,
            &config.patch_dir(local_root),
            &timestamp,
        );
        report_apply_back(&outcome, local_root, deps);
        applied = Some(outcome);
    }
    Ok((perspective, generation, applied))
}

fn run_main_generation(
    request: &RunRequest,
    config: &RunConfiguration,
    deps: &Collaborators<'_>,
    generation_root: &Path,
    model: Option<&str>,
    prompt: String,
) -> GenerationResult {
    let log = deps.log;
    let task = AgentTaskRequest {
        task_id: request.run_id.clone(),
        workspace_root: generation_root.to_path_buf(),
        command: config.agent.command.clone(),
        prompt,
        model: model.map(str::to_string),
        allow_write: true,
    };
    log.info("Generating tests");
    let result = run_task(deps.provider, &task, None, |event| match event {
        AgentEvent::Log {
            level: LogLevel::Error,
            message,
        } => log.warn(message),
        AgentEvent::FileWrite(write) => log.info(&format!("Wrote {}", write.path)),
        AgentEvent::Started | AgentEvent::Log { .. } | AgentEvent::Completed { .. } => {}
    });
    match result {
        Ok(run) => {
            match run.end {
                TaskEnd::Completed { exit_code } => log.info(&format!(
                    "Test generation task completed (exit code {})",
                    exit_code.map_or_else(|| "null".to_string(), |c| c.to_string())
                )),
                TaskEnd::TimedOut | TaskEnd::Disconnected => {
                    log.warn("Test generation task ended without a completion event");
                }
            }
            GenerationResult {
                end: Some(run.end),
                file_writes: run.file_writes,
                error: None,
            }
        }
        Err(err) => {
            let message = format!("Test generation task failed to start: {err:#}");
            log.error(&message);
            deps.notifier.warning(&message, &[]);
            GenerationResult {
                end: None,
                file_writes: Vec::new(),
                error: Some(message),
            }
        }
    }
}

fn report_apply_back(outcome: &ApplyBackOutcome, local_root: &Path, deps: &Collaborators<'_>) {
    let log = deps.log;
    match outcome {
        ApplyBackOutcome::NoChanges => log.info("Isolated workspace produced no changes"),
        ApplyBackOutcome::Applied => log.info("Applied generated changes to the local workspace"),
        ApplyBackOutcome::Fallback {
            patch_path,
            instructions_path,
            merge_prompt,
            reason,
        } => {
            log.warn(&format!("Automatic apply failed: {reason}"));
            let message = format!(
                "Generated changes could not be applied automatically. The patch was saved to {}.",
                relative_display(local_root, patch_path)
            );
            let choice = deps.notifier.warning(
                &message,
                &[
                    NotificationAction::OpenInstructions,
                    NotificationAction::CopyMergePrompt,
                ],
            );
            match choice {
                Some(NotificationAction::OpenInstructions) => {
                    deps.notifier.open_path(instructions_path);
                }
                Some(NotificationAction::CopyMergePrompt) => deps.notifier.copy_text(merge_prompt),
                None => {}
            }
        }
        ApplyBackOutcome::Failed { reason } => {
            log.error(&format!("Could not bring generated changes back: {reason}"));
            deps.notifier.warning(
                &format!("Generated changes could not be applied or saved: {reason}"),
                &[],
            );
        }
    }
}

fn release(deps: &Collaborators<'_>, workspace: &IsolatedWorkspace) {
    if let Err(err) = deps.isolation.release(workspace) {
        deps.log.warn(&format!(
            "Failed to remove isolated workspace {}: {err:#}",
            workspace.root.display()
        ));
    }
}

fn run_cleanup(local_root: &Path, log: &OutputLog) -> Vec<CleanupOutcome> {
    let outcomes = cleanup_stray_artifacts(local_root);
    for outcome in &outcomes {
        match (&outcome.error_message, outcome.deleted) {
            (Some(err), _) => log.warn(&format!(
                "Could not clean up {}: {err}",
                outcome.relative_path
            )),
            (None, true) => log.info(&format!("Removed stray file {}", outcome.relative_path)),
            (None, false) => {}
        }
    }
    outcomes
}

fn check_cancel(cancel: &CancellationToken, phase: Phase, log: &OutputLog) -> Option<RunOutcome> {
    if !cancel.is_cancelled() {
        return None;
    }
    info!(?phase, "run cancelled");
    log.info(&format!("Run cancelled before {phase:?}"));
    Some(RunOutcome::Cancelled { phase })
}
