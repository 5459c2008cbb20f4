use std::sync::mpsc::Sender;

use anyhow::Result;
use testgen::cancel::CancellationToken;
use testgen::core::markers::{PERSPECTIVES_BEGIN, PERSPECTIVES_END};
use testgen::core::perspective::{EMPTY_CASES_MESSAGE, ERROR_CASE_ID};
use testgen::core::types::{ExecutionStatus, RunLocation, RunMode};
use testgen::io::config::RunConfiguration;
use testgen::io::notify::NotificationAction;
use testgen::io::output_log::OutputLog;
use testgen::io::provider::{AgentEvent, AgentProvider, AgentTask, AgentTaskRequest};
use testgen::io::worktree::ApplyBackOutcome;
use testgen::perspective::{INJECTION_HEADER, PerspectiveStatus};
use testgen::run::{Collaborators, CompletedRun, Phase, RunOutcome, RunRequest, run_generation};
use testgen::test_support::{
    RecordingNotifier, Script, ScriptedCommandRunner, ScriptedIsolation, ScriptedProvider,
    TaskRole, TestWorkspace, execution_json_output, log_events, perspectives_json_output,
};

const PROMPT: &str = "Write unit tests for src/parser.ts";
const PERSPECTIVE_DIR: &str = "docs/test-perspectives";
const REPORT_DIR: &str = "docs/test-execution-reports";

struct Harness {
    ws: TestWorkspace,
    runner: ScriptedCommandRunner,
    isolation: ScriptedIsolation,
    notifier: RecordingNotifier,
    log: OutputLog,
}

impl Harness {
    fn new() -> Self {
        Self {
            ws: TestWorkspace::new(),
            runner: ScriptedCommandRunner::exiting(0, "internal-ok"),
            isolation: ScriptedIsolation::with_diff(""),
            notifier: RecordingNotifier::default(),
            log: OutputLog::new(),
        }
    }

    fn request(&self) -> RunRequest {
        RunRequest {
            run_id: "run-7".to_string(),
            workspace_root: self.ws.root().to_path_buf(),
            prompt: PROMPT.to_string(),
            model: None,
        }
    }

    fn run(
        &self,
        config: &RunConfiguration,
        provider: &dyn AgentProvider,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let deps = Collaborators {
            provider,
            command_runner: &self.runner,
            isolation: &self.isolation,
            notifier: &self.notifier,
            log: &self.log,
        };
        run_generation(&self.request(), config, &deps, cancel)
    }

    fn perspective_artifact(&self) -> String {
        let files = self.ws.files_in(PERSPECTIVE_DIR);
        assert_eq!(files.len(), 1, "one perspective artifact");
        self.ws.read(&files[0])
    }
}

fn completed(outcome: RunOutcome) -> Box<CompletedRun> {
    match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completed run, got {other:?}"),
    }
}

fn passing_test_agent() -> Script {
    Script::logs(&execution_json_output(
        r#"{"version":1,"exitCode":0,"durationMs":12,"stdout":"agent-stdout","stderr":""}"#,
    ))
}

fn valid_perspectives() -> Script {
    Script::logs(&perspectives_json_output(
        r#"{"version":1,"cases":[{"caseId":"TC-N-01","inputPrecondition":"valid input","perspective":"Equivalence - normal","expectedResult":"parses","notes":""}]}"#,
    ))
}

#[test]
fn full_run_injects_perspectives_and_reports() {
    let h = Harness::new();
    let provider = ScriptedProvider::new()
        .with(TaskRole::Perspectives, valid_perspectives())
        .with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&h.ws.config(), &provider, &CancellationToken::new()));

    let ids: Vec<String> = provider.requests().into_iter().map(|r| r.task_id).collect();
    assert_eq!(ids, ["run-7-perspectives", "run-7", "run-7-test-agent"]);

    let perspective_request = provider.request_for(TaskRole::Perspectives).expect("perspectives");
    assert!(!perspective_request.allow_write);
    let generation = provider.request_for(TaskRole::Generation).expect("generation");
    assert!(generation.allow_write);
    assert!(generation.prompt.starts_with(INJECTION_HEADER));
    assert!(generation.prompt.contains("TC-N-01"));
    assert!(generation.prompt.ends_with(PROMPT));

    assert!(h.perspective_artifact().contains("TC-N-01"));
    assert_eq!(run.exit_code(), Some(0));
    assert_eq!(h.ws.files_in(REPORT_DIR).len(), 1);
    let infos = h.notifier.infos();
    assert!(infos.last().is_some_and(|m| m.contains("exit code: 0")));
}

#[test]
fn perspective_timeout_continues_with_original_prompt() {
    let h = Harness::new();
    let config = RunConfiguration {
        perspective_timeout_ms: 50.0,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new()
        .with(
            TaskRole::Perspectives,
            Script::Hang {
                events: log_events("thinking about cases"),
            },
        )
        .with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    assert!(matches!(
        run.perspective.as_ref().map(|p| &p.status),
        Some(PerspectiveStatus::TimedOut { .. })
    ));
    assert_eq!(provider.disposed(), 1);
    let artifact = h.perspective_artifact();
    assert!(artifact.contains("timed out after 50 ms"));
    assert!(artifact.contains("thinking about cases"));
    let generation = provider.request_for(TaskRole::Generation).expect("generation");
    assert_eq!(generation.prompt, PROMPT);
}

#[test]
fn perspectives_finishing_after_the_timeout_are_ignored() {
    let h = Harness::new();
    let config = RunConfiguration {
        perspective_timeout_ms: 50.0,
        ..h.ws.config()
    };
    let late_table = perspectives_json_output(
        r#"{"version":1,"cases":[{"caseId":"TC-LATE-01","inputPrecondition":"x","perspective":"late","expectedResult":"y","notes":""}]}"#,
    );
    let provider = ScriptedProvider::new()
        .with(
            TaskRole::Perspectives,
            Script::FinishOnDispose {
                late: log_events(&late_table),
            },
        )
        .with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    let perspective = run.perspective.as_ref().expect("perspective outcome");
    assert!(matches!(perspective.status, PerspectiveStatus::TimedOut { .. }));
    assert!(!perspective.injected);
    assert!(!h.perspective_artifact().contains("TC-LATE-01"));
    let generation = provider.request_for(TaskRole::Generation).expect("generation");
    assert_eq!(generation.prompt, PROMPT);
}

#[test]
fn empty_perspective_cases_leave_prompt_untouched() {
    let h = Harness::new();
    let provider = ScriptedProvider::new().with(
        TaskRole::Perspectives,
        Script::logs(&perspectives_json_output(r#"{"version":1,"cases":[]}"#)),
    );

    let run = completed(h.run(&h.ws.config(), &provider, &CancellationToken::new()));

    let artifact = h.perspective_artifact();
    assert!(artifact.contains(ERROR_CASE_ID));
    assert!(artifact.contains(EMPTY_CASES_MESSAGE));
    assert!(!run.perspective.as_ref().is_some_and(|p| p.injected));
    let generation = provider.request_for(TaskRole::Generation).expect("generation");
    assert_eq!(generation.prompt, PROMPT);
}

#[test]
fn disabled_perspectives_skip_the_pipeline() {
    let h = Harness::new();
    let config = RunConfiguration {
        include_test_perspective_table: false,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new().with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    assert!(run.perspective.is_none());
    assert!(provider.request_for(TaskRole::Perspectives).is_none());
    assert!(h.ws.files_in(PERSPECTIVE_DIR).is_empty());
}

#[test]
fn perspective_only_run_stops_after_saving() {
    let h = Harness::new();
    let config = RunConfiguration {
        run_mode: RunMode::PerspectiveOnly,
        include_test_perspective_table: false,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new().with(TaskRole::Perspectives, valid_perspectives());

    let outcome = h.run(&config, &provider, &CancellationToken::new());

    assert!(matches!(&outcome, RunOutcome::PerspectiveOnly(p) if p.succeeded()));
    assert_eq!(testgen::exit_codes::for_outcome(&outcome), testgen::exit_codes::OK);
    assert_eq!(provider.requests().len(), 1);
    let infos = h.notifier.infos();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].contains("docs/test-perspectives/test-perspectives_"));
    assert!(h.notifier.warnings().is_empty());
}

#[test]
fn perspective_only_failure_warns() {
    let h = Harness::new();
    let config = RunConfiguration {
        run_mode: RunMode::PerspectiveOnly,
        ..h.ws.config()
    };
    let provider =
        ScriptedProvider::new().with(TaskRole::Perspectives, Script::logs("no table today"));

    let outcome = h.run(&config, &provider, &CancellationToken::new());

    assert_eq!(
        testgen::exit_codes::for_outcome(&outcome),
        testgen::exit_codes::PERSPECTIVE_FAILED
    );
    assert!(h.notifier.infos().is_empty());
    assert_eq!(h.notifier.warnings().len(), 1);
    assert!(h.perspective_artifact().contains(ERROR_CASE_ID));
}

#[test]
fn cancelled_before_start_does_nothing() {
    let h = Harness::new();
    let provider = ScriptedProvider::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.run(&h.ws.config(), &provider, &cancel);

    assert!(matches!(
        outcome,
        RunOutcome::Cancelled {
            phase: Phase::Perspectives
        }
    ));
    assert_eq!(
        testgen::exit_codes::for_outcome(&outcome),
        testgen::exit_codes::CANCELLED
    );
    assert!(provider.requests().is_empty());
    assert!(h.ws.files_in(PERSPECTIVE_DIR).is_empty());
    assert!(h.ws.files_in(REPORT_DIR).is_empty());
}

/// Cancels the run as soon as the main generation task starts.
struct CancelOnGeneration {
    inner: ScriptedProvider,
    cancel: CancellationToken,
}

impl AgentProvider for CancelOnGeneration {
    fn start(
        &self,
        request: &AgentTaskRequest,
        events: Sender<AgentEvent>,
    ) -> Result<Box<dyn AgentTask>> {
        if TaskRole::of(&request.task_id) == TaskRole::Generation {
            self.cancel.cancel();
        }
        self.inner.start(request, events)
    }
}

#[test]
fn cancellation_is_honoured_at_the_next_phase() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let provider = CancelOnGeneration {
        inner: ScriptedProvider::new().with(TaskRole::TestAgent, passing_test_agent()),
        cancel: cancel.clone(),
    };

    let outcome = h.run(&h.ws.config(), &provider, &cancel);

    assert!(matches!(
        outcome,
        RunOutcome::Cancelled {
            phase: Phase::Cleanup
        }
    ));
    assert!(provider.inner.request_for(TaskRole::TestAgent).is_none());
    assert!(h.ws.files_in(REPORT_DIR).is_empty());
}

#[test]
fn stray_perspective_files_are_cleaned_before_tests() {
    let h = Harness::new();
    let stray = h.ws.write(
        "test_perspectives_output.md",
        &format!("{PERSPECTIVES_BEGIN}\n| table |\n{PERSPECTIVES_END}\n"),
    );
    let unrelated = h.ws.write("test_perspectives_notes.md", "just notes");
    let provider = ScriptedProvider::new().with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&h.ws.config(), &provider, &CancellationToken::new()));

    assert!(!stray.exists());
    assert!(unrelated.exists());
    assert_eq!(run.cleanup.iter().filter(|c| c.deleted).count(), 1);
    assert!(h.log.contains("Removed stray file test_perspectives_output.md"));
}

#[test]
fn failing_tests_map_to_tests_failed() {
    let h = Harness::new();
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::logs(&execution_json_output(
            r#"{"version":1,"exitCode":1,"durationMs":40,"stdout":"1 failing","stderr":""}"#,
        )),
    );

    let outcome = h.run(&h.ws.config(), &provider, &CancellationToken::new());

    assert_eq!(
        testgen::exit_codes::for_outcome(&outcome),
        testgen::exit_codes::TESTS_FAILED
    );
}

#[test]
fn skipped_tests_report_null_exit_code() {
    let h = Harness::new();
    let config = RunConfiguration {
        test_command: String::new(),
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new();

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    assert_eq!(run.execution.report.status, ExecutionStatus::Skipped);
    assert_eq!(run.exit_code(), None);
    let infos = h.notifier.infos();
    assert!(infos.last().is_some_and(|m| m.contains("exit code: null")));
}

#[test]
fn generation_start_failure_still_produces_report() {
    let h = Harness::new();
    let provider = ScriptedProvider::new()
        .with(
            TaskRole::Generation,
            Script::FailToStart("spawn cursor-agent: not found".to_string()),
        )
        .with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&h.ws.config(), &provider, &CancellationToken::new()));

    assert!(run.generation.error.is_some());
    assert_eq!(h.notifier.warnings().len(), 1);
    assert_eq!(h.ws.files_in(REPORT_DIR).len(), 1);
}

#[test]
fn isolated_run_applies_changes_back() {
    let mut h = Harness::new();
    h.isolation = ScriptedIsolation::with_diff("diff --git a/x.test.ts b/x.test.ts\n");
    let config = RunConfiguration {
        run_location: RunLocation::IsolatedWorkspace,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new().with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    assert_eq!(run.apply_back, Some(ApplyBackOutcome::Applied));
    assert_eq!(h.isolation.released(), 1);
    let generation = provider.request_for(TaskRole::Generation).expect("generation");
    assert!(generation.workspace_root.ends_with(".isolated/run-7"));
    let test_agent = provider.request_for(TaskRole::TestAgent).expect("test agent");
    assert_eq!(test_agent.workspace_root, h.ws.root());
    assert_eq!(h.ws.files_in(PERSPECTIVE_DIR).len(), 1);
}

#[test]
fn failed_apply_back_offers_merge_prompt() {
    let mut h = Harness::new();
    h.isolation = ScriptedIsolation::failing_apply("diff --git a/x b/x\n", "patch does not apply");
    h.notifier = RecordingNotifier::choosing(NotificationAction::CopyMergePrompt);
    let config = RunConfiguration {
        run_location: RunLocation::IsolatedWorkspace,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new().with(TaskRole::TestAgent, passing_test_agent());

    let run = completed(h.run(&config, &provider, &CancellationToken::new()));

    assert!(matches!(run.apply_back, Some(ApplyBackOutcome::Fallback { .. })));
    let warnings = h.notifier.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].1,
        [
            NotificationAction::OpenInstructions,
            NotificationAction::CopyMergePrompt
        ]
    );
    let copied = h.notifier.copied();
    assert_eq!(copied.len(), 1);
    assert!(copied[0].contains("testgen-patch_"));
    assert_eq!(h.ws.files_in("docs/testgen-patches").len(), 2);
    assert_eq!(h.isolation.released(), 1);
    assert_eq!(run.exit_code(), Some(0));
}

#[test]
fn failed_acquisition_aborts_the_run() {
    let mut h = Harness::new();
    h.isolation = ScriptedIsolation::failing_acquire("not a git repository");
    let config = RunConfiguration {
        run_location: RunLocation::IsolatedWorkspace,
        ..h.ws.config()
    };
    let provider = ScriptedProvider::new();

    let outcome = h.run(&config, &provider, &CancellationToken::new());

    assert!(matches!(outcome, RunOutcome::Aborted { ref reason } if reason.contains("not a git repository")));
    assert!(provider.requests().is_empty());
    assert_eq!(h.notifier.warnings().len(), 1);
}
