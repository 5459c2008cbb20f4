use testgen::core::types::{ExecutionStatus, TestRunner};
use testgen::io::config::RunConfiguration;
use testgen::io::output_log::OutputLog;
use testgen::test_execution::{
    RunnerUsed, SKIP_EMPTY_COMMAND, SKIP_REJECTED_NO_SAFE_FALLBACK, TestExecutionOutcome,
    TestExecutionRequest, run_test_execution,
};
use testgen::test_support::{
    Script, ScriptedCommandRunner, ScriptedProvider, TaskRole, TestWorkspace,
    execution_json_output, file_write, log_events,
};

const REPORT_DIR: &str = "docs/test-execution-reports";

fn execute(
    ws: &TestWorkspace,
    config: &RunConfiguration,
    provider: &ScriptedProvider,
    runner: &ScriptedCommandRunner,
    log: &OutputLog,
) -> TestExecutionOutcome {
    run_test_execution(
        &TestExecutionRequest {
            run_id: "run-1",
            workspace_root: ws.root(),
            model: None,
        },
        config,
        provider,
        runner,
        log,
    )
}

fn report_text(ws: &TestWorkspace, outcome: &TestExecutionOutcome) -> String {
    let path = outcome.report_path.as_deref().expect("report saved");
    assert!(path.starts_with(ws.path(REPORT_DIR)));
    ws.read(path)
}

fn rejected_agent() -> ScriptedProvider {
    ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::logs(&execution_json_output(
            r#"{"version":1,"exitCode":null,"durationMs":0,"stdout":"","stderr":"Tool execution was rejected"}"#,
        )),
    )
}

#[test]
fn empty_command_is_skipped_with_report() {
    let ws = TestWorkspace::new();
    let config = RunConfiguration {
        test_command: "   ".to_string(),
        ..ws.config()
    };
    let provider = ScriptedProvider::new();
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &config, &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Skipped);
    assert_eq!(outcome.report.skip_reason.as_deref(), Some(SKIP_EMPTY_COMMAND));
    assert!(provider.requests().is_empty());
    assert!(runner.calls().is_empty());
    assert!(report_text(&ws, &outcome).contains("empty command"));
}

#[test]
fn delegated_json_result_is_reported() {
    let ws = TestWorkspace::new();
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::logs(&execution_json_output(
            r#"{"version":1,"exitCode":0,"durationMs":12,"stdout":"agent-stdout","stderr":""}"#,
        )),
    );
    let runner = ScriptedCommandRunner::exiting(9, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &ws.config(), &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.runner, RunnerUsed::Delegated);
    assert_eq!(outcome.report.exit_code, Some(0));
    assert_eq!(outcome.report.duration_ms, 12);
    let report = report_text(&ws, &outcome);
    assert!(report.contains("exitCode: 0"));
    assert!(report.contains("agent-stdout"));
    assert!(runner.calls().is_empty());

    let request = provider.request_for(TaskRole::TestAgent).expect("test agent request");
    assert_eq!(request.task_id, "run-1-test-agent");
    assert!(!request.allow_write);
    assert!(request.prompt.contains("npm test"));
}

#[test]
fn rejected_delegation_falls_back_to_internal_runner() {
    let ws = TestWorkspace::new();
    let provider = rejected_agent();
    let runner = ScriptedCommandRunner::exiting(0, "internal-stdout");
    let log = OutputLog::new();

    let outcome = execute(&ws, &ws.config(), &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.runner, RunnerUsed::DelegatedWithFallback);
    assert_eq!(outcome.report.exit_code, Some(0));
    assert_eq!(runner.calls().len(), 1);
    assert!(log.contains("looks rejected"));
    assert!(report_text(&ws, &outcome).contains("internal-stdout"));
}

#[test]
fn rejected_delegation_with_unsafe_command_is_skipped() {
    let ws = TestWorkspace::new();
    ws.write(
        "package.json",
        r#"{"scripts":{"test":"node ./out/test/runTest.js"}}"#,
    );
    let provider = rejected_agent();
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &ws.config(), &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Skipped);
    assert_eq!(
        outcome.report.skip_reason.as_deref(),
        Some(SKIP_REJECTED_NO_SAFE_FALLBACK)
    );
    assert!(runner.calls().is_empty());
    assert_eq!(outcome.report.resolved_exit_code(), None);
    assert!(report_text(&ws, &outcome).contains("no safe fallback"));
}

#[test]
fn allow_unsafe_command_permits_fallback() {
    let ws = TestWorkspace::new();
    ws.write(
        "package.json",
        r#"{"scripts":{"test":"node ./out/test/runTest.js"}}"#,
    );
    let config = RunConfiguration {
        allow_unsafe_command: true,
        ..ws.config()
    };
    let provider = rejected_agent();
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &config, &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn recursive_launch_only_warns() {
    let ws = TestWorkspace::new();
    let config = RunConfiguration {
        test_command: "node out/test/runTest.js".to_string(),
        test_execution_runner: TestRunner::Internal,
        ..ws.config()
    };
    let provider = ScriptedProvider::new();
    let runner = ScriptedCommandRunner::exiting(0, "ok");
    let log = OutputLog::new();

    let outcome = execute(&ws, &config, &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.runner, RunnerUsed::Internal);
    assert_eq!(outcome.report.warnings.len(), 1);
    assert!(log.contains("may launch the editor"));
    assert!(provider.requests().is_empty());
}

#[test]
fn unreadable_agent_output_uses_provider_exit_code() {
    let ws = TestWorkspace::new();
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::Complete {
            events: log_events("ran the suite\n3 failing"),
            exit_code: Some(3),
        },
    );
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &ws.config(), &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.exit_code, Some(3));
    assert!(outcome.report.stderr.contains("3 failing"));
    assert!(runner.calls().is_empty());
    assert!(log.contains("did not contain a readable result"));
}

#[test]
fn force_write_only_sets_allow_write() {
    let ws = TestWorkspace::new();
    let config = RunConfiguration {
        force_write_for_delegated_execution: true,
        ..ws.config()
    };
    let mut events = log_events(&execution_json_output(
        r#"{"version":1,"exitCode":0,"durationMs":3,"stdout":"ok","stderr":""}"#,
    ));
    events.push(file_write("src/generated.test.ts"));
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::Complete {
            events,
            exit_code: Some(0),
        },
    );
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &config, &provider, &runner, &log);

    let request = provider.request_for(TaskRole::TestAgent).expect("request");
    assert!(request.allow_write);
    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.file_writes.len(), 1);
    assert!(report_text(&ws, &outcome).contains("src/generated.test.ts"));
}

#[test]
fn test_agent_start_failure_is_reported() {
    let ws = TestWorkspace::new();
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::FailToStart("agent binary missing".to_string()),
    );
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &ws.config(), &provider, &runner, &log);

    assert_eq!(outcome.report.status, ExecutionStatus::Skipped);
    assert!(
        outcome
            .report
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("agent binary missing"))
    );
    assert!(outcome.report_path.is_some());
}

#[test]
fn test_agent_timeout_is_warned() {
    let ws = TestWorkspace::new();
    let config = RunConfiguration {
        test_execution_timeout_ms: 50,
        ..ws.config()
    };
    let provider = ScriptedProvider::new().with(
        TaskRole::TestAgent,
        Script::Hang {
            events: log_events("starting"),
        },
    );
    let runner = ScriptedCommandRunner::exiting(0, "");
    let log = OutputLog::new();

    let outcome = execute(&ws, &config, &provider, &runner, &log);

    assert_eq!(provider.disposed(), 1);
    assert!(log.contains("Test agent timed out after 50 ms"));
    assert_eq!(outcome.report.exit_code, None);
}

#[cfg(unix)]
#[test]
fn internal_runner_executes_real_command() {
    use testgen::io::command_runner::ShellCommandRunner;

    let ws = TestWorkspace::new();
    let config = RunConfiguration {
        test_command: "echo from-shell; exit 4".to_string(),
        test_execution_runner: TestRunner::Internal,
        ..ws.config()
    };
    let log = OutputLog::new();

    let outcome = run_test_execution(
        &TestExecutionRequest {
            run_id: "run-1",
            workspace_root: ws.root(),
            model: None,
        },
        &config,
        &ScriptedProvider::new(),
        &ShellCommandRunner,
        &log,
    );

    assert_eq!(outcome.report.status, ExecutionStatus::Executed);
    assert_eq!(outcome.report.exit_code, Some(4));
    assert!(outcome.report.stdout.contains("from-shell"));
}
