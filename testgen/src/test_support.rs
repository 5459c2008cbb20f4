//! Scripted collaborators and workspace helpers for tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::extract::{ExtractedExecutionResult, ResultSource};
use crate::io::command_runner::{CommandRequest, CommandRunner};
use crate::io::config::RunConfiguration;
use crate::io::notify::{NotificationAction, Notifier};
use crate::io::provider::{
    AgentEvent, AgentProvider, AgentTask, AgentTaskRequest, FileWrite, LogLevel,
    PERSPECTIVE_TASK_SUFFIX, TEST_AGENT_TASK_SUFFIX,
};
use crate::io::worktree::{IsolatedWorkspace, WorkspaceIsolation};

/// Which sub-task a request belongs to, derived from its task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskRole {
    Perspectives,
    TestAgent,
    Generation,
}

impl TaskRole {
    pub fn of(task_id: &str) -> Self {
        if task_id.ends_with(PERSPECTIVE_TASK_SUFFIX) {
            TaskRole::Perspectives
        } else if task_id.ends_with(TEST_AGENT_TASK_SUFFIX) {
            TaskRole::TestAgent
        } else {
            TaskRole::Generation
        }
    }
}

/// What a scripted task does once started.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit `events`, then `Completed`.
    Complete {
        events: Vec<AgentEvent>,
        exit_code: Option<i32>,
    },
    /// Emit `events` and never complete.
    Hang { events: Vec<AgentEvent> },
    /// Emit nothing until disposed, then emit `late` and `Completed`.
    FinishOnDispose { late: Vec<AgentEvent> },
    /// `start` itself fails.
    FailToStart(String),
}

impl Script {
    /// Complete with exit code 0 after logging `lines` (one event per line).
    pub fn logs(lines: &str) -> Self {
        Script::Complete {
            events: log_events(lines),
            exit_code: Some(0),
        }
    }
}

/// One info-level `Log` event per line of `text`.
pub fn log_events(text: &str) -> Vec<AgentEvent> {
    text.lines()
        .map(|line| AgentEvent::Log {
            level: LogLevel::Info,
            message: line.to_string(),
        })
        .collect()
}

pub fn file_write(path: &str) -> AgentEvent {
    AgentEvent::FileWrite(FileWrite {
        path: path.to_string(),
        lines_created: Some(1),
        bytes_written: None,
    })
}

/// Provider that plays back a [`Script`] per [`TaskRole`] and records requests.
///
/// Roles without a script complete immediately with no output.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: HashMap<TaskRole, Script>,
    requests: Mutex<Vec<AgentTaskRequest>>,
    disposed: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: TaskRole, script: Script) -> Self {
        self.scripts.insert(role, script);
        self
    }

    pub fn requests(&self) -> Vec<AgentTaskRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_for(&self, role: TaskRole) -> Option<AgentTaskRequest> {
        self.requests()
            .into_iter()
            .find(|request| TaskRole::of(&request.task_id) == role)
    }

    /// Number of tasks disposed so far.
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

struct ScriptedTask {
    events: Option<Sender<AgentEvent>>,
    on_dispose: Vec<AgentEvent>,
    disposed: Arc<AtomicUsize>,
}

impl AgentTask for ScriptedTask {
    fn dispose(&mut self) -> Result<()> {
        if let Some(events) = self.events.take() {
            for event in self.on_dispose.drain(..) {
                let _ = events.send(event);
            }
        }
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AgentProvider for ScriptedProvider {
    fn start(
        &self,
        request: &AgentTaskRequest,
        events: Sender<AgentEvent>,
    ) -> Result<Box<dyn AgentTask>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let script = self
            .scripts
            .get(&TaskRole::of(&request.task_id))
            .cloned()
            .unwrap_or(Script::Complete {
                events: Vec::new(),
                exit_code: Some(0),
            });
        let mut on_dispose = Vec::new();
        let keep_open = match script {
            Script::FailToStart(message) => return Err(anyhow!(message)),
            Script::Complete {
                events: scripted,
                exit_code,
            } => {
                let _ = events.send(AgentEvent::Started);
                for event in scripted {
                    let _ = events.send(event);
                }
                let _ = events.send(AgentEvent::Completed { exit_code });
                None
            }
            Script::Hang { events: scripted } => {
                let _ = events.send(AgentEvent::Started);
                for event in scripted {
                    let _ = events.send(event);
                }
                Some(events)
            }
            Script::FinishOnDispose { late } => {
                on_dispose = late;
                on_dispose.push(AgentEvent::Completed { exit_code: Some(0) });
                Some(events)
            }
        };
        Ok(Box::new(ScriptedTask {
            events: keep_open,
            on_dispose,
            disposed: Arc::clone(&self.disposed),
        }))
    }
}

/// Notifier that records everything and answers warnings with `choice`.
#[derive(Default)]
pub struct RecordingNotifier {
    pub choice: Option<NotificationAction>,
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<(String, Vec<NotificationAction>)>>,
    opened: Mutex<Vec<PathBuf>>,
    copied: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn choosing(choice: NotificationAction) -> Self {
        Self {
            choice: Some(choice),
            ..Self::default()
        }
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<(String, Vec<NotificationAction>)> {
        self.warnings.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn copied(&self) -> Vec<String> {
        self.copied.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, message: &str) {
        if let Ok(mut infos) = self.infos.lock() {
            infos.push(message.to_string());
        }
    }

    fn warning(&self, message: &str, actions: &[NotificationAction]) -> Option<NotificationAction> {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push((message.to_string(), actions.to_vec()));
        }
        self.choice.filter(|choice| actions.contains(choice))
    }

    fn open_path(&self, path: &Path) {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(path.to_path_buf());
        }
    }

    fn copy_text(&self, text: &str) {
        if let Ok(mut copied) = self.copied.lock() {
            copied.push(text.to_string());
        }
    }
}

/// Internal runner that returns a fixed result and records requests.
pub struct ScriptedCommandRunner {
    result: ExtractedExecutionResult,
    calls: Mutex<Vec<CommandRequest>>,
}

impl ScriptedCommandRunner {
    pub fn exiting(exit_code: i32, stdout: &str) -> Self {
        Self {
            result: ExtractedExecutionResult {
                exit_code: Some(exit_code),
                signal: None,
                duration_ms: 5,
                reported_duration_ms: 5,
                stdout: stdout.to_string(),
                stderr: String::new(),
                error_message: None,
                source: ResultSource::Process,
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<ExtractedExecutionResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        Ok(self.result.clone())
    }
}

/// Isolation double: acquires a directory next to the local root and
/// plays back a scripted diff / apply result.
pub struct ScriptedIsolation {
    pub acquire_error: Option<String>,
    pub diff: Vec<u8>,
    pub apply_error: Option<String>,
    released: AtomicUsize,
}

impl ScriptedIsolation {
    pub fn with_diff(diff: impl AsRef<[u8]>) -> Self {
        Self {
            acquire_error: None,
            diff: diff.as_ref().to_vec(),
            apply_error: None,
            released: AtomicUsize::new(0),
        }
    }

    pub fn failing_apply(diff: impl AsRef<[u8]>, error: &str) -> Self {
        Self {
            apply_error: Some(error.to_string()),
            ..Self::with_diff(diff)
        }
    }

    pub fn failing_acquire(error: &str) -> Self {
        Self {
            acquire_error: Some(error.to_string()),
            ..Self::with_diff("")
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl WorkspaceIsolation for ScriptedIsolation {
    fn acquire(&self, local_root: &Path, run_id: &str) -> Result<IsolatedWorkspace> {
        if let Some(error) = &self.acquire_error {
            return Err(anyhow!(error.clone()));
        }
        let root = local_root.join(".isolated").join(run_id);
        fs::create_dir_all(&root)?;
        Ok(IsolatedWorkspace {
            root,
            local_root: local_root.to_path_buf(),
        })
    }

    fn collect_diff(&self, _workspace: &IsolatedWorkspace) -> Result<Vec<u8>> {
        Ok(self.diff.clone())
    }

    fn apply_to_local(&self, _workspace: &IsolatedWorkspace, _patch: &[u8]) -> Result<()> {
        match &self.apply_error {
            Some(error) => Err(anyhow!(error.clone())),
            None => Ok(()),
        }
    }

    fn release(&self, _workspace: &IsolatedWorkspace) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Temporary workspace directory with file helpers.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read(&self, path: &Path) -> String {
        fs::read_to_string(path).expect("read file")
    }

    /// Files directly under `rel`, sorted by name.
    pub fn files_in(&self, rel: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.path(rel)) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        files
    }

    /// Defaults with short timeouts.
    pub fn config(&self) -> RunConfiguration {
        RunConfiguration {
            perspective_timeout_ms: 2_000.0,
            test_execution_timeout_ms: 2_000,
            ..RunConfiguration::default()
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent output carrying a JSON execution result block.
pub fn execution_json_output(json: &str) -> String {
    format!(
        "running tests\n{}\n{json}\n{}\n",
        crate::core::markers::EXECUTION_JSON_BEGIN,
        crate::core::markers::EXECUTION_JSON_END
    )
}

/// Agent output carrying a JSON perspective block.
pub fn perspectives_json_output(json: &str) -> String {
    format!(
        "thinking\n{}\n{json}\n{}\n",
        crate::core::markers::PERSPECTIVES_JSON_BEGIN,
        crate::core::markers::PERSPECTIVES_JSON_END
    )
}
