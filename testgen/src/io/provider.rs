//! Agent provider abstraction and the per-task event channel.
//!
//! A provider starts a task and delivers [`AgentEvent`]s through an
//! `mpsc` channel owned by the requesting phase: zero or more `Log`/`FileWrite`
//! events, then exactly one `Completed`. [`run_task`] drains that channel,
//! optionally racing a timeout against completion.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Suffix for the perspective-generation sub-task id.
pub const PERSPECTIVE_TASK_SUFFIX: &str = "-perspectives";
/// Suffix for the delegated test-execution sub-task id.
pub const TEST_AGENT_TASK_SUFFIX: &str = "-test-agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A file the agent reported writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWrite {
    pub path: String,
    pub lines_created: Option<u64>,
    pub bytes_written: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Started,
    Log { level: LogLevel, message: String },
    FileWrite(FileWrite),
    Completed { exit_code: Option<i32> },
}

/// One agent sub-task.
#[derive(Debug, Clone)]
pub struct AgentTaskRequest {
    /// Unique per run; suffixes distinguish sub-task kinds.
    pub task_id: String,
    pub workspace_root: PathBuf,
    /// Agent CLI invocation.
    pub command: Vec<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub allow_write: bool,
}

/// Handle to a running task.
pub trait AgentTask {
    /// Stop the task. Safe to call after completion.
    fn dispose(&mut self) -> Result<()>;
}

/// Starts agent tasks.
pub trait AgentProvider {
    fn start(
        &self,
        request: &AgentTaskRequest,
        events: Sender<AgentEvent>,
    ) -> Result<Box<dyn AgentTask>>;
}

/// How a drained task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnd {
    Completed { exit_code: Option<i32> },
    /// The deadline passed first; the task was disposed.
    TimedOut,
    /// The provider dropped its sender without a `Completed` event.
    Disconnected,
}

impl TaskEnd {
    pub fn exit_code(self) -> Option<i32> {
        match self {
            TaskEnd::Completed { exit_code } => exit_code,
            TaskEnd::TimedOut | TaskEnd::Disconnected => None,
        }
    }
}

/// Everything observed while a task ran.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub end: TaskEnd,
    /// Log messages joined with newlines, in arrival order.
    pub log: String,
    pub file_writes: Vec<FileWrite>,
    pub elapsed: Duration,
}

/// Start `request` and drain its events until completion or `timeout`.
///
/// `on_event` sees every event as it arrives. On timeout the task is disposed
/// (disposal errors are logged, never returned) and anything it emits later is
/// discarded with the receiver.
#[instrument(skip_all, fields(task_id = %request.task_id, timeout_ms = timeout.map(|t| t.as_millis() as u64)))]
pub fn run_task<P, F>(
    provider: &P,
    request: &AgentTaskRequest,
    timeout: Option<Duration>,
    mut on_event: F,
) -> Result<TaskRun>
where
    P: AgentProvider + ?Sized,
    F: FnMut(&AgentEvent),
{
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);
    info!("starting agent task");
    let mut task = provider.start(request, tx)?;

    let mut log = String::new();
    let mut file_writes = Vec::new();
    let end = loop {
        let event = match next_event(&rx, deadline) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                warn!("agent task timed out, disposing");
                if let Err(err) = task.dispose() {
                    warn!(err = %err, "failed to dispose timed out task");
                }
                break TaskEnd::TimedOut;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("agent task closed its event stream without completing");
                break TaskEnd::Disconnected;
            }
        };
        on_event(&event);
        match event {
            AgentEvent::Started => debug!("agent task started"),
            AgentEvent::Log { message, .. } => {
                if !log.is_empty() {
                    log.push('\n');
                }
                log.push_str(&message);
            }
            AgentEvent::FileWrite(write) => file_writes.push(write),
            AgentEvent::Completed { exit_code } => break TaskEnd::Completed { exit_code },
        }
    };

    debug!(?end, "agent task finished");
    Ok(TaskRun {
        end,
        log,
        file_writes,
        elapsed: started.elapsed(),
    })
}

fn next_event(
    rx: &Receiver<AgentEvent>,
    deadline: Option<Instant>,
) -> Result<AgentEvent, RecvTimeoutError> {
    match deadline {
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return rx.try_recv().map_err(|err| match err {
                    mpsc::TryRecvError::Empty => RecvTimeoutError::Timeout,
                    mpsc::TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                });
            }
            rx.recv_timeout(remaining)
        }
    }
}
