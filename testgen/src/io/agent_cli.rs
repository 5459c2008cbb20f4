//! Provider that drives an agent CLI speaking line-delimited `stream-json`.
//!
//! The prompt goes to stdin. Stdout lines are mapped to [`AgentEvent`]s, stderr
//! lines become error logs, and process exit becomes `Completed`.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::io::process::{isolate_process_group, kill_process_tree};
use crate::io::provider::{
    AgentEvent, AgentProvider, AgentTask, AgentTaskRequest, FileWrite, LogLevel,
};

const OUTPUT_FORMAT: &str = "stream-json";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Spawns `request.command` with the agent's print-mode flags.
pub struct CliAgentProvider;

impl AgentProvider for CliAgentProvider {
    #[instrument(skip_all, fields(task_id = %request.task_id, allow_write = request.allow_write))]
    fn start(
        &self,
        request: &AgentTaskRequest,
        events: Sender<AgentEvent>,
    ) -> Result<Box<dyn AgentTask>> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("-p")
            .arg("--output-format")
            .arg(OUTPUT_FORMAT);
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if request.allow_write {
            cmd.arg("--force");
        }
        cmd.current_dir(&request.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        info!(program = %program, workdir = %request.workspace_root.display(), "spawning agent");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn agent");
                return Err(e).with_context(|| format!("spawn agent {program}"));
            }
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let prompt = request.prompt.clone();
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(prompt.as_bytes()) {
                warn!(err = %err, "failed to write agent prompt");
            }
        });

        let child = Arc::new(Mutex::new(child));
        let stderr_events = events.clone();
        let stderr_handle = thread::spawn(move || forward_stderr(stderr, &stderr_events));
        let waiter = Arc::clone(&child);
        thread::spawn(move || {
            forward_stdout(stdout, &events);
            if stderr_handle.join().is_err() {
                warn!("agent stderr reader panicked");
            }
            let exit_code = wait_for_exit(&waiter);
            debug!(?exit_code, "agent exited");
            // The receiver may already be gone after a timeout.
            let _ = events.send(AgentEvent::Completed { exit_code });
        });

        Ok(Box::new(CliAgentTask { child }))
    }
}

struct CliAgentTask {
    child: Arc<Mutex<Child>>,
}

impl AgentTask for CliAgentTask {
    fn dispose(&mut self) -> Result<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| anyhow!("agent process lock poisoned"))?;
        if child.try_wait().context("poll agent process")?.is_some() {
            return Ok(());
        }
        kill_process_tree(&mut child).context("kill agent process")
    }
}

fn wait_for_exit(child: &Arc<Mutex<Child>>) -> Option<i32> {
    loop {
        let polled = match child.lock() {
            Ok(mut guard) => guard.try_wait(),
            Err(_) => return None,
        };
        match polled {
            Ok(Some(status)) => return status.code(),
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(err) => {
                warn!(err = %err, "failed to poll agent process");
                return None;
            }
        }
    }
}

fn forward_stdout<R: Read>(reader: R, events: &Sender<AgentEvent>) {
    for line in BufReader::new(reader).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(err = %err, "failed to read agent stdout");
                break;
            }
        };
        if let Some(event) = parse_stream_line(&line)
            && events.send(event).is_err()
        {
            break;
        }
    }
}

fn forward_stderr<R: Read>(reader: R, events: &Sender<AgentEvent>) {
    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        let event = AgentEvent::Log {
            level: LogLevel::Error,
            message: line,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Map one `stream-json` line to an event. Non-JSON lines pass through as logs.
pub fn parse_stream_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Some(info_log(trimmed.to_string()));
    };

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match (kind, subtype) {
        ("system", "init") => Some(AgentEvent::Started),
        ("assistant", _) => {
            let text = assistant_text(&value);
            (!text.trim().is_empty()).then(|| info_log(text))
        }
        ("tool_call", "completed") => file_write(&value).map(AgentEvent::FileWrite),
        ("result", _) if value.get("is_error").and_then(Value::as_bool) == Some(true) => {
            let message = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("agent reported an error")
                .to_string();
            Some(AgentEvent::Log {
                level: LogLevel::Error,
                message,
            })
        }
        _ => None,
    }
}

fn info_log(message: String) -> AgentEvent {
    AgentEvent::Log {
        level: LogLevel::Info,
        message,
    }
}

fn assistant_text(value: &Value) -> String {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn file_write(value: &Value) -> Option<FileWrite> {
    let call = value.pointer("/tool_call/writeToolCall")?;
    let success = call.pointer("/result/success")?;
    let path = success
        .get("path")
        .or_else(|| call.pointer("/args/path"))
        .and_then(Value::as_str)?
        .to_string();
    Some(FileWrite {
        path,
        lines_created: success.get("linesCreated").and_then(Value::as_u64),
        bytes_written: success.get("fileSize").and_then(Value::as_u64),
    })
}
