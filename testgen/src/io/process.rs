//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Stdout as text, with a trailing notice when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        lossy_with_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    /// Stderr as text, with a trailing notice when bytes were dropped.
    pub fn stderr_text(&self) -> String {
        lossy_with_notice(&self.stderr, self.stderr_truncated, "stderr")
    }

    /// Name of the terminating signal, if the process was killed by one.
    pub fn signal_name(&self) -> Option<String> {
        exit_signal(&self.status)
    }
}

fn lossy_with_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| match sig {
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}

/// Build a command that runs `command_line` through the platform shell.
pub fn shell_command(command_line: &str, workdir: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    };
    cmd.current_dir(workdir);
    cmd
}

/// How long pipes may stay open after the child is gone before the rest of
/// its process group is killed.
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// One captured pipe: the kept prefix plus how many bytes were dropped.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, bytes: &[u8], limit: usize) {
        let keep = limit.saturating_sub(self.kept.len()).min(bytes.len());
        self.kept.extend_from_slice(&bytes[..keep]);
        self.dropped += bytes.len() - keep;
    }
}

/// Drains one pipe on its own thread into a shared buffer, so whatever was
/// read so far survives even if the pipe never closes.
struct PipeReader {
    label: &'static str,
    buffer: Arc<Mutex<Captured>>,
    done: Receiver<io::Result<()>>,
    finished: bool,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize, label: &'static str) -> Self {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&buffer);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(pump(reader, limit, &sink));
        });
        Self {
            label,
            buffer,
            done,
            finished: false,
        }
    }

    /// Wait until EOF or `deadline`; returns whether the pipe reached EOF.
    fn wait_until(&mut self, deadline: Instant) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(remaining) {
            Ok(result) => {
                self.finished = true;
                result.with_context(|| format!("read {}", self.label))?;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("{} reader thread panicked", self.label))
            }
        }
    }

    fn take(&self) -> Captured {
        self.buffer
            .lock()
            .map(|mut captured| std::mem::take(&mut *captured))
            .unwrap_or_default()
    }
}

fn pump<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        match sink.lock() {
            Ok(mut captured) => captured.push(&chunk[..n], limit),
            Err(_) => return Ok(()),
        }
    }
}

/// Put the child in its own process group so a timeout can take down
/// everything it started, not just the shell.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Kill `child` and, on unix, every process in its group.
///
/// Expects the child to have been spawned after [`isolate_process_group`].
pub fn kill_process_tree(child: &mut Child) -> Result<()> {
    if kill_process_group(child.id()) {
        return Ok(());
    }
    child.kill().context("kill child process")
}

/// Send SIGKILL to process group `pgid`; false when that was not possible.
#[cfg(unix)]
fn kill_process_group(pgid: u32) -> bool {
    let group = format!("-{pgid}");
    match Command::new("kill")
        .args(["-KILL", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            debug!(pgid, ?status, "kill of process group failed");
            false
        }
        Err(err) => {
            warn!(pgid, err = %err, "failed to invoke kill");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> bool {
    false
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// The child gets its own process group. Both pipes are read on their own
/// threads while it runs, and at most `output_limit_bytes` per stream are
/// kept. On timeout the whole group is killed and `timed_out` is set. Pipes
/// still held open by leftover descendants after the child is gone get a
/// short grace period, then the group is killed and the output read so far
/// is returned.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;
    let pid = child.id();
    debug!(pid, "spawned child process");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = kill_process_tree(&mut child);
        return Err(anyhow!("child output was not piped"));
    };
    let mut stdout = PipeReader::spawn(stdout, output_limit_bytes, "stdout");
    let mut stderr = PipeReader::spawn(stderr, output_limit_bytes, "stderr");

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing process group");
            kill_process_tree(&mut child).context("kill timed out command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };
    let elapsed = started.elapsed();

    let grace = Instant::now() + PIPE_GRACE;
    let stdout_closed = stdout.wait_until(grace)?;
    let stderr_closed = stderr.wait_until(grace)?;
    if !(stdout_closed && stderr_closed) {
        warn!(pid, "descendants still hold output pipes, killing process group");
        kill_process_group(pid);
        let grace = Instant::now() + PIPE_GRACE;
        if !(stdout.wait_until(grace)? && stderr.wait_until(grace)?) {
            warn!(pid, "output pipes never closed; keeping partial output");
        }
    }

    let stdout = stdout.take();
    let stderr = stderr.take();
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output exceeded limit"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.kept,
        stderr: stderr.kept,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
        elapsed,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_streams() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("echo out; echo err 1>&2; exit 3", temp.path());
        let output =
            run_command_with_timeout(cmd, Duration::from_secs(10), 1000).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn bounds_captured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("printf 'abcdefghij'", temp.path());
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 4).expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("exec sleep 5", temp.path());
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(100), 100).expect("run");
        assert!(output.timed_out);
        assert_eq!(output.signal_name().as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("sleep 5; echo done", temp.path());
        let started = Instant::now();
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(200), 100).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(!output.stdout_text().contains("done"));
    }

    #[test]
    fn background_descendant_does_not_hold_up_a_finished_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("echo early; sleep 5 & exit 0", temp.path());
        let started = Instant::now();
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 100).expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.status.code(), Some(0));
        assert_eq!(output.stdout_text(), "early\n");
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }
}
