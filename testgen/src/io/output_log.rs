//! Append-only, human-readable run log.
//!
//! This is product output, unaffected by `RUST_LOG`. Lines are kept in memory
//! and optionally appended to a file as they are written.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::warn;

pub struct OutputLog {
    lines: Mutex<Vec<String>>,
    file: Option<PathBuf>,
}

impl OutputLog {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// Also append every line to `path`.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        Ok(Self {
            lines: Mutex::new(Vec::new()),
            file: Some(path.to_path_buf()),
        })
    }

    pub fn info(&self, message: &str) {
        self.append("info", message);
    }

    /// Warnings are mirrored to tracing.
    pub fn warn(&self, message: &str) {
        warn!(message, "run warning");
        self.append("warn", message);
    }

    pub fn error(&self, message: &str) {
        warn!(message, "run error");
        self.append("error", message);
    }

    /// Snapshot of all lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    fn append(&self, level: &str, message: &str) {
        let line = format!("[{}] [{level}] {message}", Local::now().format("%H:%M:%S"));
        if let Some(path) = &self.file
            && let Err(err) = append_line(path, &line)
        {
            warn!(err = %err, path = %path.display(), "failed to append output log");
        }
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))
}
