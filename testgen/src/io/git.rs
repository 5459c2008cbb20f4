//! Git adapter for isolated-workspace runs.
//!
//! A small, explicit wrapper around `git` subprocess calls: worktree
//! management plus the diff/apply pair used to bring generated changes back.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Create a detached worktree of HEAD at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_add_detached(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        debug!("adding worktree");
        self.run_checked(&["worktree", "add", "--detach", &path, "HEAD"])?;
        Ok(())
    }

    /// Remove a worktree created by [`Git::worktree_add_detached`].
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        debug!("removing worktree");
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Binary-safe diff of the index against HEAD, as raw bytes.
    pub fn diff_cached_binary(&self) -> Result<Vec<u8>> {
        let output = self.run_checked(&["diff", "--cached", "--binary", "HEAD"])?;
        Ok(output.stdout)
    }

    /// Check that `patch` applies cleanly without touching the tree.
    pub fn apply_check(&self, patch: &Path) -> Result<()> {
        let patch = patch.to_string_lossy();
        self.run_checked(&["apply", "--check", "--whitespace=nowarn", &patch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn apply(&self, patch: &Path) -> Result<()> {
        let patch = patch.to_string_lossy();
        debug!("applying patch");
        self.run_checked(&["apply", "--whitespace=nowarn", &patch])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
