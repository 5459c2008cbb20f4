//! Isolated-workspace runs: acquire a secondary copy, then apply its changes
//! back to the local workspace or persist them for a manual merge.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::artifacts::{relative_display, write_artifact};
use crate::io::git::Git;

pub const PATCH_PREFIX: &str = "testgen-patch";
pub const MERGE_INSTRUCTIONS_PREFIX: &str = "testgen-merge-instructions";

/// A secondary copy of the project used for generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedWorkspace {
    pub root: PathBuf,
    pub local_root: PathBuf,
}

pub trait WorkspaceIsolation {
    fn acquire(&self, local_root: &Path, run_id: &str) -> Result<IsolatedWorkspace>;
    /// Everything generated in the isolated copy, as a patch against its base.
    /// Raw bytes; file contents need not be UTF-8.
    fn collect_diff(&self, workspace: &IsolatedWorkspace) -> Result<Vec<u8>>;
    /// Apply `patch` to the local workspace; must leave it untouched on failure.
    fn apply_to_local(&self, workspace: &IsolatedWorkspace, patch: &[u8]) -> Result<()>;
    fn release(&self, workspace: &IsolatedWorkspace) -> Result<()>;
}

/// `git worktree` backed isolation. Worktrees live under `base_dir`.
pub struct GitWorktreeIsolation {
    base_dir: PathBuf,
}

impl GitWorktreeIsolation {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Worktrees under the system temp directory.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("testgen-worktrees"))
    }
}

impl WorkspaceIsolation for GitWorktreeIsolation {
    #[instrument(skip_all, fields(run_id))]
    fn acquire(&self, local_root: &Path, run_id: &str) -> Result<IsolatedWorkspace> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create worktree dir {}", self.base_dir.display()))?;
        let root = self.base_dir.join(run_id);
        Git::new(local_root).worktree_add_detached(&root)?;
        info!(root = %root.display(), "acquired isolated workspace");
        Ok(IsolatedWorkspace {
            root,
            local_root: local_root.to_path_buf(),
        })
    }

    fn collect_diff(&self, workspace: &IsolatedWorkspace) -> Result<Vec<u8>> {
        let git = Git::new(&workspace.root);
        git.add_all()?;
        git.diff_cached_binary()
    }

    fn apply_to_local(&self, workspace: &IsolatedWorkspace, patch: &[u8]) -> Result<()> {
        let patch_path = workspace.root.with_extension("patch");
        fs::write(&patch_path, patch)
            .with_context(|| format!("write {}", patch_path.display()))?;
        let git = Git::new(&workspace.local_root);
        let applied = git.apply_check(&patch_path).and_then(|()| git.apply(&patch_path));
        if let Err(err) = fs::remove_file(&patch_path) {
            warn!(err = %err, path = %patch_path.display(), "failed to remove temp patch");
        }
        applied
    }

    fn release(&self, workspace: &IsolatedWorkspace) -> Result<()> {
        Git::new(&workspace.local_root).worktree_remove(&workspace.root)
    }
}

/// Result of bringing isolated changes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyBackOutcome {
    /// The isolated copy produced no changes.
    NoChanges,
    Applied,
    /// Automatic apply failed; the patch and merge instructions were saved.
    Fallback {
        patch_path: PathBuf,
        instructions_path: PathBuf,
        merge_prompt: String,
        reason: String,
    },
    /// Neither applying nor persisting the patch worked.
    Failed { reason: String },
}

/// Apply isolated changes to the local workspace, persisting a patch on failure.
#[instrument(skip_all, fields(root = %workspace.root.display()))]
pub fn apply_back<I: WorkspaceIsolation + ?Sized>(
    isolation: &I,
    workspace: &IsolatedWorkspace,
    patch_dir: &Path,
    timestamp: &str,
) -> ApplyBackOutcome {
    let patch = match isolation.collect_diff(workspace) {
        Ok(patch) => patch,
        Err(err) => {
            return ApplyBackOutcome::Failed {
                reason: format!("could not collect changes: {err:#}"),
            };
        }
    };
    if patch.iter().all(u8::is_ascii_whitespace) {
        return ApplyBackOutcome::NoChanges;
    }

    let reason = match isolation.apply_to_local(workspace, &patch) {
        Ok(()) => return ApplyBackOutcome::Applied,
        Err(err) => format!("{err:#}"),
    };
    warn!(reason = %reason, "apply-back failed, saving patch");

    match persist_fallback(workspace, patch_dir, timestamp, &patch, &reason) {
        Ok((patch_path, instructions_path, merge_prompt)) => ApplyBackOutcome::Fallback {
            patch_path,
            instructions_path,
            merge_prompt,
            reason,
        },
        Err(err) => ApplyBackOutcome::Failed {
            reason: format!("{reason}; saving patch also failed: {err:#}"),
        },
    }
}

fn persist_fallback(
    workspace: &IsolatedWorkspace,
    patch_dir: &Path,
    timestamp: &str,
    patch: &[u8],
    reason: &str,
) -> Result<(PathBuf, PathBuf, String)> {
    let patch_path = write_artifact(patch_dir, PATCH_PREFIX, timestamp, "patch", patch)?;
    let shown_patch = relative_display(&workspace.local_root, &patch_path);
    let merge_prompt = merge_prompt(&shown_patch);
    let instructions = merge_instructions(&shown_patch, reason, &merge_prompt);
    let instructions_path = write_artifact(
        patch_dir,
        MERGE_INSTRUCTIONS_PREFIX,
        timestamp,
        "md",
        &instructions,
    )?;
    Ok((patch_path, instructions_path, merge_prompt))
}

/// Prompt a user can hand to an agent to finish the merge.
pub fn merge_prompt(patch_path: &str) -> String {
    format!(
        "Apply the patch at `{patch_path}` to this workspace. It contains tests generated in an \
         isolated worktree that could not be applied automatically. Resolve any conflicts while \
         keeping both the existing code and the generated tests, then run the test suite."
    )
}

fn merge_instructions(patch_path: &str, reason: &str, merge_prompt: &str) -> String {
    format!(
        "# Manual merge required\n\n\
         Generated changes could not be applied to the local workspace automatically.\n\n\
         - Patch: `{patch_path}`\n\
         - Reason: {reason}\n\n\
         ## Apply manually\n\n\
         ```sh\n\
         git apply --3way {patch_path}\n\
         ```\n\n\
         ## Or ask the agent\n\n\
         ```text\n\
         {merge_prompt}\n\
         ```\n"
    )
}
