//! Remove stray perspective-table byproducts from the workspace root.
//!
//! A candidate is deleted only when it contains both a begin and an end
//! marker. Nothing here returns an error: failures are recorded per file.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::markers::{
    PERSPECTIVES_BEGIN, PERSPECTIVES_END, PERSPECTIVES_JSON_BEGIN, PERSPECTIVES_JSON_END,
};
use crate::io::artifacts::relative_display;

/// Glob patterns (relative to the workspace root) for unintended byproducts.
pub const STRAY_PATTERNS: &[&str] = &["test_perspectives*.md", "test_perspectives*.json"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub deleted: bool,
    pub relative_path: String,
    pub error_message: Option<String>,
}

/// Find and delete stray byproducts under `workspace_root`.
#[instrument(skip_all, fields(root = %workspace_root.display()))]
pub fn cleanup_stray_artifacts(workspace_root: &Path) -> Vec<CleanupOutcome> {
    let candidates = find_candidates(workspace_root);
    debug!(count = candidates.len(), "stray candidates");
    candidates
        .iter()
        .map(|path| cleanup_file(workspace_root, path))
        .collect()
}

fn find_candidates(workspace_root: &Path) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let escaped_root = glob::Pattern::escape(&workspace_root.to_string_lossy());
    for pattern in STRAY_PATTERNS {
        let full = format!("{escaped_root}/{pattern}");
        let paths = match glob::glob(&full) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(pattern = %full, err = %err, "invalid cleanup pattern");
                continue;
            }
        };
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => {
                    found.insert(path);
                }
                Ok(_) => {}
                Err(err) => warn!(err = %err, "unreadable cleanup candidate"),
            }
        }
    }
    found
}

/// Inspect one file and delete it when it carries a complete marker pair.
pub fn cleanup_file(workspace_root: &Path, path: &Path) -> CleanupOutcome {
    let relative_path = relative_display(workspace_root, path);
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return CleanupOutcome {
                deleted: false,
                relative_path,
                error_message: None,
            };
        }
        Err(err) => {
            warn!(path = %relative_path, err = %err, "failed to read cleanup candidate");
            return CleanupOutcome {
                deleted: false,
                relative_path,
                error_message: Some(format!("read failed: {err}")),
            };
        }
    };

    if !has_marker_pair(&content) {
        return CleanupOutcome {
            deleted: false,
            relative_path,
            error_message: None,
        };
    }

    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %relative_path, "deleted stray perspective artifact");
            CleanupOutcome {
                deleted: true,
                relative_path,
                error_message: None,
            }
        }
        Err(err) => {
            warn!(path = %relative_path, err = %err, "failed to delete stray artifact");
            CleanupOutcome {
                deleted: false,
                relative_path,
                error_message: Some(format!("delete failed: {err}")),
            }
        }
    }
}

fn has_marker_pair(content: &str) -> bool {
    let has_begin = content.contains(PERSPECTIVES_BEGIN) || content.contains(PERSPECTIVES_JSON_BEGIN);
    let has_end = content.contains(PERSPECTIVES_END) || content.contains(PERSPECTIVES_JSON_END);
    has_begin && has_end
}
