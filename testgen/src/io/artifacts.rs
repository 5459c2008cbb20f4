//! Timestamped report artifacts.
//!
//! File names sort lexicographically by recency. An artifact is written once
//! with `create_new` and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use tracing::debug;

pub const PERSPECTIVE_REPORT_PREFIX: &str = "test-perspectives";
pub const EXECUTION_REPORT_PREFIX: &str = "test-execution";

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Sortable timestamp used in artifact file names.
pub fn file_timestamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// Human-readable timestamp used inside artifacts.
pub fn display_timestamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f %:z").to_string()
}

pub fn artifact_file_name(prefix: &str, timestamp: &str, extension: &str) -> String {
    format!("{prefix}_{timestamp}.{extension}")
}

/// Write `contents` to `<dir>/<prefix>_<timestamp>.<extension>`.
///
/// A collision within the same millisecond gets a numeric suffix instead of
/// overwriting the earlier artifact.
pub fn write_artifact(
    dir: &Path,
    prefix: &str,
    timestamp: &str,
    extension: &str,
    contents: impl AsRef<[u8]>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create artifact dir {}", dir.display()))?;
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            artifact_file_name(prefix, timestamp, extension)
        } else {
            artifact_file_name(prefix, &format!("{timestamp}-{attempt}"), extension)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents.as_ref())
                    .with_context(|| format!("write {}", path.display()))?;
                debug!(path = %path.display(), "wrote artifact");
                return Ok(path);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", path.display()));
            }
        }
    }
    Err(anyhow!(
        "could not find a free artifact name for {prefix}_{timestamp} in {}",
        dir.display()
    ))
}

/// `path` relative to `root` with forward slashes, or the full path when outside `root`.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let shown = path.strip_prefix(root).unwrap_or(path);
    shown.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_sort_by_time() {
        let earlier = Local.with_ymd_and_hms(2025, 1, 9, 23, 59, 59).unwrap();
        let later = Local.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let a = artifact_file_name("test-execution", &file_timestamp(earlier), "md");
        let b = artifact_file_name("test-execution", &file_timestamp(later), "md");
        assert!(a < b);
        assert_eq!(a, "test-execution_20250109_235959_000.md");
    }

    #[test]
    fn collision_gets_suffix_and_keeps_original() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = write_artifact(temp.path(), "p", "t", "md", "one").expect("first");
        let second = write_artifact(temp.path(), "p", "t", "md", "two").expect("second");
        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(&first).expect("read"), "one");
        assert_eq!(fs::read_to_string(&second).expect("read"), "two");
        assert!(second.ends_with("p_t-1.md"));
    }

    #[test]
    fn relative_display_strips_root() {
        let root = Path::new("/work");
        assert_eq!(
            relative_display(root, Path::new("/work/docs/a.md")),
            "docs/a.md"
        );
        assert_eq!(relative_display(root, Path::new("/elsewhere/a.md")), "/elsewhere/a.md");
    }
}
