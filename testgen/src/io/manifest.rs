//! Read the project manifest's test script for the recursive-launch heuristic.
//!
//! Every failure mode (missing file, invalid JSON, non-string field) resolves
//! to `None`.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

pub const MANIFEST_FILE_NAME: &str = "package.json";

/// The `scripts.test` value of `<workspace_root>/package.json`, if readable.
pub fn read_test_script(workspace_root: &Path) -> Option<String> {
    let path = workspace_root.join(MANIFEST_FILE_NAME);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %path.display(), err = %err, "manifest not readable");
            return None;
        }
    };
    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            debug!(path = %path.display(), err = %err, "manifest is not valid JSON");
            return None;
        }
    };
    value
        .pointer("/scripts/test")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_string_test_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(MANIFEST_FILE_NAME),
            r#"{"scripts":{"test":"node ./out/test/runTest.js"}}"#,
        )
        .expect("write");
        assert_eq!(
            read_test_script(temp.path()).as_deref(),
            Some("node ./out/test/runTest.js")
        );
    }

    #[test]
    fn tolerates_missing_invalid_and_non_string() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_test_script(temp.path()), None);

        fs::write(temp.path().join(MANIFEST_FILE_NAME), "{not json").expect("write");
        assert_eq!(read_test_script(temp.path()), None);

        fs::write(
            temp.path().join(MANIFEST_FILE_NAME),
            r#"{"scripts":{"test":["a","b"]}}"#,
        )
        .expect("write");
        assert_eq!(read_test_script(temp.path()), None);
    }
}
