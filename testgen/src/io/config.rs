//! Run configuration stored in `testgen.toml` at the workspace root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{RunLocation, RunMode, TestRunner};

/// Default configuration file name, relative to the workspace root.
pub const CONFIG_FILE_NAME: &str = "testgen.toml";

/// Immutable per-run settings.
///
/// Missing fields default to sensible values and unrecognized enum strings fall
/// back to their defaults. The struct is never mutated after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfiguration {
    /// Generate a perspective table before test generation.
    pub include_test_perspective_table: bool,

    /// Directory for perspective reports (relative paths resolve against the workspace root).
    pub perspective_report_dir: PathBuf,

    /// Directory for test execution reports.
    pub test_execution_report_dir: PathBuf,

    /// Shell command that runs the project's tests. Empty skips execution.
    pub test_command: String,

    pub test_execution_runner: TestRunner,

    /// Permit the local fallback even when the command looks like it launches the editor.
    pub allow_unsafe_command: bool,

    /// Let the delegated test-execution task write files.
    pub force_write_for_delegated_execution: bool,

    /// Perspective sub-task timeout. Non-positive or non-finite disables it.
    pub perspective_timeout_ms: f64,

    /// Wall-clock limit for running the test command (either runner).
    pub test_execution_timeout_ms: u64,

    pub run_mode: RunMode,

    pub run_location: RunLocation,

    /// Bound on captured stdout/stderr per stream for the internal runner.
    pub output_limit_bytes: usize,

    /// Where patches and merge instructions go when an isolated run cannot be applied.
    pub patch_dir: PathBuf,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI invocation (e.g. `["cursor-agent"]`).
    pub command: Vec<String>,
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["cursor-agent".to_string()],
            model: None,
        }
    }
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            include_test_perspective_table: true,
            perspective_report_dir: PathBuf::from("docs/test-perspectives"),
            test_execution_report_dir: PathBuf::from("docs/test-execution-reports"),
            test_command: "npm test".to_string(),
            test_execution_runner: TestRunner::Delegated,
            allow_unsafe_command: false,
            force_write_for_delegated_execution: false,
            perspective_timeout_ms: 600_000.0,
            test_execution_timeout_ms: 600_000,
            run_mode: RunMode::Full,
            run_location: RunLocation::Local,
            output_limit_bytes: 1_000_000,
            patch_dir: PathBuf::from("docs/testgen-patches"),
            agent: AgentConfig::default(),
        }
    }
}

impl RunConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.test_execution_timeout_ms == 0 {
            return Err(anyhow!("test_execution_timeout_ms must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Perspective timeout, or `None` when disabled.
    pub fn perspective_timeout(&self) -> Option<Duration> {
        let ms = self.perspective_timeout_ms;
        if ms.is_finite() && ms > 0.0 {
            Some(Duration::from_micros((ms * 1000.0).round() as u64))
        } else {
            None
        }
    }

    pub fn test_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.test_execution_timeout_ms)
    }

    /// Whether the perspective pipeline runs at all.
    pub fn wants_perspectives(&self) -> bool {
        self.include_test_perspective_table || self.run_mode == RunMode::PerspectiveOnly
    }

    pub fn perspective_dir(&self, workspace_root: &Path) -> PathBuf {
        resolve_dir(workspace_root, &self.perspective_report_dir)
    }

    pub fn execution_report_dir(&self, workspace_root: &Path) -> PathBuf {
        resolve_dir(workspace_root, &self.test_execution_report_dir)
    }

    pub fn patch_dir(&self, workspace_root: &Path) -> PathBuf {
        resolve_dir(workspace_root, &self.patch_dir)
    }
}

fn resolve_dir(workspace_root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        workspace_root.join(dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfiguration::default()`.
pub fn load_config(path: &Path) -> Result<RunConfiguration> {
    if !path.exists() {
        let cfg = RunConfiguration::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfiguration =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfiguration) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunConfiguration::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("testgen.toml");
        let cfg = RunConfiguration {
            run_mode: RunMode::PerspectiveOnly,
            test_execution_runner: TestRunner::Internal,
            ..RunConfiguration::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn tolerant_enum_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("testgen.toml");
        fs::write(
            &path,
            "run_mode = \"sideways\"\nrun_location = \"moon\"\ntest_execution_runner = \"extension\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.run_mode, RunMode::Full);
        assert_eq!(cfg.run_location, RunLocation::Local);
        assert_eq!(cfg.test_execution_runner, TestRunner::Internal);
    }

    #[test]
    fn perspective_timeout_disabled_for_non_positive_or_non_finite() {
        for ms in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let cfg = RunConfiguration {
                perspective_timeout_ms: ms,
                ..RunConfiguration::default()
            };
            assert_eq!(cfg.perspective_timeout(), None, "{ms}");
        }
        let cfg = RunConfiguration {
            perspective_timeout_ms: 50.0,
            ..RunConfiguration::default()
        };
        assert_eq!(cfg.perspective_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn perspective_only_implies_pipeline() {
        let cfg = RunConfiguration {
            include_test_perspective_table: false,
            run_mode: RunMode::PerspectiveOnly,
            ..RunConfiguration::default()
        };
        assert!(cfg.wants_perspectives());
        let cfg = RunConfiguration {
            include_test_perspective_table: false,
            ..RunConfiguration::default()
        };
        assert!(!cfg.wants_perspectives());
    }

    #[test]
    fn rejects_empty_agent_command() {
        let cfg = RunConfiguration {
            agent: AgentConfig {
                command: Vec::new(),
                model: None,
            },
            ..RunConfiguration::default()
        };
        assert!(cfg.validate().is_err());
    }
}
