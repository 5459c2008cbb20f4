//! Shared deterministic types for orchestration logic.
//!
//! Configuration unions are closed enums. Unrecognized strings at the boundary
//! map to the documented default instead of erroring.

use serde::{Deserialize, Serialize};

/// What a run produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunMode {
    /// Perspectives (optional), generation, cleanup, and test execution.
    #[default]
    Full,
    /// Stop after the perspective artifact is saved.
    PerspectiveOnly,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::PerspectiveOnly => "perspectiveOnly",
        }
    }
}

impl From<String> for RunMode {
    fn from(value: String) -> Self {
        match value.trim() {
            "perspectiveOnly" | "perspective_only" | "perspective-only" => RunMode::PerspectiveOnly,
            _ => RunMode::Full,
        }
    }
}

impl From<RunMode> for String {
    fn from(value: RunMode) -> Self {
        value.as_str().to_string()
    }
}

/// Where generation happens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunLocation {
    #[default]
    Local,
    /// A secondary git worktree, applied back to the local workspace afterwards.
    IsolatedWorkspace,
}

impl RunLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            RunLocation::Local => "local",
            RunLocation::IsolatedWorkspace => "worktree",
        }
    }
}

impl From<String> for RunLocation {
    fn from(value: String) -> Self {
        match value.trim() {
            "worktree" | "isolatedWorkspace" | "isolated_workspace" => {
                RunLocation::IsolatedWorkspace
            }
            _ => RunLocation::Local,
        }
    }
}

impl From<RunLocation> for String {
    fn from(value: RunLocation) -> Self {
        value.as_str().to_string()
    }
}

/// Which runner executes the configured test command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TestRunner {
    /// Run the command as a local child process.
    Internal,
    /// Ask the agent to run the command and report back through markers.
    #[default]
    Delegated,
}

impl TestRunner {
    pub fn as_str(self) -> &'static str {
        match self {
            TestRunner::Internal => "internal",
            TestRunner::Delegated => "delegated",
        }
    }
}

impl From<String> for TestRunner {
    fn from(value: String) -> Self {
        match value.trim() {
            "internal" | "extension" => TestRunner::Internal,
            _ => TestRunner::Delegated,
        }
    }
}

impl From<TestRunner> for String {
    fn from(value: TestRunner) -> Self {
        value.as_str().to_string()
    }
}

/// Final status recorded in an execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Executed => "executed",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}
