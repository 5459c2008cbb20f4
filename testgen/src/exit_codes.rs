//! Stable exit codes for the `testgen` CLI.

use crate::core::types::ExecutionStatus;
use crate::run::RunOutcome;

/// Run finished and tests passed, were skipped, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid usage, configuration, or an I/O error outside a run.
pub const INVALID: i32 = 1;
/// Tests ran and exited non-zero (or without an exit code).
pub const TESTS_FAILED: i32 = 2;
/// Perspective-only run whose table could not be produced.
pub const PERSPECTIVE_FAILED: i32 = 3;
/// Cancelled by the user.
pub const CANCELLED: i32 = 130;

/// Map a run outcome to the process exit code.
pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Cancelled { .. } => CANCELLED,
        RunOutcome::Aborted { .. } => INVALID,
        RunOutcome::PerspectiveOnly(perspective) if perspective.succeeded() => OK,
        RunOutcome::PerspectiveOnly(_) => PERSPECTIVE_FAILED,
        RunOutcome::Completed(run) => match (run.execution.report.status, run.exit_code()) {
            (ExecutionStatus::Skipped, _) | (_, Some(0)) => OK,
            _ => TESTS_FAILED,
        },
    }
}
