//! Detect silent agent refusals in an extracted execution result.

use crate::core::extract::ExtractedExecutionResult;

/// Phrases an agent emits when a command was refused.
pub const REJECTION_PHRASES: &[&str] = &[
    "Tool execution was rejected",
    "Command execution was rejected",
    "The user rejected this command",
    "実行が拒否されました",
    "コマンドの実行が拒否されました",
];

/// Phrases an agent emits when it is waiting for a human to approve a command.
pub const APPROVAL_REQUIRED_PHRASES: &[&str] = &[
    "requires manual approval",
    "Waiting for user approval",
    "承認が必要です",
];

/// Why a result was classified as rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    RejectionPhrase,
    SuspiciousEmptyResult,
    ApprovalRequired,
}

/// True when the result looks like the agent declined to run the command.
pub fn is_rejected(result: &ExtractedExecutionResult) -> bool {
    rejection_reason(result).is_some()
}

/// Classify a result; `None` means it looks genuine.
pub fn rejection_reason(result: &ExtractedExecutionResult) -> Option<RejectionReason> {
    if contains_any(result, REJECTION_PHRASES) {
        return Some(RejectionReason::RejectionPhrase);
    }
    if is_suspicious_empty(result) {
        return Some(RejectionReason::SuspiciousEmptyResult);
    }
    if contains_any(result, APPROVAL_REQUIRED_PHRASES) {
        return Some(RejectionReason::ApprovalRequired);
    }
    None
}

fn contains_any(result: &ExtractedExecutionResult, phrases: &[&str]) -> bool {
    let error_message = result.error_message.as_deref().unwrap_or_default();
    phrases
        .iter()
        .any(|phrase| result.stderr.contains(phrase) || error_message.contains(phrase))
}

/// Every field empty at once: nothing ran, yet the agent claims it reported.
fn is_suspicious_empty(result: &ExtractedExecutionResult) -> bool {
    result.exit_code.is_none()
        && result.reported_duration_ms == 0
        && result.signal.is_none()
        && result.stdout.trim().is_empty()
        && result.stderr.trim().is_empty()
        && result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .trim()
            .is_empty()
}
