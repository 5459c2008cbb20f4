//! Notification surface consumed by an external UI.
//!
//! The orchestrator decides the message, its severity, and which actions to
//! offer. Rendering and the user's choice belong to the implementation.

use std::path::Path;

use tracing::{info, warn};

/// An action offered alongside a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    OpenInstructions,
    CopyMergePrompt,
}

impl NotificationAction {
    pub fn label(self) -> &'static str {
        match self {
            NotificationAction::OpenInstructions => "Open instructions",
            NotificationAction::CopyMergePrompt => "Copy merge prompt",
        }
    }
}

pub trait Notifier {
    fn info(&self, message: &str);

    /// Show a warning with up to two actions; returns the action the user picked.
    fn warning(&self, message: &str, actions: &[NotificationAction]) -> Option<NotificationAction>;

    /// Open a document for the user.
    fn open_path(&self, path: &Path) {
        info!(path = %path.display(), "open requested");
    }

    /// Place text on the user's clipboard.
    fn copy_text(&self, text: &str) {
        info!(bytes = text.len(), "copy requested");
    }
}

/// Prints notifications to stderr; never selects an action.
pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn info(&self, message: &str) {
        eprintln!("[info] {message}");
    }

    fn warning(&self, message: &str, actions: &[NotificationAction]) -> Option<NotificationAction> {
        warn!(message, "warning notification");
        eprintln!("[warning] {message}");
        for action in actions {
            eprintln!("  - {}", action.label());
        }
        None
    }

    fn open_path(&self, path: &Path) {
        eprintln!("[info] open {}", path.display());
    }

    fn copy_text(&self, text: &str) {
        eprintln!("{text}");
    }
}
