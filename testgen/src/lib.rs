//! Agent-driven test generation with resilient output interpretation.
//!
//! A run asks an external coding agent to derive a test perspective table,
//! generate tests, and execute them, then leaves timestamped reports behind
//! even when the agent misbehaves. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure logic over agent output (marker extraction, rejection
//!   classification, sanitizing, perspective tables). No I/O.
//! - **[`io`]**: Side effects (configuration, processes, the agent provider,
//!   artifacts, git worktrees, notifications).
//!
//! Orchestration modules ([`perspective`], [`test_execution`], [`run`]) combine
//! the two into the phases of a run.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
mod markdown;
pub mod perspective;
pub mod run;
pub mod test_execution;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
