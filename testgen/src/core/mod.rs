//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on agent output
//! text and in-memory values and return deterministic results suitable for tests.

pub mod command;
pub mod extract;
pub mod markers;
pub mod perspective;
pub mod rejection;
pub mod sanitize;
pub mod truncate;
pub mod types;
