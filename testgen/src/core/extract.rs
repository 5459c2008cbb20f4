//! Recover a structured execution result from free-text agent output.
//!
//! Formats are tried in order: JSON marker block, legacy key/value block, then
//! an explicit [`ExtractionFailure`]. A result is never assembled from more
//! than one format.

use serde::Serialize;
use serde_json::Value;

use crate::core::markers::{
    EXECUTION_JSON_BEGIN, EXECUTION_JSON_END, EXECUTION_RESULT_BEGIN, EXECUTION_RESULT_END,
    STDERR_BEGIN, STDERR_END, STDOUT_BEGIN, STDOUT_END, find_block, find_block_span,
    strip_code_fence,
};

/// The only JSON result schema version understood today.
pub const RESULT_SCHEMA_VERSION: u64 = 1;

/// Error message attached to an [`ExtractionFailure`].
pub const NO_MARKERS_MESSAGE: &str = "no test execution result markers found in agent output";

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Json,
    Legacy,
    /// Reported directly by a local process; no markers involved.
    Process,
    None,
}

/// Structured test execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedExecutionResult {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    /// Effective duration (wall-clock substituted when the agent reported <= 0).
    pub duration_ms: u64,
    /// Duration exactly as the agent reported it (0 when absent or unparsable).
    pub reported_duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    pub source: ResultSource,
}

/// Neither marker format could be recovered.
///
/// This is a normal outcome: `result.stderr` carries the full raw log so the
/// caller can still report something useful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub result: ExtractedExecutionResult,
}

/// Inputs measured by the caller rather than reported by the agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractContext {
    /// The provider's own process/task exit code.
    pub fallback_exit_code: Option<i32>,
    /// Wall-clock duration measured around the agent task.
    pub measured_duration_ms: u64,
}

/// Extract an execution result from `raw_log`.
pub fn extract_execution_result(
    raw_log: &str,
    ctx: ExtractContext,
) -> Result<ExtractedExecutionResult, ExtractionFailure> {
    if let Some(result) = extract_json(raw_log, ctx) {
        return Ok(result);
    }
    if let Some(result) = extract_legacy(raw_log, ctx) {
        return Ok(result);
    }
    Err(ExtractionFailure {
        result: ExtractedExecutionResult {
            exit_code: ctx.fallback_exit_code,
            signal: None,
            duration_ms: ctx.measured_duration_ms,
            reported_duration_ms: 0,
            stdout: String::new(),
            stderr: raw_log.to_string(),
            error_message: Some(NO_MARKERS_MESSAGE.to_string()),
            source: ResultSource::None,
        },
    })
}

/// Parsed exit code field, distinguishing an explicit null from garbage.
enum ExitCodeField {
    Value(i32),
    ExplicitNull,
    Unusable,
}

impl ExitCodeField {
    fn resolve(self, fallback: Option<i32>) -> Option<i32> {
        match self {
            ExitCodeField::Value(code) => Some(code),
            ExitCodeField::ExplicitNull => None,
            ExitCodeField::Unusable => fallback,
        }
    }
}

fn extract_json(raw_log: &str, ctx: ExtractContext) -> Option<ExtractedExecutionResult> {
    let block = find_block(raw_log, EXECUTION_JSON_BEGIN, EXECUTION_JSON_END)?;
    let value: Value = serde_json::from_str(strip_code_fence(block)).ok()?;
    let obj = value.as_object()?;
    if obj.get("version").and_then(Value::as_u64) != Some(RESULT_SCHEMA_VERSION) {
        return None;
    }

    let exit_code = match obj.get("exitCode") {
        None => ExitCodeField::Unusable,
        Some(Value::Null) => ExitCodeField::ExplicitNull,
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map_or(ExitCodeField::Unusable, ExitCodeField::Value),
        Some(Value::String(s)) => parse_exit_code_text(s),
        Some(_) => ExitCodeField::Unusable,
    };

    let signal = match obj.get("signal") {
        Some(Value::String(s)) => non_null_text(s),
        _ => None,
    };

    let reported = match obj.get("durationMs") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    let reported_duration_ms = duration_from_f64(reported);
    let duration_ms = if reported_duration_ms == 0 {
        ctx.measured_duration_ms
    } else {
        reported_duration_ms
    };

    Some(ExtractedExecutionResult {
        exit_code: exit_code.resolve(ctx.fallback_exit_code),
        signal,
        duration_ms,
        reported_duration_ms,
        stdout: string_field(obj.get("stdout")),
        stderr: string_field(obj.get("stderr")),
        error_message: None,
        source: ResultSource::Json,
    })
}

fn extract_legacy(raw_log: &str, ctx: ExtractContext) -> Option<ExtractedExecutionResult> {
    let block = find_block(raw_log, EXECUTION_RESULT_BEGIN, EXECUTION_RESULT_END)?;

    let stdout = find_block(block, STDOUT_BEGIN, STDOUT_END)
        .map(trim_block_newlines)
        .unwrap_or_default();
    let stderr = find_block(block, STDERR_BEGIN, STDERR_END)
        .map(trim_block_newlines)
        .unwrap_or_default();

    let header = header_region(block);
    let mut exit_code = ExitCodeField::Unusable;
    let mut signal = None;
    let mut reported_duration_ms = 0;
    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "exitCode" => exit_code = parse_exit_code_text(value),
            "signal" => signal = non_null_text(value),
            "durationMs" => {
                reported_duration_ms = value
                    .trim()
                    .parse::<f64>()
                    .map(duration_from_f64)
                    .unwrap_or(0);
            }
            _ => {}
        }
    }

    Some(ExtractedExecutionResult {
        exit_code: exit_code.resolve(ctx.fallback_exit_code),
        signal,
        duration_ms: reported_duration_ms,
        reported_duration_ms,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        error_message: None,
        source: ResultSource::Legacy,
    })
}

/// Key/value lines live outside the nested stdout/stderr sub-blocks.
///
/// Sub-blocks are cut with the same last-begin rule as the stream text, and
/// repeatedly, so echoed copies never leak into the header.
fn header_region(block: &str) -> String {
    let mut region = block.to_string();
    for (begin, end) in [(STDOUT_BEGIN, STDOUT_END), (STDERR_BEGIN, STDERR_END)] {
        while let Some(span) = find_block_span(&region, begin, end) {
            region.replace_range(span, "");
        }
    }
    region
}

fn parse_exit_code_text(text: &str) -> ExitCodeField {
    let trimmed = text.trim().trim_matches('"');
    if trimmed == "null" {
        return ExitCodeField::ExplicitNull;
    }
    trimmed
        .parse::<i32>()
        .map_or(ExitCodeField::Unusable, ExitCodeField::Value)
}

fn non_null_text(text: &str) -> Option<String> {
    let trimmed = text.trim().trim_matches('"');
    if trimmed.is_empty() || trimmed == "null" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn string_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn duration_from_f64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

fn trim_block_newlines(text: &str) -> &str {
    let text = text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n')).unwrap_or(text);
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}
