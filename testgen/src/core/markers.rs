//! Marker vocabulary shared with the agent.
//!
//! These strings are embedded in prompts and must round-trip exactly through
//! agent output.

use std::ops::Range;

pub const EXECUTION_JSON_BEGIN: &str = "<!-- BEGIN TEST EXECUTION JSON -->";
pub const EXECUTION_JSON_END: &str = "<!-- END TEST EXECUTION JSON -->";

pub const EXECUTION_RESULT_BEGIN: &str = "<!-- BEGIN TEST EXECUTION RESULT -->";
pub const EXECUTION_RESULT_END: &str = "<!-- END TEST EXECUTION RESULT -->";

pub const STDOUT_BEGIN: &str = "<!-- BEGIN STDOUT -->";
pub const STDOUT_END: &str = "<!-- END STDOUT -->";
pub const STDERR_BEGIN: &str = "<!-- BEGIN STDERR -->";
pub const STDERR_END: &str = "<!-- END STDERR -->";

pub const PERSPECTIVES_JSON_BEGIN: &str = "<!-- BEGIN TEST PERSPECTIVES JSON -->";
pub const PERSPECTIVES_JSON_END: &str = "<!-- END TEST PERSPECTIVES JSON -->";

pub const PERSPECTIVES_BEGIN: &str = "<!-- BEGIN TEST PERSPECTIVES -->";
pub const PERSPECTIVES_END: &str = "<!-- END TEST PERSPECTIVES -->";

/// Return the text between the last `begin` marker and the first `end` marker after it.
///
/// Agents frequently echo their instructions (which contain the markers) before
/// producing the real block, so the last `begin` wins.
pub fn find_block<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let span = find_block_span(text, begin, end)?;
    Some(&text[span.start + begin.len()..span.end - end.len()])
}

/// Byte range of the block [`find_block`] selects, markers included.
pub fn find_block_span(text: &str, begin: &str, end: &str) -> Option<Range<usize>> {
    let start = text.rfind(begin)?;
    let body = start + begin.len();
    let len = text[body..].find(end)?;
    Some(start..body + len + end.len())
}

/// Strip a surrounding Markdown code fence (```` ```json ```` ... ```` ``` ````), if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match body.split_once('\n') {
        Some((info, inner)) if !info.trim().contains(char::is_whitespace) => inner.trim(),
        _ => body.trim(),
    }
}
