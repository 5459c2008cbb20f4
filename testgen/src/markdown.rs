//! Small Markdown helpers shared by report renderers.

/// Wrap `content` in a fence longer than any backtick run inside it.
pub fn fenced(content: &str, info: &str) -> String {
    let longest = content
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest.max(2) + 1);
    let body = content.trim_end_matches('\n');
    format!("{fence}{info}\n{body}\n{fence}")
}

/// Collapsible section with an anchor id.
pub fn details(id: &str, summary: &str, body: &str) -> String {
    format!("<details id=\"{id}\">\n<summary>{summary}</summary>\n\n{body}\n\n</details>")
}
