//! Make agent logs readable for humans.
//!
//! `sanitize` is idempotent: removing tags or escape sequences can splice text
//! into a new tag or escape, so both passes run to a fixed point before the
//! line-level passes.

use std::sync::LazyLock;

use regex::Regex;

static SYSTEM_TAG_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(system[A-Za-z0-9_-]*)(?:\s[^>]*)?>").unwrap());

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])").unwrap()
});

static EVENT_MARKER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:event|system):[A-Za-z0-9_./-]*$").unwrap());

/// Strip system-internal noise and normalize blank lines.
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = strip_system_tags(&strip_ansi(&current));
        if next == current {
            break;
        }
        current = next;
    }

    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in current.split('\n') {
        let line = line.trim();
        if EVENT_MARKER_LINE.is_match(line) {
            continue;
        }
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        previous_blank = blank;
        out.push(line);
    }
    out.join("\n")
}

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Remove every closed `<system...>...</system...>` block, nested content included.
///
/// An opening tag without its matching close is left untouched.
pub fn strip_system_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(caps) = SYSTEM_TAG_OPEN.captures(rest) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        match matching_close(&rest[whole.end()..], name.as_str()) {
            Some(close_end) => {
                out.push_str(&rest[..whole.start()]);
                rest = &rest[whole.end() + close_end..];
            }
            None => {
                out.push_str(&rest[..whole.end()]);
                rest = &rest[whole.end()..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte offset just past the close tag balancing an already-consumed open tag.
fn matching_close(text: &str, name: &str) -> Option<usize> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut depth = 1usize;
    let mut pos = 0usize;
    loop {
        let next_close = text[pos..].find(&close)? + pos;
        let next_open = text[pos..]
            .match_indices(&open)
            .map(|(idx, _)| idx + pos)
            .find(|&idx| is_tag_boundary(text, idx + open.len()));
        match next_open {
            Some(idx) if idx < next_close => {
                depth += 1;
                pos = idx + open.len();
            }
            _ => {
                depth -= 1;
                pos = next_close + close.len();
                if depth == 0 {
                    return Some(pos);
                }
            }
        }
    }
}

fn is_tag_boundary(text: &str, idx: usize) -> bool {
    matches!(
        text[idx..].chars().next(),
        Some('>') | Some(' ') | Some('\t') | Some('\n')
    )
}
