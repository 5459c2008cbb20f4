//! Perspective table model: JSON-first extraction, legacy Markdown fallback,
//! and canonical rendering.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::markers::{
    PERSPECTIVES_BEGIN, PERSPECTIVES_END, PERSPECTIVES_JSON_BEGIN, PERSPECTIVES_JSON_END,
    find_block, strip_code_fence,
};

pub const TABLE_HEADER: &str =
    "| Case ID | Input / Precondition | Perspective (Equivalence / Boundary) | Expected Result | Notes |";
pub const TABLE_SEPARATOR: &str =
    "|--------|----------------------|---------------------------------------|-----------------|-------|";

/// Case ID of the single row in a failure table.
pub const ERROR_CASE_ID: &str = "TC-E-00";

pub const EMPTY_CASES_MESSAGE: &str = "perspective JSON contained empty cases";
pub const NO_PERSPECTIVE_MARKERS_MESSAGE: &str = "no test perspective markers found in agent output";

const CASES_SCHEMA: &str = r##"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "$defs": {
    "case": {
      "type": "object",
      "required": ["caseId"],
      "properties": {
        "caseId": { "type": "string", "minLength": 1 },
        "inputPrecondition": { "type": "string" },
        "perspective": { "type": "string" },
        "expectedResult": { "type": "string" },
        "notes": { "type": "string" }
      }
    },
    "cases": { "type": "array", "items": { "$ref": "#/$defs/case" } }
  },
  "oneOf": [
    { "$ref": "#/$defs/cases" },
    {
      "type": "object",
      "required": ["version", "cases"],
      "properties": {
        "version": { "const": 1 },
        "cases": { "$ref": "#/$defs/cases" }
      }
    }
  ]
}"##;

static CASES_VALIDATOR: LazyLock<Option<Validator>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(CASES_SCHEMA).ok()?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .ok()
});

/// One row of the fixed 5-column perspective table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveCase {
    pub case_id: String,
    #[serde(default)]
    pub input_precondition: String,
    #[serde(default)]
    pub perspective: String,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub notes: String,
}

impl PerspectiveCase {
    fn render_row(&self) -> String {
        format!(
            "| {} | {} | {} | {} | {} |",
            escape_cell(&self.case_id),
            escape_cell(&self.input_precondition),
            escape_cell(&self.perspective),
            escape_cell(&self.expected_result),
            escape_cell(&self.notes),
        )
    }
}

/// An extracted table in canonical Markdown form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerspectiveTable {
    /// Canonical Markdown (header, separator, rows).
    pub markdown: String,
    /// Decoded cases when the JSON form was used; legacy tables keep rows as text.
    pub cases: Vec<PerspectiveCase>,
}

impl PerspectiveTable {
    pub fn from_cases(cases: Vec<PerspectiveCase>) -> Self {
        let mut lines = vec![TABLE_HEADER.to_string(), TABLE_SEPARATOR.to_string()];
        lines.extend(cases.iter().map(PerspectiveCase::render_row));
        Self {
            markdown: lines.join("\n"),
            cases,
        }
    }

    /// True when there is something worth injecting into a prompt.
    pub fn is_blank(&self) -> bool {
        self.markdown.trim().is_empty()
    }
}

/// Extract a perspective table from agent output.
///
/// The JSON block is tried first. When it is absent or invalid the legacy
/// Markdown block must match the canonical header and separator exactly. The
/// error names the most specific failure (JSON problems win over "no markers").
pub fn extract_perspective_table(raw_log: &str) -> Result<PerspectiveTable, String> {
    let json_error = match find_block(raw_log, PERSPECTIVES_JSON_BEGIN, PERSPECTIVES_JSON_END) {
        Some(block) => match parse_json_cases(block) {
            Ok(cases) => return Ok(PerspectiveTable::from_cases(cases)),
            Err(err) => Some(err),
        },
        None => None,
    };

    let legacy_error = match find_block(raw_log, PERSPECTIVES_BEGIN, PERSPECTIVES_END) {
        Some(block) => match coerce_legacy_table(block) {
            Ok(table) => return Ok(table),
            Err(err) => Some(err),
        },
        None => None,
    };

    Err(json_error
        .or(legacy_error)
        .unwrap_or_else(|| NO_PERSPECTIVE_MARKERS_MESSAGE.to_string()))
}

fn parse_json_cases(block: &str) -> Result<Vec<PerspectiveCase>, String> {
    let value: Value = serde_json::from_str(strip_code_fence(block))
        .map_err(|err| format!("invalid perspective JSON: {err}"))?;

    let validator = CASES_VALIDATOR
        .as_ref()
        .ok_or_else(|| "perspective schema failed to compile".to_string())?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "perspective JSON failed schema validation: {}",
            messages.join("; ")
        ));
    }

    let cases_value = match value {
        Value::Object(mut obj) => obj.remove("cases").unwrap_or(Value::Null),
        other => other,
    };
    let cases: Vec<PerspectiveCase> = serde_json::from_value(cases_value)
        .map_err(|err| format!("invalid perspective cases: {err}"))?;

    if cases.is_empty() {
        return Err(EMPTY_CASES_MESSAGE.to_string());
    }
    if let Some(index) = cases.iter().position(|c| c.case_id.trim().is_empty()) {
        return Err(format!("perspective case {index} has an empty caseId"));
    }
    Ok(cases)
}

/// Accept a legacy Markdown table only when it is already canonical.
fn coerce_legacy_table(block: &str) -> Result<PerspectiveTable, String> {
    let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some(TABLE_HEADER) {
        return Err("legacy perspective table header does not match".to_string());
    }
    if lines.next() != Some(TABLE_SEPARATOR) {
        return Err("legacy perspective table separator does not match".to_string());
    }
    let rows: Vec<&str> = lines.collect();
    if rows.is_empty() {
        return Err("legacy perspective table has no rows".to_string());
    }
    if let Some(row) = rows
        .iter()
        .find(|row| !(row.starts_with('|') && row.ends_with('|')))
    {
        return Err(format!("legacy perspective table row is malformed: {row}"));
    }

    let mut markdown = vec![TABLE_HEADER, TABLE_SEPARATOR];
    markdown.extend(rows);
    Ok(PerspectiveTable {
        markdown: markdown.join("\n"),
        cases: Vec::new(),
    })
}

/// Table with a single error row whose notes point at `details_anchor`.
pub fn failure_table(reason: &str, details_anchor: &str) -> PerspectiveTable {
    PerspectiveTable::from_cases(vec![PerspectiveCase {
        case_id: ERROR_CASE_ID.to_string(),
        input_precondition: "-".to_string(),
        perspective: "Perspective table extraction failed".to_string(),
        expected_result: reason.to_string(),
        notes: format!("[See raw log](#{details_anchor})"),
    }])
}

fn escape_cell(text: &str) -> String {
    let single_line = text.trim().replace("\r\n", "\n").replace('\n', "<br>");
    single_line.replace('|', "\\|")
}
