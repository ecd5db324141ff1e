/// Parsing and validation of assistant replies.
///
/// The assistant is told to return only JSON, so the whole trimmed reply is parsed strictly.
/// Anything else is kept verbatim as text for a human to look at; there is no attempt to dig
/// JSON out of surrounding prose.
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::field_path::FieldPath;
use crate::model::{AnalysisIssue, FileAnalysis};

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    Json(Value),
    Text(String),
}

pub fn parse(raw: &str) -> ParsedReply {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => ParsedReply::Json(value),
        Err(e) => {
            warn!(
                error = %e,
                bytes = raw.len(),
                "assistant reply is not valid JSON, keeping raw text"
            );
            ParsedReply::Text(raw.to_string())
        }
    }
}

/// A validated field-level change, ready to be staged.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedChange {
    pub field: FieldPath,
    /// The live value when the reply was interpreted.
    pub original: Value,
    pub improved: Value,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub changes: Vec<ProposedChange>,
    pub dropped: usize,
    pub quality_score: Option<u8>,
    pub brand_alignment: Option<String>,
}

/// Turn a JSON reply into changes against `live`.
///
/// Accepts either an envelope `{"improvements": [{field, improved, ...}], "summary": {...}}` or
/// a complete improved copy of the document, in which case every differing string leaf becomes
/// a change and structural differences are dropped. Summary metrics are only read from an
/// envelope, since a document's own keys could collide with them.
pub fn interpret_improvements(live: &Value, reply: &Value) -> Interpretation {
    match envelope_entries(live, reply) {
        Some(entries) => {
            let mut out = from_envelope(live, entries);
            out.quality_score = quality_score(reply);
            out.brand_alignment = brand_alignment(reply);
            out
        }
        None => from_document(live, reply),
    }
}

fn envelope_entries<'a>(live: &Value, reply: &'a Value) -> Option<&'a [Value]> {
    let entries = reply.get("improvements")?.as_array()?;
    let all_entries = entries.iter().all(|e| {
        e.as_object()
            .is_some_and(|o| o.contains_key("field") || o.contains_key("path"))
    });
    let live_has_key = live.get("improvements").is_some();
    (all_entries && (!entries.is_empty() || !live_has_key)).then_some(entries.as_slice())
}

fn from_envelope(live: &Value, entries: &[Value]) -> Interpretation {
    let mut out = Interpretation::default();
    for entry in entries {
        match validate_entry(live, entry) {
            Some(change) => out.changes.push(change),
            None => out.dropped += 1,
        }
    }
    out
}

fn validate_entry(live: &Value, entry: &Value) -> Option<ProposedChange> {
    let raw_field = first_str(entry, &["field", "path"])?;
    let field = FieldPath::parse(raw_field)
        .inspect_err(|e| debug!(error = %e, "dropping improvement with bad field path"))
        .ok()?;
    let improved = first_present(entry, &["improved", "proposed", "suggested"])?.clone();
    let Some(current) = field.get(live) else {
        debug!(field = %field, "dropping improvement for a field that does not exist");
        return None;
    };
    if *current == improved {
        return None;
    }
    if let Some(quoted) = entry.get("original") {
        if quoted != current {
            debug!(field = %field, "assistant quoted a different original, using the live value");
        }
    }

    Some(ProposedChange {
        field,
        original: current.clone(),
        improved,
        reasoning: first_str(entry, &["reasoning", "reason", "rationale"]).map(str::to_string),
        confidence: entry
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| (0.0..=1.0).contains(c)),
    })
}

fn from_document(live: &Value, reply: &Value) -> Interpretation {
    let mut out = Interpretation::default();
    diff(live, reply, &FieldPath::root(), &mut out);
    out
}

fn diff(live: &Value, proposed: &Value, at: &FieldPath, out: &mut Interpretation) {
    match (live, proposed) {
        (Value::String(a), Value::String(b)) => {
            if a != b {
                out.changes.push(ProposedChange {
                    field: at.clone(),
                    original: live.clone(),
                    improved: proposed.clone(),
                    reasoning: None,
                    confidence: None,
                });
            }
        }
        (Value::Object(a), Value::Object(b)) => diff_objects(a, b, at, out),
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                out.dropped += 1;
            }
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                diff(x, y, &at.index(i), out);
            }
        }
        (a, b) if a == b => {}
        _ => out.dropped += 1,
    }
}

fn diff_objects(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    at: &FieldPath,
    out: &mut Interpretation,
) {
    for (key, live_value) in a {
        match b.get(key) {
            Some(proposed) => diff(live_value, proposed, &at.key(key), out),
            None => out.dropped += 1,
        }
    }
    out.dropped += b.keys().filter(|k| !a.contains_key(*k)).count();
}

/// Read an analysis reply: `{score, brand_alignment, issues: [...]}`. Issues may be plain
/// strings or objects with `field`, `issue`, `suggestion`, `severity`.
pub fn interpret_analysis(file: &str, reply: &Value) -> FileAnalysis {
    let issues = reply
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(read_issue).collect())
        .unwrap_or_default();

    FileAnalysis {
        file: file.to_string(),
        score: quality_score(reply),
        brand_alignment: brand_alignment(reply),
        issues,
        ..FileAnalysis::default()
    }
}

fn read_issue(item: &Value) -> Option<AnalysisIssue> {
    if let Some(text) = item.as_str() {
        return Some(AnalysisIssue {
            field: None,
            issue: text.to_string(),
            suggestion: None,
            severity: None,
        });
    }
    let issue = first_str(item, &["issue", "description", "problem"])?;
    Some(AnalysisIssue {
        field: first_str(item, &["field", "path"]).map(str::to_string),
        issue: issue.to_string(),
        suggestion: first_str(item, &["suggestion", "fix"]).map(str::to_string),
        severity: first_str(item, &["severity"]).map(str::to_string),
    })
}

fn quality_score(reply: &Value) -> Option<u8> {
    let summary = reply.get("summary");
    [
        summary.and_then(|s| s.get("quality_score")),
        reply.get("quality_score"),
        reply.get("score"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_f64)
    .filter(|s| s.is_finite())
    .map(|s| s.clamp(0.0, 100.0).round() as u8)
}

fn brand_alignment(reply: &Value) -> Option<String> {
    let summary = reply.get("summary");
    [
        summary.and_then(|s| s.get("brand_alignment")),
        reply.get("brand_alignment"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_str)
    .map(str::to_string)
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn first_present<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .filter(|v| !v.is_null())
}
