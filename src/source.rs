//! Scrape-dump ingestion: the boundary where the external scraping
//! collaborator hands the pipeline an ordered, finite stream of
//! conversation records.
//!
//! Dumps come in two layouts, sniffed from the first non-whitespace byte:
//! a single JSON array of conversation objects, or JSONL with one object
//! per line. A record that fails to parse or validate becomes a reported
//! `LoadError` carrying the best available graph_id; it never aborts the
//! load.
use eyre::{Context, Result, eyre};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::record::{Conversation, RawConversation};

#[derive(Debug)]
pub struct LoadError {
    pub graph_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub conversations: Vec<Conversation>,
    pub errors: Vec<LoadError>,
}

pub fn load_dump(path: &Path) -> Result<LoadOutcome> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read scrape dump: {}", path.display()))?;

    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        load_array(trimmed)
    } else {
        Ok(load_jsonl(&text))
    }
}

fn load_array(text: &str) -> Result<LoadOutcome> {
    let values: Vec<Value> = serde_json::from_str(text)
        .wrap_err("Scrape dump is not a valid JSON array of conversations")?;
    let mut out = LoadOutcome::default();
    for (idx, value) in values.into_iter().enumerate() {
        accept(value, &format!("item {}", idx), &mut out);
    }
    Ok(out)
}

fn load_jsonl(text: &str) -> LoadOutcome {
    let mut out = LoadOutcome::default();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => accept(value, &format!("line {}", lineno + 1), &mut out),
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping unparseable dump line");
                out.errors.push(LoadError {
                    graph_id: format!("<line {}>", lineno + 1),
                    reason: format!("invalid JSON: {}", e),
                });
            }
        }
    }
    out
}

/// Decode and validate one record, filing failures under the record's own
/// graph_id when it is recoverable from the raw value.
fn accept(value: Value, position: &str, out: &mut LoadOutcome) {
    let hint = value
        .get("graph_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("<{}>", position));

    let parsed = serde_json::from_value::<RawConversation>(value)
        .map_err(|e| eyre!("malformed record: {}", e))
        .and_then(Conversation::try_from);

    match parsed {
        Ok(conv) => out.conversations.push(conv),
        Err(e) => {
            tracing::warn!(graph_id = %hint, error = %e, "rejecting conversation record");
            out.errors.push(LoadError {
                graph_id: hint,
                reason: format!("{:#}", e),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dump_file(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    const GOOD: &str = r#"{"graph_id":"c1","title":"Hi","updated_at":"2024-05-01T10:00:00Z","messages":[{"graph_id":"m1","role":"user","content":"hello"}]}"#;

    #[test]
    fn loads_jsonl() {
        let f = dump_file(&format!("{}\n\n{}\n", GOOD, GOOD.replace("c1", "c2")));
        let out = load_dump(f.path()).unwrap();
        assert_eq!(out.conversations.len(), 2);
        assert!(out.errors.is_empty());
        assert_eq!(out.conversations[1].graph_id, "c2");
    }

    #[test]
    fn loads_json_array() {
        let f = dump_file(&format!("[{}]", GOOD));
        let out = load_dump(f.path()).unwrap();
        assert_eq!(out.conversations.len(), 1);
        assert_eq!(out.conversations[0].messages.len(), 1);
    }

    #[test]
    fn bad_line_is_isolated() {
        let f = dump_file(&format!("{}\nnot json\n{}\n", GOOD, GOOD.replace("c1", "c3")));
        let out = load_dump(f.path()).unwrap();
        assert_eq!(out.conversations.len(), 2);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn missing_required_field_reports_graph_id() {
        // No updated_at.
        let bad = r#"{"graph_id":"c9","title":"x","messages":[]}"#;
        let f = dump_file(bad);
        let out = load_dump(f.path()).unwrap();
        assert!(out.conversations.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].graph_id, "c9");
    }

    #[test]
    fn unreadable_file_is_fatal() {
        assert!(load_dump(Path::new("/nonexistent/dump.jsonl")).is_err());
    }
}
