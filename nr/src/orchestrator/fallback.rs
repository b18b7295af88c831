//! Best-effort output contract recovery from backend stdout
//!
//! Used by the demo/benchmark paths when an agent answered in prose or a
//! fenced code block instead of writing the result file. Never part of
//! strict worker validation.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::contracts::{AgentOutput, AgentOutputBlock};

pub const STDOUT_PARSER_VERSION: &str = "v1";

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex")
});

/// Try to recover an agent output contract from plain backend stdout.
pub fn recover_output_contract_from_stdout(
    stdout_text: &str,
    allowed_source_ids: &HashSet<String>,
) -> Option<AgentOutput> {
    let text = stdout_text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(payload) = parse_json_payload(text) {
        if let Some(normalized) = normalize_payload(&payload, allowed_source_ids) {
            return Some(normalized);
        }
    }

    let fallback_source_id = fallback_source_id(allowed_source_ids)?;
    let plain_text = normalize_plain_text(text);
    if plain_text.is_empty() {
        return None;
    }
    Some(AgentOutput {
        blocks: vec![AgentOutputBlock {
            text: plain_text,
            source_ids: vec![fallback_source_id],
        }],
        metadata: serde_json::json!({
            "stdout_parser": "plain_text_single_block",
            "stdout_parser_version": STDOUT_PARSER_VERSION,
        }),
    })
}

fn parse_json_payload(text: &str) -> Option<Value> {
    if let Some(direct) = try_load_object(text) {
        return Some(direct);
    }
    if let Some(fenced) = FENCED_JSON.captures(text) {
        if let Some(payload) = try_load_object(&fenced[1]) {
            return Some(payload);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    try_load_object(&text[start..=end])
}

fn try_load_object(raw: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    parsed.is_object().then_some(parsed)
}

fn normalize_payload(payload: &Value, allowed_source_ids: &HashSet<String>) -> Option<AgentOutput> {
    let raw_blocks = payload.get("blocks")?.as_array()?;
    let fallback_source = fallback_source_id(allowed_source_ids)?;

    let mut blocks = Vec::new();
    for item in raw_blocks {
        let Some(object) = item.as_object() else {
            continue;
        };
        let Some(text) = object.get("text").and_then(Value::as_str) else {
            continue;
        };
        let mut source_ids: Vec<String> = Vec::new();
        if let Some(raw_ids) = object.get("source_ids").and_then(Value::as_array) {
            let mut seen = HashSet::new();
            for source_id in raw_ids.iter().filter_map(Value::as_str) {
                if allowed_source_ids.contains(source_id) && seen.insert(source_id) {
                    source_ids.push(source_id.to_string());
                }
            }
        }
        if source_ids.is_empty() {
            source_ids.push(fallback_source.clone());
        }
        blocks.push(AgentOutputBlock {
            text: text.trim().to_string(),
            source_ids,
        });
    }

    if blocks.is_empty() {
        return None;
    }
    let mut metadata = payload
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    metadata.insert(
        "stdout_parser".to_string(),
        Value::String("json_payload_normalized".to_string()),
    );
    metadata.insert(
        "stdout_parser_version".to_string(),
        Value::String(STDOUT_PARSER_VERSION.to_string()),
    );
    Some(AgentOutput {
        blocks,
        metadata: Value::Object(metadata),
    })
}

fn fallback_source_id(allowed_source_ids: &HashSet<String>) -> Option<String> {
    allowed_source_ids.iter().min().cloned()
}

fn normalize_plain_text(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_direct_json_with_valid_blocks() {
        let stdout = r#"{"blocks": [{"text": "hello", "source_ids": ["article:a"]}]}"#;
        let output = recover_output_contract_from_stdout(stdout, &allowed(&["article:a"])).unwrap();
        assert_eq!(output.blocks.len(), 1);
        assert_eq!(output.blocks[0].source_ids, vec!["article:a"]);
        assert_eq!(output.metadata["stdout_parser"], "json_payload_normalized");
    }

    #[test]
    fn test_fenced_json_is_extracted() {
        let stdout = "Here you go:\n```json\n{\"blocks\": [{\"text\": \"x\", \"source_ids\": [\"article:a\"]}]}\n```";
        let output = recover_output_contract_from_stdout(stdout, &allowed(&["article:a"])).unwrap();
        assert_eq!(output.blocks[0].text, "x");
    }

    #[test]
    fn test_unknown_source_ids_replaced_with_fallback() {
        let stdout = r#"{"blocks": [{"text": "x", "source_ids": ["article:zzz"]}]}"#;
        let output =
            recover_output_contract_from_stdout(stdout, &allowed(&["article:b", "article:a"]))
                .unwrap();
        assert_eq!(output.blocks[0].source_ids, vec!["article:a"]);
    }

    #[test]
    fn test_plain_text_becomes_single_block() {
        let stdout = "Line one\n\n  Line two  ";
        let output = recover_output_contract_from_stdout(stdout, &allowed(&["article:a"])).unwrap();
        assert_eq!(output.blocks.len(), 1);
        assert_eq!(output.blocks[0].text, "Line one\n  Line two");
        assert_eq!(output.metadata["stdout_parser"], "plain_text_single_block");
    }

    #[test]
    fn test_empty_allowed_set_yields_nothing() {
        assert!(recover_output_contract_from_stdout("text", &allowed(&[])).is_none());
    }

    #[test]
    fn test_empty_stdout_yields_nothing() {
        assert!(recover_output_contract_from_stdout("   ", &allowed(&["article:a"])).is_none());
    }
}
