//! Output validation for the JSON contract and strict source mapping
//!
//! Business task types require a non-empty `blocks[]` whose source ids all
//! come from the per-task allowed set. Recap-family task types validate
//! their own top-level key instead and skip strict source mapping.

use std::collections::HashSet;
use std::path::Path;

use newsstore::FailureClass;
use serde_json::Value;

/// Task types whose outputs use per-step shapes instead of blocks, and
/// which never produce citation snapshots.
pub const RECAP_TASK_TYPE_PREFIX: &str = "recap_";

/// Result of output validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub failure_class: Option<FailureClass>,
    pub error_summary: Option<String>,
    pub payload: Option<Value>,
}

impl ValidationResult {
    fn valid(payload: Value) -> Self {
        Self {
            is_valid: true,
            failure_class: None,
            error_summary: None,
            payload: Some(payload),
        }
    }

    fn invalid(failure_class: FailureClass, error_summary: String) -> Self {
        Self {
            is_valid: false,
            failure_class: Some(failure_class),
            error_summary: Some(error_summary),
            payload: None,
        }
    }
}

pub fn is_recap_task_type(task_type: &str) -> bool {
    task_type.starts_with(RECAP_TASK_TYPE_PREFIX)
}

/// Validate the backend output contract for the given task type.
pub fn validate_output_contract(
    output_path: &Path,
    task_type: &str,
    allowed_source_ids: &HashSet<String>,
) -> ValidationResult {
    if !output_path.exists() {
        return ValidationResult::invalid(
            FailureClass::OutputInvalidJson,
            format!("Output file not found: {}", output_path.display()),
        );
    }

    let raw = match std::fs::read_to_string(output_path) {
        Ok(raw) => raw,
        Err(error) => {
            return ValidationResult::invalid(
                FailureClass::OutputInvalidJson,
                format!("Output is not readable: {error}"),
            );
        }
    };
    let payload: Value = match serde_json::from_str(&raw) {
        Ok(payload) => payload,
        Err(error) => {
            return ValidationResult::invalid(
                FailureClass::OutputInvalidJson,
                format!("Output is not valid JSON: {error}"),
            );
        }
    };
    if !payload.is_object() {
        return ValidationResult::invalid(
            FailureClass::OutputInvalidJson,
            "Output must be a JSON object.".to_string(),
        );
    }

    if is_recap_task_type(task_type) {
        return validate_recap_output(task_type, payload);
    }
    validate_blocks_output(payload, allowed_source_ids)
}

fn validate_blocks_output(payload: Value, allowed_source_ids: &HashSet<String>) -> ValidationResult {
    let Some(blocks) = payload.get("blocks").and_then(Value::as_array) else {
        return ValidationResult::invalid(
            FailureClass::OutputInvalidJson,
            "Output must contain blocks array.".to_string(),
        );
    };
    if blocks.is_empty() {
        return ValidationResult::invalid(
            FailureClass::OutputInvalidJson,
            "Output blocks array must not be empty.".to_string(),
        );
    }

    for (index, block) in blocks.iter().enumerate() {
        let Some(block_object) = block.as_object() else {
            return ValidationResult::invalid(
                FailureClass::OutputInvalidJson,
                format!("blocks[{index}] must be an object."),
            );
        };
        if !block_object.get("text").is_some_and(Value::is_string) {
            return ValidationResult::invalid(
                FailureClass::OutputInvalidJson,
                format!("blocks[{index}].text must be a string."),
            );
        }
        let source_ids = block_object.get("source_ids").and_then(Value::as_array);
        let Some(source_ids) = source_ids.filter(|ids| !ids.is_empty()) else {
            return ValidationResult::invalid(
                FailureClass::SourceMappingFailed,
                format!("blocks[{index}] has empty or missing source_ids."),
            );
        };

        let mut unknown: Vec<String> = source_ids
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| !allowed_source_ids.contains(*id))
            .map(str::to_string)
            .collect();
        let non_strings = source_ids.iter().any(|id| !id.is_string());
        if non_strings {
            return ValidationResult::invalid(
                FailureClass::SourceMappingFailed,
                format!("blocks[{index}] contains non-string source_ids."),
            );
        }
        if !unknown.is_empty() {
            unknown.sort();
            return ValidationResult::invalid(
                FailureClass::SourceMappingFailed,
                format!(
                    "blocks[{index}] contains unknown source_ids: {}",
                    unknown.join(", ")
                ),
            );
        }
    }

    ValidationResult::valid(payload)
}

fn validate_recap_output(task_type: &str, payload: Value) -> ValidationResult {
    let required_key = match task_type {
        "recap_classify" | "recap_synthesize" => "status",
        "recap_enrich" | "recap_enrich_full" => "enriched",
        "recap_group" => "events",
        "recap_compose" => "theme_blocks",
        _ => {
            return ValidationResult::invalid(
                FailureClass::OutputInvalidJson,
                format!("Unknown recap task type: {task_type}"),
            );
        }
    };

    let value = payload.get(required_key);
    let present = match required_key {
        "status" => value.is_some_and(Value::is_string),
        _ => value.is_some_and(Value::is_array),
    };
    if !present {
        return ValidationResult::invalid(
            FailureClass::OutputInvalidJson,
            format!("Output for {task_type} must contain {required_key}."),
        );
    }
    ValidationResult::valid(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_output(dir: &std::path::Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("agent_result.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn allowed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_missing_file_is_invalid_json() {
        let temp = tempdir().unwrap();
        let result = validate_output_contract(
            &temp.path().join("nope.json"),
            "highlights",
            &allowed(&[]),
        );
        assert!(!result.is_valid);
        assert_eq!(result.failure_class, Some(FailureClass::OutputInvalidJson));
    }

    #[test]
    fn test_non_json_payload_is_invalid_json() {
        let temp = tempdir().unwrap();
        let path = write_output(temp.path(), "not json at all");
        let result = validate_output_contract(&path, "highlights", &allowed(&[]));
        assert_eq!(result.failure_class, Some(FailureClass::OutputInvalidJson));
    }

    #[test]
    fn test_valid_blocks_output() {
        let temp = tempdir().unwrap();
        let path = write_output(
            temp.path(),
            r#"{"blocks": [{"text": "summary", "source_ids": ["article:a"]}]}"#,
        );
        let result = validate_output_contract(&path, "highlights", &allowed(&["article:a"]));
        assert!(result.is_valid);
        assert!(result.payload.is_some());
    }

    #[test]
    fn test_empty_source_ids_is_mapping_failure() {
        let temp = tempdir().unwrap();
        let path = write_output(
            temp.path(),
            r#"{"blocks": [{"text": "summary", "source_ids": []}]}"#,
        );
        let result = validate_output_contract(&path, "highlights", &allowed(&["article:a"]));
        assert!(!result.is_valid);
        assert_eq!(result.failure_class, Some(FailureClass::SourceMappingFailed));
    }

    #[test]
    fn test_unknown_source_id_is_mapping_failure() {
        let temp = tempdir().unwrap();
        let path = write_output(
            temp.path(),
            r#"{"blocks": [{"text": "summary", "source_ids": ["article:zzz"]}]}"#,
        );
        let result = validate_output_contract(&path, "highlights", &allowed(&["article:a"]));
        assert_eq!(result.failure_class, Some(FailureClass::SourceMappingFailed));
        assert!(result.error_summary.unwrap().contains("article:zzz"));
    }

    #[test]
    fn test_missing_blocks_is_invalid_json() {
        let temp = tempdir().unwrap();
        let path = write_output(temp.path(), r#"{"something": 1}"#);
        let result = validate_output_contract(&path, "highlights", &allowed(&[]));
        assert_eq!(result.failure_class, Some(FailureClass::OutputInvalidJson));
    }

    #[test]
    fn test_block_text_must_be_string() {
        let temp = tempdir().unwrap();
        let path = write_output(
            temp.path(),
            r#"{"blocks": [{"text": 42, "source_ids": ["article:a"]}]}"#,
        );
        let result = validate_output_contract(&path, "highlights", &allowed(&["article:a"]));
        assert_eq!(result.failure_class, Some(FailureClass::OutputInvalidJson));
    }

    #[test]
    fn test_recap_types_validate_their_own_keys() {
        let temp = tempdir().unwrap();
        let cases = [
            ("recap_classify", r#"{"status": "done"}"#, true),
            ("recap_classify", r#"{"blocks": []}"#, false),
            ("recap_enrich", r#"{"enriched": []}"#, true),
            ("recap_enrich_full", r#"{"enriched": [{"article_id": "a"}]}"#, true),
            ("recap_group", r#"{"events": []}"#, true),
            ("recap_group", r#"{"events": "nope"}"#, false),
            ("recap_synthesize", r#"{"status": "completed", "processed": 3}"#, true),
            ("recap_compose", r#"{"theme_blocks": []}"#, true),
        ];
        for (task_type, content, expected) in cases {
            let path = write_output(temp.path(), content);
            let result = validate_output_contract(&path, task_type, &allowed(&[]));
            assert_eq!(result.is_valid, expected, "case {task_type}: {content}");
        }
    }

    #[test]
    fn test_recap_types_skip_source_mapping() {
        let temp = tempdir().unwrap();
        // Unknown ids inside a recap payload are fine: mapping is not enforced.
        let path = write_output(
            temp.path(),
            r#"{"events": [{"article_ids": ["article:unknown"]}]}"#,
        );
        let result = validate_output_contract(&path, "recap_group", &allowed(&[]));
        assert!(result.is_valid);
    }

    #[test]
    fn test_is_recap_task_type() {
        assert!(is_recap_task_type("recap_compose"));
        assert!(!is_recap_task_type("highlights"));
    }
}
