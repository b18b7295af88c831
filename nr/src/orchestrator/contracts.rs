//! File-based contracts for task inputs and outputs
//!
//! All contract files are written with deterministic formatting (sorted
//! keys, two-space indent) so reruns and diffs are stable. Readers are
//! strict: a malformed file is an input contract error, never a silent
//! default.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// One allowed source entry for strict source mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleIndexEntry {
    pub source_id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Task input payload consumed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_type: String,
    pub prompt: String,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

/// One output block with mandatory source mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutputBlock {
    pub text: String,
    pub source_ids: Vec<String>,
}

/// Top-level output payload produced by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub blocks: Vec<AgentOutputBlock>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

/// Manifest stored with each queued task.
///
/// `contract_version` 1 carries only the core paths; 2 adds the optional
/// context paths; 3 adds resources/results directories and a schema hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    #[serde(default = "default_contract_version")]
    pub contract_version: i64,
    pub task_id: String,
    pub task_type: String,
    pub workdir: String,
    pub task_input_path: String,
    pub articles_index_path: String,
    pub output_result_path: String,
    pub output_stdout_path: String,
    pub output_stderr_path: String,
    #[serde(default)]
    pub continuity_summary_path: Option<String>,
    #[serde(default)]
    pub retrieval_context_path: Option<String>,
    #[serde(default)]
    pub story_context_path: Option<String>,
    #[serde(default)]
    pub input_resources_dir: Option<String>,
    #[serde(default)]
    pub output_results_dir: Option<String>,
    #[serde(default)]
    pub output_schema_hint: Option<String>,
}

fn default_contract_version() -> i64 {
    1
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Persist a JSON payload using deterministic formatting.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<(), ContractError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ContractError::Io {
            path: path.display().to_string(),
            source,
        })?;
    }
    // Round-trip through Value: serde_json's map is ordered, so keys sort.
    let value = serde_json::to_value(payload).map_err(|source| ContractError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let rendered = serde_json::to_string_pretty(&value).map_err(|source| ContractError::Json {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, rendered).map_err(|source| ContractError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn load_json(path: &Path) -> Result<Value, ContractError> {
    let raw = fs::read_to_string(path).map_err(|source| ContractError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ContractError::Json {
        path: path.display().to_string(),
        source,
    })?;
    if !value.is_object() {
        return Err(ContractError::Invalid(format!(
            "Expected JSON object in {}",
            path.display()
        )));
    }
    Ok(value)
}

pub fn write_task_input(path: &Path, payload: &TaskInput) -> Result<(), ContractError> {
    write_json(path, payload)
}

pub fn read_task_input(path: &Path) -> Result<TaskInput, ContractError> {
    let value = load_json(path)?;
    let input: TaskInput = serde_json::from_value(value).map_err(|source| ContractError::Json {
        path: path.display().to_string(),
        source,
    })?;
    if input.task_type.trim().is_empty() {
        return Err(ContractError::Invalid(
            "task_input.task_type must be a non-empty string".to_string(),
        ));
    }
    if !input.metadata.is_object() {
        return Err(ContractError::Invalid(
            "task_input.metadata must be an object".to_string(),
        ));
    }
    Ok(input)
}

pub fn write_articles_index(
    path: &Path,
    articles: &[ArticleIndexEntry],
) -> Result<(), ContractError> {
    write_json(path, &serde_json::json!({ "articles": articles }))
}

pub fn read_articles_index(path: &Path) -> Result<Vec<ArticleIndexEntry>, ContractError> {
    let value = load_json(path)?;
    let raw_articles = value
        .get("articles")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ContractError::Invalid("articles_index.articles must be an array".to_string())
        })?;

    let mut entries = Vec::with_capacity(raw_articles.len());
    for item in raw_articles {
        let entry: ArticleIndexEntry =
            serde_json::from_value(item.clone()).map_err(|source| ContractError::Json {
                path: path.display().to_string(),
                source,
            })?;
        if entry.source_id.trim().is_empty() {
            return Err(ContractError::Invalid(
                "articles_index.source_id must be a non-empty string".to_string(),
            ));
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn write_agent_output(path: &Path, payload: &AgentOutput) -> Result<(), ContractError> {
    write_json(path, payload)
}

pub fn write_manifest(path: &Path, manifest: &TaskManifest) -> Result<(), ContractError> {
    write_json(path, manifest)
}

pub fn read_manifest(path: &Path) -> Result<TaskManifest, ContractError> {
    let value = load_json(path)?;
    let manifest: TaskManifest =
        serde_json::from_value(value).map_err(|source| ContractError::Json {
            path: path.display().to_string(),
            source,
        })?;
    if manifest.contract_version < 1 {
        return Err(ContractError::Invalid(
            "task_manifest.contract_version must be an integer >= 1".to_string(),
        ));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(version: i64) -> TaskManifest {
        TaskManifest {
            contract_version: version,
            task_id: "task-1".to_string(),
            task_type: "highlights".to_string(),
            workdir: "/tmp/task-1".to_string(),
            task_input_path: "/tmp/task-1/input/task_input.json".to_string(),
            articles_index_path: "/tmp/task-1/input/articles_index.json".to_string(),
            output_result_path: "/tmp/task-1/output/agent_result.json".to_string(),
            output_stdout_path: "/tmp/task-1/output/agent_stdout.log".to_string(),
            output_stderr_path: "/tmp/task-1/output/agent_stderr.log".to_string(),
            continuity_summary_path: None,
            retrieval_context_path: None,
            story_context_path: None,
            input_resources_dir: None,
            output_results_dir: None,
            output_schema_hint: None,
        }
    }

    #[test]
    fn test_manifest_round_trips_all_versions() {
        let temp = tempdir().unwrap();

        for (version, with_context, with_resources) in
            [(1, false, false), (2, true, false), (3, true, true)]
        {
            let mut expected = manifest(version);
            if with_context {
                expected.continuity_summary_path =
                    Some("/tmp/task-1/input/continuity_summary.json".to_string());
                expected.retrieval_context_path =
                    Some("/tmp/task-1/input/retrieval_context.json".to_string());
            }
            if with_resources {
                expected.input_resources_dir = Some("/tmp/task-1/input/resources".to_string());
                expected.output_results_dir = Some("/tmp/task-1/output/results".to_string());
                expected.output_schema_hint = Some("{\"status\": \"done\"}".to_string());
            }

            let path = temp.path().join(format!("manifest_v{version}.json"));
            write_manifest(&path, &expected).unwrap();
            let loaded = read_manifest(&path).unwrap();
            assert_eq!(loaded, expected);
        }
    }

    #[test]
    fn test_manifest_without_version_defaults_to_v1() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{
                "task_id": "task-1",
                "task_type": "highlights",
                "workdir": "/w",
                "task_input_path": "/w/i.json",
                "articles_index_path": "/w/a.json",
                "output_result_path": "/w/o.json",
                "output_stdout_path": "/w/out.log",
                "output_stderr_path": "/w/err.log"
            }"#,
        )
        .unwrap();
        let loaded = read_manifest(&path).unwrap();
        assert_eq!(loaded.contract_version, 1);
    }

    #[test]
    fn test_manifest_missing_required_field_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, r#"{"task_id": "task-1"}"#).unwrap();
        assert!(read_manifest(&path).is_err());
    }

    #[test]
    fn test_task_input_round_trip_and_validation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("task_input.json");
        let input = TaskInput {
            task_type: "highlights".to_string(),
            prompt: "Summarize the day.".to_string(),
            metadata: serde_json::json!({"routing": {"agent": "codex"}}),
        };
        write_task_input(&path, &input).unwrap();
        let loaded = read_task_input(&path).unwrap();
        assert_eq!(loaded.task_type, "highlights");
        assert_eq!(loaded.metadata["routing"]["agent"], "codex");

        std::fs::write(&path, r#"{"task_type": "  ", "prompt": "p"}"#).unwrap();
        assert!(read_task_input(&path).is_err());
    }

    #[test]
    fn test_articles_index_round_trip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("articles_index.json");
        let entries = vec![ArticleIndexEntry {
            source_id: "article:a1".to_string(),
            title: "Title".to_string(),
            url: "https://example.com/a1".to_string(),
            source: "example.com".to_string(),
            published_at: Some("2026-03-01T10:00:00Z".to_string()),
        }];
        write_articles_index(&path, &entries).unwrap();
        assert_eq!(read_articles_index(&path).unwrap(), entries);

        std::fs::write(&path, r#"{"articles": [{"source_id": " ", "title": "t", "url": "u"}]}"#)
            .unwrap();
        assert!(read_articles_index(&path).is_err());
    }

    #[test]
    fn test_write_json_sorts_keys() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sorted.json");
        write_json(
            &path,
            &serde_json::json!({"zeta": 1, "alpha": 2, "mid": {"b": 1, "a": 2}}),
        )
        .unwrap();
        let rendered = std::fs::read_to_string(&path).unwrap();
        let alpha = rendered.find("alpha").unwrap();
        let zeta = rendered.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
