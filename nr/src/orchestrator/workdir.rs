//! Workdir materialization for file-based task execution
//!
//! Creates the deterministic per-task tree:
//!
//! ```text
//! <root>/<task_id>/
//!   input/   task_input.json, articles_index.json, optional context
//!            files, optional resources/
//!   output/  agent_result.json, agent_stdout.log, agent_stderr.log,
//!            optional results/
//!   meta/    task_manifest.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::contracts::{
    write_articles_index, write_json, write_manifest, write_task_input, ArticleIndexEntry,
    ContractError, TaskInput, TaskManifest,
};

/// Materialized file-based task contract paths.
#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub manifest_path: PathBuf,
    pub manifest: TaskManifest,
}

/// Optional inputs beyond the core contract files.
#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub continuity_summary: Option<Value>,
    pub retrieval_context: Option<Value>,
    pub story_context: Option<Value>,
    /// Extra input files placed under `input/resources/` (v3).
    pub extra_input_files: Vec<(String, Vec<u8>)>,
    pub output_schema_hint: Option<String>,
}

/// Creates deterministic per-task directory layouts.
pub struct TaskWorkdirManager {
    root_dir: PathBuf,
}

impl TaskWorkdirManager {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root_dir.join(task_id)
    }

    pub fn results_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("output").join("results")
    }

    pub fn output_result_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("output").join("agent_result.json")
    }

    pub fn materialize(
        &self,
        task_id: &str,
        task_type: &str,
        task_input: &TaskInput,
        articles_index: &[ArticleIndexEntry],
        options: &MaterializeOptions,
    ) -> Result<MaterializedTask, ContractError> {
        let base_dir = self.task_dir(task_id);
        let input_dir = base_dir.join("input");
        let output_dir = base_dir.join("output");
        let meta_dir = base_dir.join("meta");
        for dir in [&input_dir, &output_dir, &meta_dir] {
            fs::create_dir_all(dir).map_err(|source| ContractError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let task_input_path = input_dir.join("task_input.json");
        let articles_index_path = input_dir.join("articles_index.json");
        let output_result_path = output_dir.join("agent_result.json");
        let output_stdout_path = output_dir.join("agent_stdout.log");
        let output_stderr_path = output_dir.join("agent_stderr.log");
        let manifest_path = meta_dir.join("task_manifest.json");

        write_task_input(&task_input_path, task_input)?;
        write_articles_index(&articles_index_path, articles_index)?;

        let mut continuity_summary_path = None;
        let mut retrieval_context_path = None;
        let mut story_context_path = None;
        if let Some(payload) = &options.continuity_summary {
            let path = input_dir.join("continuity_summary.json");
            write_json(&path, payload)?;
            continuity_summary_path = Some(path);
        }
        if let Some(payload) = &options.retrieval_context {
            let path = input_dir.join("retrieval_context.json");
            write_json(&path, payload)?;
            retrieval_context_path = Some(path);
        }
        if let Some(payload) = &options.story_context {
            let path = input_dir.join("story_context.json");
            write_json(&path, payload)?;
            story_context_path = Some(path);
        }

        let mut input_resources_dir = None;
        let mut output_results_dir = None;
        if !options.extra_input_files.is_empty() {
            let resources = input_dir.join("resources");
            fs::create_dir_all(&resources).map_err(|source| ContractError::Io {
                path: resources.display().to_string(),
                source,
            })?;
            for (filename, content) in &options.extra_input_files {
                let file_path = resources.join(filename);
                fs::write(&file_path, content).map_err(|source| ContractError::Io {
                    path: file_path.display().to_string(),
                    source,
                })?;
            }
            let results = output_dir.join("results");
            fs::create_dir_all(&results).map_err(|source| ContractError::Io {
                path: results.display().to_string(),
                source,
            })?;
            input_resources_dir = Some(resources);
            output_results_dir = Some(results);
        }

        let has_context = continuity_summary_path.is_some()
            || retrieval_context_path.is_some()
            || story_context_path.is_some();
        let contract_version =
            if input_resources_dir.is_some() || options.output_schema_hint.is_some() {
                3
            } else if has_context {
                2
            } else {
                1
            };

        let display = |path: &PathBuf| path.display().to_string();
        let manifest = TaskManifest {
            contract_version,
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            workdir: display(&base_dir),
            task_input_path: display(&task_input_path),
            articles_index_path: display(&articles_index_path),
            output_result_path: display(&output_result_path),
            output_stdout_path: display(&output_stdout_path),
            output_stderr_path: display(&output_stderr_path),
            continuity_summary_path: continuity_summary_path.as_ref().map(display),
            retrieval_context_path: retrieval_context_path.as_ref().map(display),
            story_context_path: story_context_path.as_ref().map(display),
            input_resources_dir: input_resources_dir.as_ref().map(display),
            output_results_dir: output_results_dir.as_ref().map(display),
            output_schema_hint: options.output_schema_hint.clone(),
        };
        write_manifest(&manifest_path, &manifest)?;

        Ok(MaterializedTask {
            manifest_path,
            manifest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::contracts::read_manifest;
    use tempfile::tempdir;

    fn task_input() -> TaskInput {
        TaskInput {
            task_type: "highlights".to_string(),
            prompt: "prompt".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn index_entry() -> ArticleIndexEntry {
        ArticleIndexEntry {
            source_id: "article:a".to_string(),
            title: "Title".to_string(),
            url: "https://example.com/a".to_string(),
            source: String::new(),
            published_at: None,
        }
    }

    #[test]
    fn test_materialize_v1_base_layout() {
        let temp = tempdir().unwrap();
        let manager = TaskWorkdirManager::new(temp.path());
        let materialized = manager
            .materialize(
                "task-1",
                "highlights",
                &task_input(),
                &[index_entry()],
                &MaterializeOptions::default(),
            )
            .unwrap();

        assert_eq!(materialized.manifest.contract_version, 1);
        assert!(temp.path().join("task-1/input/task_input.json").exists());
        assert!(temp.path().join("task-1/input/articles_index.json").exists());
        assert!(temp.path().join("task-1/meta/task_manifest.json").exists());
        assert!(!temp.path().join("task-1/input/resources").exists());

        let loaded = read_manifest(&materialized.manifest_path).unwrap();
        assert_eq!(loaded, materialized.manifest);
    }

    #[test]
    fn test_materialize_v2_with_context_files() {
        let temp = tempdir().unwrap();
        let manager = TaskWorkdirManager::new(temp.path());
        let options = MaterializeOptions {
            continuity_summary: Some(serde_json::json!({"stories": []})),
            retrieval_context: Some(serde_json::json!({"entries": []})),
            ..MaterializeOptions::default()
        };
        let materialized = manager
            .materialize("task-2", "story", &task_input(), &[index_entry()], &options)
            .unwrap();

        assert_eq!(materialized.manifest.contract_version, 2);
        assert!(materialized.manifest.continuity_summary_path.is_some());
        assert!(materialized.manifest.story_context_path.is_none());
        assert!(temp
            .path()
            .join("task-2/input/continuity_summary.json")
            .exists());
    }

    #[test]
    fn test_materialize_v3_with_resources_and_hint() {
        let temp = tempdir().unwrap();
        let manager = TaskWorkdirManager::new(temp.path());
        let options = MaterializeOptions {
            extra_input_files: vec![
                ("a_in.txt".to_string(), b"headline a".to_vec()),
                ("b_in.txt".to_string(), b"headline b".to_vec()),
            ],
            output_schema_hint: Some("{\"status\": \"done\"}".to_string()),
            ..MaterializeOptions::default()
        };
        let materialized = manager
            .materialize(
                "task-3",
                "recap_classify",
                &task_input(),
                &[index_entry()],
                &options,
            )
            .unwrap();

        assert_eq!(materialized.manifest.contract_version, 3);
        assert!(temp.path().join("task-3/input/resources/a_in.txt").exists());
        assert!(temp.path().join("task-3/output/results").is_dir());
        assert!(materialized.manifest.output_schema_hint.is_some());
    }

    #[test]
    fn test_schema_hint_alone_is_v3() {
        let temp = tempdir().unwrap();
        let manager = TaskWorkdirManager::new(temp.path());
        let options = MaterializeOptions {
            output_schema_hint: Some("{}".to_string()),
            ..MaterializeOptions::default()
        };
        let materialized = manager
            .materialize("task-4", "recap_group", &task_input(), &[], &options)
            .unwrap();
        assert_eq!(materialized.manifest.contract_version, 3);
        assert!(materialized.manifest.input_resources_dir.is_none());
    }
}
