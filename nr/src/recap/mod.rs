//! Recap flow coordinator
//!
//! Drives the fixed six-step digest pipeline (classify, enrich, group,
//! enrich-full, synthesize, compose) by enqueuing durable LLM tasks and
//! polling them to terminal state. The coordinator never executes agents
//! itself; a worker consumes the same queue. Resource loading (the non-LLM
//! steps) runs inline through the [`ResourceLoader`] seam.

pub mod prompts;
pub mod resources;
pub mod schemas;
pub mod steps;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{Duration, NaiveDate};
use eyre::{eyre, Result};
use newsstore::{LlmTaskCreate, LlmTaskStatus, LlmTaskView, SourceCorpusEntry, Store};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::contracts::{ArticleIndexEntry, TaskInput};
use crate::orchestrator::routing::{resolve_routing_for_enqueue, RoutingDefaults};
use crate::orchestrator::workdir::{MaterializeOptions, TaskWorkdirManager};
use prompts::{prompt_for_task_type, render_prompt};
use resources::ResourceLoader;
use schemas::schema_for_task_type;
use steps::{
    articles_needing_full_text, articles_to_individual_files, build_event_payloads,
    events_to_resource_files, merge_enriched_into_index, parse_classify_out_files,
    parse_enrich_result, parse_group_result, safe_file_id, select_significant_events,
    to_article_index, EnrichedArticle,
};

/// One pipeline step failed; carries the failing step name.
#[derive(Debug, Clone, Error)]
#[error("Step {step} failed: {message}")]
pub struct RecapStepError {
    pub step: String,
    pub message: String,
}

impl RecapStepError {
    fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// User preferences for digest composition.
#[derive(Debug, Clone)]
pub struct UserPreferences {
    pub max_headline_chars: usize,
    pub interesting: String,
    pub not_interesting: String,
    pub language: String,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            max_headline_chars: 120,
            interesting: String::new(),
            not_interesting: String::new(),
            language: "en".to_string(),
        }
    }
}

impl UserPreferences {
    pub fn format_for_prompt(&self) -> String {
        let mut parts = Vec::new();
        if !self.not_interesting.is_empty() {
            parts.push(format!(
                "DISCARD these topics (always trash): {}",
                self.not_interesting
            ));
        }
        if !self.interesting.is_empty() {
            parts.push(format!(
                "PRIORITY topics (user wants extra detail): {}",
                self.interesting
            ));
        }
        if parts.is_empty() {
            "no specific preferences".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Result of a single pipeline step.
#[derive(Debug, Clone)]
pub struct PipelineStepResult {
    pub step_name: String,
    pub task_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRunResult {
    pub pipeline_id: String,
    pub business_date: NaiveDate,
    pub steps: Vec<PipelineStepResult>,
    pub digest: Option<Value>,
    pub status: String,
    pub error: Option<String>,
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct RecapConfig {
    pub poll_interval_seconds: f64,
    pub max_poll_seconds: f64,
    pub stale_run_after: Duration,
    pub task_priority: i64,
    pub task_max_attempts: i64,
    pub task_timeout_seconds: i64,
}

impl Default for RecapConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5.0,
            max_poll_seconds: 1_800.0,
            stale_run_after: Duration::seconds(1_800),
            task_priority: 100,
            task_max_attempts: 3,
            task_timeout_seconds: 600,
        }
    }
}

/// Coordinates the six-step news digest pipeline.
pub struct RecapPipelineRunner {
    store: Store,
    workdir: TaskWorkdirManager,
    routing_defaults: RoutingDefaults,
    resource_loader: Option<Box<dyn ResourceLoader>>,
    config: RecapConfig,
}

impl RecapPipelineRunner {
    pub fn new(
        store: Store,
        workdir: TaskWorkdirManager,
        routing_defaults: RoutingDefaults,
        resource_loader: Option<Box<dyn ResourceLoader>>,
        config: RecapConfig,
    ) -> Self {
        Self {
            store,
            workdir,
            routing_defaults,
            resource_loader,
            config,
        }
    }

    /// Execute the full six-step pipeline.
    ///
    /// A live concurrent pipeline for the same user is rejected up front;
    /// a stale one is auto-recovered by the guard. Step failures are
    /// captured into the returned result, not panics.
    pub async fn run(
        &mut self,
        business_date: NaiveDate,
        preferences: &UserPreferences,
        articles: &[SourceCorpusEntry],
        agent_override: Option<&str>,
    ) -> Result<PipelineRunResult> {
        if let Some(active) = self.store.active_pipeline_run(self.config.stale_run_after)? {
            return Err(eyre!(
                "Another pipeline is already running: {}",
                active.pipeline_id
            ));
        }

        let pipeline_id = Uuid::new_v4().to_string();
        let mut result = PipelineRunResult {
            pipeline_id: pipeline_id.clone(),
            business_date,
            steps: Vec::new(),
            digest: None,
            status: "running".to_string(),
            error: None,
        };
        info!(
            pipeline_id = %pipeline_id,
            articles = articles.len(),
            %business_date,
            "pipeline started"
        );
        self.store.insert_pipeline_run(&pipeline_id, business_date)?;

        match self
            .run_steps(&pipeline_id, preferences, articles, agent_override, &mut result)
            .await
        {
            Ok(digest) => {
                result.digest = Some(digest);
                result.status = "completed".to_string();
                info!(pipeline_id = %pipeline_id, "pipeline completed");
            }
            Err(error) => {
                result.status = "failed".to_string();
                result.error = Some(error.to_string());
                warn!(pipeline_id = %pipeline_id, %error, "pipeline failed");
            }
        }
        self.store.finish_pipeline_run(
            &pipeline_id,
            &result.status,
            result.error.as_deref(),
        )?;
        Ok(result)
    }

    async fn run_steps(
        &mut self,
        pipeline_id: &str,
        preferences: &UserPreferences,
        articles: &[SourceCorpusEntry],
        agent_override: Option<&str>,
        result: &mut PipelineRunResult,
    ) -> std::result::Result<Value, RecapStepError> {
        let article_entries = to_article_index(articles);
        let article_map: HashMap<String, ArticleIndexEntry> = article_entries
            .iter()
            .map(|entry| (entry.source_id.clone(), entry.clone()))
            .collect();

        // Step 1: classify, one headline file per article.
        self.persist_step(pipeline_id, "recap_classify")?;
        let per_article_files = articles_to_individual_files(articles);
        let classify_tid = self
            .run_llm_step(
                pipeline_id,
                "recap_classify",
                &article_entries,
                preferences,
                per_article_files,
                agent_override,
                result,
            )
            .await?;
        let (kept_ids, enrich_ids) =
            parse_classify_out_files(&self.workdir.results_dir(&classify_tid), articles);
        let kept_entries: Vec<ArticleIndexEntry> = kept_ids
            .iter()
            .filter_map(|source_id| article_map.get(source_id).cloned())
            .collect();
        info!(
            kept = kept_ids.len(),
            discarded = articles.len() - kept_ids.len(),
            enrich = enrich_ids.len(),
            "classify complete"
        );

        // Step 2: load resources for enrich-flagged articles (non-LLM).
        self.persist_step(pipeline_id, "resource_load")?;
        let resource_entries: Vec<ArticleIndexEntry> = enrich_ids
            .iter()
            .filter_map(|source_id| article_map.get(source_id).cloned())
            .collect();
        let loaded_resources = self.load_resources(&resource_entries).await;
        result.steps.push(PipelineStepResult {
            step_name: "resource_load".to_string(),
            task_id: None,
            status: "completed".to_string(),
            error: None,
        });
        self.persist_step_task(pipeline_id, "resource_load", None, "completed")?;

        // Step 3: enrich.
        self.persist_step(pipeline_id, "recap_enrich")?;
        let enrich_tid = self
            .run_llm_step(
                pipeline_id,
                "recap_enrich",
                &kept_entries,
                preferences,
                loaded_resources,
                agent_override,
                result,
            )
            .await?;
        let enriched = parse_enrich_result(&self.read_task_output(&enrich_tid));
        info!(enriched = enriched.len(), "enrich complete");

        // Step 4: group.
        self.persist_step(pipeline_id, "recap_group")?;
        let enriched_entries = merge_enriched_into_index(&kept_entries, &enriched);
        let group_tid = self
            .run_llm_step(
                pipeline_id,
                "recap_group",
                &enriched_entries,
                preferences,
                Vec::new(),
                agent_override,
                result,
            )
            .await?;
        let events = parse_group_result(&self.read_task_output(&group_tid));
        info!(events = events.len(), "group complete");

        // Step 4b: full text for significant events (non-LLM).
        let significant_events = select_significant_events(&events);
        let articles_for_full = articles_needing_full_text(&significant_events, &article_map);
        self.persist_step(pipeline_id, "resource_load_full")?;
        let full_resources = self.load_resources(&articles_for_full).await;

        // Step 4c: enrich-full, only when anything was fetched.
        let enriched_full: HashMap<String, EnrichedArticle> = if full_resources.is_empty() {
            HashMap::new()
        } else {
            self.persist_step(pipeline_id, "recap_enrich_full")?;
            let tid = self
                .run_llm_step(
                    pipeline_id,
                    "recap_enrich_full",
                    &articles_for_full,
                    preferences,
                    full_resources,
                    agent_override,
                    result,
                )
                .await?;
            parse_enrich_result(&self.read_task_output(&tid))
        };

        let event_payloads =
            build_event_payloads(&events, &enriched, &enriched_full, &article_map);

        // Step 5: synthesize, one resource file per event.
        self.persist_step(pipeline_id, "recap_synthesize")?;
        let synth_resources = events_to_resource_files(&event_payloads);
        self.run_llm_step(
            pipeline_id,
            "recap_synthesize",
            &kept_entries,
            preferences,
            synth_resources.clone(),
            agent_override,
            result,
        )
        .await?;

        // Step 6: compose the final digest.
        self.persist_step(pipeline_id, "recap_compose")?;
        let compose_tid = self
            .run_llm_step(
                pipeline_id,
                "recap_compose",
                &kept_entries,
                preferences,
                synth_resources,
                agent_override,
                result,
            )
            .await?;

        Ok(self.read_task_output(&compose_tid))
    }

    /// Enqueue one LLM step task, poll until terminal, return its id.
    #[allow(clippy::too_many_arguments)]
    async fn run_llm_step(
        &mut self,
        pipeline_id: &str,
        step_name: &str,
        article_entries: &[ArticleIndexEntry],
        preferences: &UserPreferences,
        extra_input_files: Vec<(String, Vec<u8>)>,
        agent_override: Option<&str>,
        result: &mut PipelineRunResult,
    ) -> std::result::Result<String, RecapStepError> {
        info!(
            step = step_name,
            articles = article_entries.len(),
            resources = extra_input_files.len(),
            "starting pipeline step"
        );
        let template = prompt_for_task_type(step_name)
            .ok_or_else(|| RecapStepError::new(step_name, "no prompt template"))?;
        let prompt = render_prompt(
            template,
            &preferences.format_for_prompt(),
            preferences.max_headline_chars,
        );
        let schema_hint = schema_for_task_type(step_name);

        let task_id = Uuid::new_v4().to_string();
        let routing = resolve_routing_for_enqueue(
            &self.routing_defaults,
            step_name,
            agent_override,
            None,
            None,
        )
        .map_err(|error| RecapStepError::new(step_name, error.to_string()))?;

        let materialized = self
            .workdir
            .materialize(
                &task_id,
                step_name,
                &TaskInput {
                    task_type: step_name.to_string(),
                    prompt,
                    metadata: serde_json::json!({"routing": routing.to_metadata()}),
                },
                article_entries,
                &MaterializeOptions {
                    extra_input_files,
                    output_schema_hint: schema_hint.map(str::to_string),
                    ..MaterializeOptions::default()
                },
            )
            .map_err(|error| RecapStepError::new(step_name, error.to_string()))?;

        if step_name == "recap_classify" {
            let input_dir = self.workdir.task_dir(&task_id).join("input");
            for (file, content) in [
                ("_discard.txt", &preferences.not_interesting),
                ("_priority.txt", &preferences.interesting),
            ] {
                std::fs::write(input_dir.join(file), content)
                    .map_err(|error| RecapStepError::new(step_name, error.to_string()))?;
            }
        }

        let mut create = LlmTaskCreate::new(
            step_name,
            materialized.manifest_path.display().to_string(),
        );
        create.task_id = Some(task_id.clone());
        create.priority = self.config.task_priority;
        create.max_attempts = self.config.task_max_attempts;
        create.timeout_seconds = self.config.task_timeout_seconds;
        create.output_path = Some(materialized.manifest.output_result_path.clone());
        let task = self
            .store
            .enqueue_task(&create)
            .map_err(|error| RecapStepError::new(step_name, error.to_string()))?;

        self.persist_step_task(pipeline_id, step_name, Some(&task.task_id), "running")?;
        let completed = self.poll_until_done(&task.task_id, step_name).await?;

        if completed.status != LlmTaskStatus::Succeeded {
            let status = completed.status.to_string();
            self.persist_step_task(pipeline_id, step_name, Some(&task.task_id), &status)?;
            result.steps.push(PipelineStepResult {
                step_name: step_name.to_string(),
                task_id: Some(task.task_id.clone()),
                status: status.clone(),
                error: Some(format!("Task {status}")),
            });
            return Err(RecapStepError::new(step_name, format!("task {status}")));
        }

        result.steps.push(PipelineStepResult {
            step_name: step_name.to_string(),
            task_id: Some(task.task_id.clone()),
            status: "completed".to_string(),
            error: None,
        });
        self.persist_step_task(pipeline_id, step_name, Some(&task.task_id), "completed")?;
        info!(step = step_name, task_id = %task.task_id, "pipeline step completed");
        Ok(task_id)
    }

    /// Poll the queue until the task reaches a terminal status.
    async fn poll_until_done(
        &mut self,
        task_id: &str,
        step_name: &str,
    ) -> std::result::Result<LlmTaskView, RecapStepError> {
        let start = std::time::Instant::now();
        loop {
            let details = self
                .store
                .get_task_details(task_id)
                .map_err(|error| RecapStepError::new(step_name, error.to_string()))?;
            if let Some(details) = details {
                if details.task.status.is_terminal() {
                    return Ok(details.task);
                }
            }

            if start.elapsed().as_secs_f64() > self.config.max_poll_seconds {
                return Err(RecapStepError::new(
                    "poll",
                    format!(
                        "task {task_id} did not complete within {}s",
                        self.config.max_poll_seconds
                    ),
                ));
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(
                self.config.poll_interval_seconds,
            ))
            .await;
        }
    }

    /// Fetch full text for the given entries through the resource loader.
    async fn load_resources(&mut self, entries: &[ArticleIndexEntry]) -> Vec<(String, Vec<u8>)> {
        let Some(loader) = &self.resource_loader else {
            return Vec::new();
        };
        if entries.is_empty() {
            return Vec::new();
        }

        info!(total = entries.len(), "loading resources");
        let mut resources = Vec::new();
        let mut failed = 0usize;
        for entry in entries {
            if entry.url.is_empty() {
                continue;
            }
            let loaded = loader.load(&entry.url).await;
            if loaded.is_success && !loaded.text.is_empty() {
                let payload = serde_json::json!({
                    "article_id": entry.source_id,
                    "title": entry.title,
                    "url": entry.url,
                    "source": entry.source,
                    "text": loaded.text,
                    "content_type": loaded.content_type,
                });
                let rendered = serde_json::to_string_pretty(&payload).unwrap_or_default();
                resources.push((
                    format!("{}.json", safe_file_id(&entry.source_id)),
                    rendered.into_bytes(),
                ));
            } else {
                failed += 1;
                warn!(
                    source_id = %entry.source_id,
                    url = %entry.url,
                    error = loaded.error.as_deref().unwrap_or("unknown"),
                    "failed to load resource"
                );
            }
        }
        info!(
            loaded = resources.len(),
            failed, "resource loading finished"
        );
        resources
    }

    fn read_task_output(&self, task_id: &str) -> Value {
        let path: PathBuf = self.workdir.output_result_path(task_id);
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    fn persist_step(
        &mut self,
        pipeline_id: &str,
        step_name: &str,
    ) -> std::result::Result<(), RecapStepError> {
        self.store
            .set_pipeline_step(pipeline_id, step_name)
            .map_err(|error| RecapStepError::new(step_name, error.to_string()))
    }

    fn persist_step_task(
        &mut self,
        pipeline_id: &str,
        step_name: &str,
        task_id: Option<&str>,
        status: &str,
    ) -> std::result::Result<(), RecapStepError> {
        self.store
            .insert_pipeline_task(pipeline_id, step_name, task_id, status)
            .map_err(|error| RecapStepError::new(step_name, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::routing::test_defaults;
    use tempfile::tempdir;

    #[test]
    fn test_preferences_format() {
        let preferences = UserPreferences {
            interesting: "space, energy".to_string(),
            not_interesting: "horoscopes".to_string(),
            ..UserPreferences::default()
        };
        let formatted = preferences.format_for_prompt();
        assert!(formatted.contains("DISCARD these topics (always trash): horoscopes"));
        assert!(formatted.contains("PRIORITY topics"));

        let empty = UserPreferences::default().format_for_prompt();
        assert_eq!(empty, "no specific preferences");
    }

    #[tokio::test]
    async fn test_concurrent_pipeline_rejected() {
        let temp = tempdir().unwrap();
        let mut guard_store = Store::open_default(temp.path().join("recap.db")).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        guard_store.insert_pipeline_run("live-pipeline", date).unwrap();

        let store = Store::open_default(temp.path().join("recap.db")).unwrap();
        let mut runner = RecapPipelineRunner::new(
            store,
            TaskWorkdirManager::new(temp.path().join("workdir")),
            test_defaults().validated().unwrap(),
            None,
            RecapConfig::default(),
        );

        let error = runner
            .run(date, &UserPreferences::default(), &[], None)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("live-pipeline"));
    }
}
