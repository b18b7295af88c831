//! End-to-end tests over the durable queue and the recap pipeline.
//!
//! A scripted agent backend stands in for the real CLI subprocesses; the
//! coordinator and the worker talk only through the shared SQLite queue,
//! exactly as separate processes would.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use newsrecap::orchestrator::contracts::read_manifest;
use newsrecap::recap::resources::{LoadedResource, ResourceLoader};
use newsrecap::recap::{RecapConfig, RecapPipelineRunner, UserPreferences};
use newsrecap::{
    AgentBackend, BackendRunError, BackendRunRequest, BackendRunResult, OrchestratorWorker,
    RoutingDefaults, TaskWorkdirManager, WorkerConfig,
};
use newsstore::{SourceCorpusEntry, Store, UserContext};
use tempfile::tempdir;

fn routing_defaults() -> RoutingDefaults {
    let mut command_templates = std::collections::HashMap::new();
    for agent in ["claude", "codex", "gemini"] {
        command_templates.insert(
            agent.to_string(),
            format!("{agent} --model {{model}} {{prompt}}"),
        );
    }
    let mut models = std::collections::HashMap::new();
    for agent in ["claude", "codex", "gemini"] {
        let mut profiles = std::collections::HashMap::new();
        profiles.insert("fast".to_string(), format!("{agent}-fast"));
        profiles.insert("quality".to_string(), format!("{agent}-quality"));
        models.insert(agent.to_string(), profiles);
    }
    RoutingDefaults {
        default_agent: "codex".to_string(),
        task_type_profile_map: std::collections::HashMap::new(),
        command_templates,
        models,
    }
    .validated()
    .unwrap()
}

/// Plays each recap step by task type, writing the contract files a real
/// agent would produce.
struct RecapScriptBackend;

#[async_trait]
impl AgentBackend for RecapScriptBackend {
    async fn run(
        &self,
        request: &BackendRunRequest,
    ) -> Result<BackendRunResult, BackendRunError> {
        let manifest = read_manifest(&request.manifest_path)
            .map_err(|error| BackendRunError::terminal(error.to_string()))?;
        let stdout_path = PathBuf::from(&manifest.output_stdout_path);
        let stderr_path = PathBuf::from(&manifest.output_stderr_path);
        std::fs::write(&stdout_path, "total_tokens: 42").unwrap();
        std::fs::write(&stderr_path, "").unwrap();

        let result_payload = match manifest.task_type.as_str() {
            "recap_classify" => {
                let resources_dir = PathBuf::from(manifest.input_resources_dir.as_ref().unwrap());
                let results_dir = PathBuf::from(manifest.output_results_dir.as_ref().unwrap());
                for entry in std::fs::read_dir(&resources_dir).unwrap() {
                    let name = entry.unwrap().file_name().into_string().unwrap();
                    let Some(stem) = name.strip_suffix("_in.txt") else {
                        continue;
                    };
                    let verdict = if stem.ends_with("_b") {
                        "enrich"
                    } else if stem.ends_with("_c") {
                        "trash"
                    } else {
                        "ok"
                    };
                    std::fs::write(results_dir.join(format!("{stem}_out.txt")), verdict).unwrap();
                }
                serde_json::json!({"status": "done"})
            }
            "recap_enrich" => serde_json::json!({
                "enriched": [{
                    "article_id": "article:b",
                    "new_title": "Enriched headline B",
                    "clean_text": "full fetched text of b",
                }]
            }),
            "recap_group" => serde_json::json!({
                "events": [{
                    "event_id": "evt_1",
                    "title": "Shared event",
                    "significance": "high",
                    "article_ids": ["article:a", "article:b"],
                    "topic_tags": ["world"],
                }]
            }),
            "recap_enrich_full" => serde_json::json!({
                "enriched": [{
                    "article_id": "article:a",
                    "new_title": "Full headline A",
                    "clean_text": "full fetched text of a",
                }]
            }),
            "recap_synthesize" => {
                let results_dir = PathBuf::from(manifest.output_results_dir.as_ref().unwrap());
                std::fs::write(
                    results_dir.join("event_evt_1.json"),
                    serde_json::json!({
                        "event_id": "evt_1",
                        "synthesis": "combined narrative",
                        "summary": "short overview",
                        "key_facts": ["fact one"],
                        "sources_used": ["article:a", "article:b"],
                    })
                    .to_string(),
                )
                .unwrap();
                serde_json::json!({"status": "completed", "processed": 1})
            }
            "recap_compose" => serde_json::json!({
                "theme_blocks": [{
                    "theme": "World",
                    "recaps": [{
                        "headline": "Shared event resolved",
                        "body": "factual description",
                        "sources": [{"title": "A", "url": "https://example.com/a"}],
                    }],
                }],
                "meta": {"total_events": 1, "total_themes": 1, "date": "2026-03-01"},
            }),
            other => {
                return Err(BackendRunError::terminal(format!(
                    "unexpected task type: {other}"
                )));
            }
        };
        std::fs::write(
            &manifest.output_result_path,
            serde_json::to_string_pretty(&result_payload).unwrap(),
        )
        .unwrap();

        Ok(BackendRunResult {
            exit_code: 0,
            timed_out: false,
            stdout_path,
            stderr_path,
        })
    }
}

struct StaticTextLoader;

#[async_trait]
impl ResourceLoader for StaticTextLoader {
    async fn load(&self, url: &str) -> LoadedResource {
        LoadedResource {
            url: url.to_string(),
            text: format!("fetched body for {url}"),
            content_type: "text/html".to_string(),
            is_success: true,
            error: None,
        }
    }
}

fn corpus_entry(letter: &str) -> SourceCorpusEntry {
    SourceCorpusEntry {
        source_id: format!("article:{letter}"),
        article_id: letter.to_string(),
        title: format!("Headline {letter}"),
        url: format!("https://example.com/{letter}"),
        source: "example.com".to_string(),
        published_at: Utc::now(),
        clean_text: format!("short text {letter}"),
    }
}

#[tokio::test]
async fn test_recap_pipeline_end_to_end() {
    let temp = tempdir().unwrap();
    let db_path = temp.path().join("integration.db");
    let workdir_root = temp.path().join("workdir");

    // Worker drains the shared queue in the background.
    let worker_store = Store::open(&db_path, UserContext::default()).unwrap();
    let mut worker = OrchestratorWorker::new(
        worker_store,
        RecapScriptBackend,
        routing_defaults(),
        WorkerConfig {
            worker_id: "integration-worker".to_string(),
            poll_interval_seconds: 0.0,
            ..WorkerConfig::default()
        },
    );
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match worker.run_once().await {
                Ok(summary) if summary.processed == 0 => {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                Ok(_) => {}
                Err(error) => panic!("worker error: {error}"),
            }
        }
    });

    let runner_store = Store::open(&db_path, UserContext::default()).unwrap();
    let mut runner = RecapPipelineRunner::new(
        runner_store,
        TaskWorkdirManager::new(&workdir_root),
        routing_defaults(),
        Some(Box::new(StaticTextLoader)),
        RecapConfig {
            poll_interval_seconds: 0.05,
            max_poll_seconds: 30.0,
            ..RecapConfig::default()
        },
    );

    let articles = vec![corpus_entry("a"), corpus_entry("b"), corpus_entry("c")];
    let business_date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let result = runner
        .run(business_date, &UserPreferences::default(), &articles, None)
        .await
        .unwrap();

    let _ = stop_tx.send(true);
    worker_handle.await.unwrap();

    assert_eq!(result.status, "completed", "error: {:?}", result.error);
    let digest = result.digest.unwrap();
    assert_eq!(digest["theme_blocks"][0]["theme"], "World");

    let step_names: Vec<&str> = result
        .steps
        .iter()
        .map(|step| step.step_name.as_str())
        .collect();
    assert_eq!(
        step_names,
        vec![
            "recap_classify",
            "resource_load",
            "recap_enrich",
            "recap_group",
            "recap_enrich_full",
            "recap_synthesize",
            "recap_compose",
        ]
    );
    assert!(result.steps.iter().all(|step| step.status == "completed"));

    // All queue tasks succeeded and none produced citation snapshots.
    let mut check_store = Store::open(&db_path, UserContext::default()).unwrap();
    let tasks = check_store.list_tasks(None, 50).unwrap();
    assert_eq!(tasks.len(), 6);
    for task in &tasks {
        assert_eq!(task.status, newsstore::LlmTaskStatus::Succeeded);
        assert!(check_store
            .list_output_citations(&task.task_id)
            .unwrap()
            .is_empty());
        assert_eq!(check_store.count_attempts(&task.task_id).unwrap(), 1);
    }

    // Pipeline run row reached its terminal state.
    assert!(check_store
        .active_pipeline_run(chrono::Duration::minutes(30))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_citation_snapshots_survive_article_gc() {
    let temp = tempdir().unwrap();
    let db_path = temp.path().join("citations.db");
    let mut store = Store::open(&db_path, UserContext::default()).unwrap();

    // Ingest one article so the citation can reference a real row.
    let run_id = store.start_run("rss", chrono::Duration::minutes(30)).unwrap();
    let article = newsstore::NormalizedArticle {
        source_name: "rss".to_string(),
        external_id: "stable-1".to_string(),
        url: "https://example.com/one".to_string(),
        url_canonical: "https://example.com/one".to_string(),
        url_hash: "hash-one".to_string(),
        title: "Cited article".to_string(),
        source_domain: "example.com".to_string(),
        published_at: Utc::now(),
        language_detected: "en".to_string(),
        content_raw: None,
        summary_raw: Some("text".to_string()),
        is_full_content: false,
        needs_enrichment: true,
        clean_text: "text".to_string(),
        clean_text_chars: 4,
        is_truncated: false,
    };
    let upserted = store.upsert_article(&article, &run_id).unwrap();

    // A succeeded task snapshots the citation.
    let mut create = newsstore::LlmTaskCreate::new("highlights", "/tmp/manifest.json");
    create.task_id = Some("cited-task".to_string());
    store.enqueue_task(&create).unwrap();
    store.claim_next_ready_task("worker-1").unwrap().unwrap();
    store
        .complete_task(
            "cited-task",
            "/tmp/out.json",
            &[newsstore::OutputCitationWrite {
                source_id: format!("article:{}", upserted.article_id),
                article_id: Some(upserted.article_id.clone()),
                title: "Cited article".to_string(),
                url: "https://example.com/one".to_string(),
                source: "example.com".to_string(),
                published_at: None,
            }],
        )
        .unwrap();

    // Retention drops the user link; GC purges the article itself.
    let future = Utc::now() + chrono::Duration::days(1);
    store.prune_articles(future, false).unwrap();
    let gc = store.gc_unreferenced_articles(false).unwrap();
    assert_eq!(gc.articles_deleted, 1);

    // The snapshot is orphan-safe and still readable.
    let citations = store.list_output_citations("cited-task").unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].title, "Cited article");
    assert_eq!(citations[0].article_id.as_deref(), Some(upserted.article_id.as_str()));
}
