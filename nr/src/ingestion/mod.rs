//! Ingestion pipeline orchestration
//!
//! Sequences one daily run: fetch/backfill chains seeded from open gaps,
//! normalization and upsert per article, page checkpoints, then the dedup
//! stage. The run record carries heartbeats and counters throughout; any
//! stage error finalizes the run as failed and propagates.

pub mod cleaning;
pub mod dedup;
pub mod normalize;
pub mod rss;

use std::collections::HashSet;

use chrono::Duration;
use eyre::Result;
use newsstore::{GapWrite, IngestionRunCounters, RunStatus, Store, UpsertAction};
use tracing::{info, warn};

use dedup::DedupStage;
use normalize::ArticleNormalizer;
use rss::{SourceAdapter, SourceError};

/// Ingestion pipeline tunables.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub page_size: usize,
    /// Per-chain page budget; 0 means unlimited.
    pub max_pages: i64,
    pub active_run_stale_after: Duration,
    pub backfill_max_gaps: i64,
    pub clean_text_max_chars: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 0,
            active_run_stale_after: Duration::seconds(1_800),
            backfill_max_gaps: 10,
            clean_text_max_chars: 12_000,
        }
    }
}

/// Result of one ingestion pipeline run.
#[derive(Debug, Clone)]
pub struct IngestionSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: IngestionRunCounters,
}

#[derive(Debug, Clone)]
struct SeedCursor {
    cursor: Option<String>,
    gap_id: Option<i64>,
}

/// Coordinates the fetch and dedup stages under one run lifecycle.
pub struct IngestionOrchestrator<S: SourceAdapter> {
    store: Store,
    source: S,
    normalizer: ArticleNormalizer,
    dedup: DedupStage,
    config: IngestionConfig,
}

impl<S: SourceAdapter> IngestionOrchestrator<S> {
    pub fn new(store: Store, source: S, dedup: DedupStage, config: IngestionConfig) -> Self {
        let normalizer = ArticleNormalizer::new(source.name(), config.clean_text_max_chars);
        Self {
            store,
            source,
            normalizer,
            dedup,
            config,
        }
    }

    /// Run the full daily pipeline. Final status is `partial` iff any gap
    /// was opened; an uncaught error finalizes the run as `failed` and is
    /// re-raised.
    pub async fn run_daily(&mut self) -> Result<IngestionSummary> {
        let mut counters = IngestionRunCounters::default();
        let run_id = self
            .store
            .start_run(self.source.name(), self.config.active_run_stale_after)?;
        info!(run_id = %run_id, source = self.source.name(), "ingestion run started");

        match self.run_stages(&run_id, &mut counters).await {
            Ok(()) => {
                let status = if counters.gaps_opened > 0 {
                    RunStatus::Partial
                } else {
                    RunStatus::Succeeded
                };
                self.store.finish_run(&run_id, status, &counters, None)?;
                info!(
                    run_id = %run_id,
                    status = %status,
                    ingested = counters.ingested,
                    updated = counters.updated,
                    skipped = counters.skipped,
                    "ingestion run finished"
                );
                Ok(IngestionSummary {
                    run_id,
                    status,
                    counters,
                })
            }
            Err(error) => {
                self.store.finish_run(
                    &run_id,
                    RunStatus::Failed,
                    &counters,
                    Some(&error.to_string()),
                )?;
                Err(error)
            }
        }
    }

    async fn run_stages(
        &mut self,
        run_id: &str,
        counters: &mut IngestionRunCounters,
    ) -> Result<()> {
        self.store.touch_run(run_id)?;
        self.fetch_stage(run_id, counters).await?;
        self.store.touch_run(run_id)?;
        self.dedup.run(&mut self.store, run_id, counters)?;
        Ok(())
    }

    async fn fetch_stage(
        &mut self,
        run_id: &str,
        counters: &mut IngestionRunCounters,
    ) -> Result<()> {
        self.source.begin_run();

        let open_gaps = self
            .store
            .list_open_gaps(self.source.name(), self.config.backfill_max_gaps)?;
        let mut seeds: Vec<SeedCursor> = open_gaps
            .iter()
            .map(|gap| SeedCursor {
                cursor: gap.from_cursor_or_time.clone(),
                gap_id: Some(gap.gap_id),
            })
            .collect();
        if seeds.iter().all(|seed| seed.cursor.is_some()) {
            seeds.push(SeedCursor {
                cursor: None,
                gap_id: None,
            });
        }

        let mut seen_cursors: HashSet<Option<String>> = HashSet::new();
        for seed in seeds {
            self.drain_chain(run_id, seed, &mut seen_cursors, counters)
                .await?;
        }
        Ok(())
    }

    async fn drain_chain(
        &mut self,
        run_id: &str,
        seed: SeedCursor,
        seen_cursors: &mut HashSet<Option<String>>,
        counters: &mut IngestionRunCounters,
    ) -> Result<()> {
        let mut cursor = seed.cursor.clone();
        let mut pages_left = self.config.max_pages;
        let unlimited = pages_left <= 0;
        let mut gap_resolved = false;

        while unlimited || pages_left > 0 {
            if seen_cursors.contains(&cursor) {
                break;
            }
            seen_cursors.insert(cursor.clone());
            if !unlimited {
                pages_left -= 1;
            }

            self.store.touch_run(run_id)?;
            let page = match self
                .source
                .fetch_page(cursor.as_deref(), self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(SourceError::Temporary {
                    message,
                    code,
                    retry_after,
                    from_cursor,
                    to_cursor,
                }) => {
                    warn!(
                        source = self.source.name(),
                        code,
                        message,
                        "temporary source error; opening gap"
                    );
                    self.store.create_gap(
                        run_id,
                        self.source.name(),
                        &GapWrite {
                            from_cursor_or_time: from_cursor.or_else(|| cursor.clone()),
                            to_cursor_or_time: to_cursor,
                            error_code: code,
                            retry_after,
                        },
                    )?;
                    counters.gaps_opened += 1;
                    break;
                }
                Err(error) => return Err(error.into()),
            };

            if let Some(gap_id) = seed.gap_id {
                if !gap_resolved {
                    self.store.resolve_gap(gap_id)?;
                    gap_resolved = true;
                }
            }

            for source_article in &page.articles {
                let normalized = self.normalizer.normalize(source_article);
                let result = self.store.upsert_article(&normalized, run_id)?;
                self.store.upsert_raw_article(
                    self.source.name(),
                    &source_article.external_id,
                    &source_article.raw_payload,
                    Some(&result.article_id),
                )?;
                match result.action {
                    UpsertAction::Inserted => counters.ingested += 1,
                    UpsertAction::Updated => counters.updated += 1,
                    UpsertAction::Skipped => counters.skipped += 1,
                }
            }

            self.source.mark_page_processed(page.next_cursor.as_deref())?;
            self.store.touch_run(run_id)?;

            cursor = page.next_cursor.clone();
            if cursor.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dedup::{DedupStageConfig, HashingEmbedder};
    use newsstore::{SourceArticle, SourcePage};
    use serde_json::json;
    use tempfile::tempdir;

    struct ScriptedSource {
        pages: Vec<Result<SourcePage, (String, Option<String>)>>,
        calls: usize,
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn name(&self) -> &'static str {
            "rss"
        }

        fn begin_run(&mut self) {}

        async fn fetch_page(
            &mut self,
            cursor: Option<&str>,
            _limit: usize,
        ) -> Result<SourcePage, SourceError> {
            let index = self.calls;
            self.calls += 1;
            match self.pages.get(index) {
                Some(Ok(page)) => {
                    let mut page = page.clone();
                    page.cursor = cursor.map(str::to_string);
                    Ok(page)
                }
                Some(Err((code, to_cursor))) => Err(SourceError::Temporary {
                    message: format!("Temporary RSS HTTP error: {code}"),
                    code: code.clone(),
                    retry_after: Some(30),
                    from_cursor: None,
                    to_cursor: to_cursor.clone(),
                }),
                None => Ok(SourcePage {
                    articles: Vec::new(),
                    next_cursor: None,
                    cursor: cursor.map(str::to_string),
                }),
            }
        }

        fn mark_page_processed(&mut self, _next_cursor: Option<&str>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn source_article(external_id: &str) -> SourceArticle {
        source_article_at(external_id, chrono::Utc::now())
    }

    fn source_article_at(
        external_id: &str,
        published_at: chrono::DateTime<chrono::Utc>,
    ) -> SourceArticle {
        SourceArticle {
            external_id: external_id.to_string(),
            url: format!("https://example.com/{external_id}"),
            title: format!("Headline {external_id}"),
            source: "Example".to_string(),
            published_at,
            content: Some(format!("<p>body of {external_id}</p>")),
            summary: None,
            raw_payload: json!({"id": external_id}),
        }
    }

    fn orchestrator(
        dir: &std::path::Path,
        pages: Vec<Result<SourcePage, (String, Option<String>)>>,
    ) -> IngestionOrchestrator<ScriptedSource> {
        let store = Store::open_default(dir.join("ingest.db")).unwrap();
        let dedup = DedupStage::new(
            DedupStageConfig {
                model_name: "hash-test".to_string(),
                ..DedupStageConfig::default()
            },
            Box::new(HashingEmbedder::new("hash-test")),
        );
        IngestionOrchestrator::new(
            store,
            ScriptedSource { pages, calls: 0 },
            dedup,
            IngestionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_run_daily_ingests_pages_and_succeeds() {
        let temp = tempdir().unwrap();
        let pages = vec![
            Ok(SourcePage {
                articles: vec![source_article("a"), source_article("b")],
                next_cursor: Some("2".to_string()),
                cursor: None,
            }),
            Ok(SourcePage {
                articles: vec![source_article("c")],
                next_cursor: None,
                cursor: None,
            }),
        ];
        let mut orchestrator = orchestrator(temp.path(), pages);
        let summary = orchestrator.run_daily().await.unwrap();

        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.counters.ingested, 3);
        assert_eq!(summary.counters.gaps_opened, 0);
        // Three singleton clusters from distinct headlines.
        assert_eq!(summary.counters.dedup_clusters, 3);
        assert_eq!(summary.counters.dedup_duplicates, 0);
    }

    #[tokio::test]
    async fn test_temporary_error_opens_gap_and_run_is_partial() {
        let temp = tempdir().unwrap();
        let pages = vec![Err(("503".to_string(), Some("40".to_string())))];
        let mut orchestrator = orchestrator(temp.path(), pages);
        let summary = orchestrator.run_daily().await.unwrap();

        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.counters.gaps_opened, 1);

        let gaps = orchestrator.store.list_open_gaps("rss", 10).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].error_code, "503");
        assert_eq!(gaps[0].retry_after, Some(30));
        assert_eq!(gaps[0].to_cursor_or_time.as_deref(), Some("40"));
    }

    #[tokio::test]
    async fn test_gap_seed_resolves_after_successful_page() {
        let temp = tempdir().unwrap();
        let pages = vec![
            // First chain drains the gap seed.
            Ok(SourcePage {
                articles: vec![source_article("a")],
                next_cursor: None,
                cursor: None,
            }),
            // Sentinel nil chain.
            Ok(SourcePage {
                articles: Vec::new(),
                next_cursor: None,
                cursor: None,
            }),
        ];
        let mut orchestrator = orchestrator(temp.path(), pages);

        // Seed an open gap from a previous failed run.
        let prior_run = orchestrator
            .store
            .start_run("rss", Duration::minutes(30))
            .unwrap();
        orchestrator
            .store
            .create_gap(
                &prior_run,
                "rss",
                &GapWrite {
                    from_cursor_or_time: Some("10".to_string()),
                    to_cursor_or_time: None,
                    error_code: "503".to_string(),
                    retry_after: None,
                },
            )
            .unwrap();
        orchestrator
            .store
            .finish_run(
                &prior_run,
                RunStatus::Partial,
                &IngestionRunCounters::default(),
                None,
            )
            .unwrap();

        let summary = orchestrator.run_daily().await.unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert!(orchestrator.store.list_open_gaps("rss", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_same_snapshot_is_idempotent() {
        let temp = tempdir().unwrap();
        let published: chrono::DateTime<chrono::Utc> =
            "2026-03-01T10:00:00Z".parse().unwrap();
        let page = SourcePage {
            articles: vec![
                source_article_at("a", published),
                source_article_at("b", published),
            ],
            next_cursor: None,
            cursor: None,
        };

        let mut first = orchestrator(temp.path(), vec![Ok(page.clone())]);
        let summary = first.run_daily().await.unwrap();
        assert_eq!(summary.counters.ingested, 2);
        drop(first);

        let mut second = orchestrator(temp.path(), vec![Ok(page)]);
        let summary = second.run_daily().await.unwrap();
        assert_eq!(summary.counters.ingested, 0);
        assert_eq!(summary.counters.skipped, 2);
    }
}
