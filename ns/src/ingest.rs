//! Ingestion store operations
//!
//! Runs, gaps, article upsert with identity reconciliation, raw payloads,
//! feed HTTP cache, processing snapshots, embeddings, cluster persistence,
//! retention prune, and global GC. Every method is one transaction.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{
    AltSource, ClusterListResult, ClusterMemberPreview, ClusterPreview, DedupCandidate,
    DedupCluster, GapStatus, GapWrite, GlobalGcResult, IngestionGap, IngestionRunCounters,
    IngestionRunView, IngestionWindowStats, NormalizedArticle, RetentionPruneResult, RunStatus,
    SourceCorpusEntry, UpsertAction, UpsertResult,
};
use crate::store::{now, pack_vector, parse_ts, parse_ts_opt, ts, unpack_vector, Store};

const GENERATED_ID_PREFIX: &str = "generated:";

/// Payload for one cached article resource row.
#[derive(Debug, Clone)]
pub struct ArticleResourceWrite {
    pub url_hash: String,
    pub url_canonical: String,
    pub fetch_status: String,
    pub http_status: Option<i64>,
    pub content_text: Option<String>,
    pub error_code: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Stored article resource row.
#[derive(Debug, Clone)]
pub struct ArticleResourceView {
    pub user_id: Option<String>,
    pub url_hash: String,
    pub url_canonical: String,
    pub fetch_status: String,
    pub http_status: Option<i64>,
    pub content_text: Option<String>,
    pub error_code: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Start a new ingestion run, auto-recovering a stale `running` row.
    pub fn start_run(&mut self, source: &str, stale_after: Duration) -> Result<String> {
        if stale_after <= Duration::zero() {
            return Err(StoreError::Invalid("stale_after must be > 0".to_string()));
        }

        loop {
            let run_id = Uuid::new_v4().to_string();
            let started = ts(now());
            let tx = self.conn.transaction()?;
            let insert = tx.execute(
                "INSERT INTO ingestion_runs (run_id, user_id, source, status, started_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![run_id, self.user_id, source, RunStatus::Running.as_str(), started],
            );
            match insert {
                Ok(_) => {
                    tx.commit()?;
                    return Ok(run_id);
                }
                Err(error) => {
                    let store_error = StoreError::from(error);
                    if !store_error.is_constraint_violation() {
                        return Err(store_error);
                    }
                }
            }
            drop(tx);

            // Lost to an existing running row; recover it when stale.
            let tx = self.conn.transaction()?;
            let active: Option<(String, Option<String>, String)> = tx
                .query_row(
                    "SELECT run_id, heartbeat_at, started_at FROM ingestion_runs
                     WHERE user_id = ?1 AND source = ?2 AND status = 'running'",
                    params![self.user_id, source],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((active_run_id, heartbeat_at, started_at)) = active else {
                // Row vanished between attempts; retry the insert.
                continue;
            };
            let heartbeat_raw = heartbeat_at.unwrap_or(started_at);
            let heartbeat = parse_ts("heartbeat_at", &heartbeat_raw)?;
            if now() - heartbeat > stale_after {
                let reclaimed = ts(now());
                tx.execute(
                    "UPDATE ingestion_runs
                     SET status = 'failed', finished_at = ?1, heartbeat_at = ?1,
                         error_summary = 'Auto-recovered stale running run after crash/interruption.'
                     WHERE run_id = ?2 AND user_id = ?3 AND status = 'running'",
                    params![reclaimed, active_run_id, self.user_id],
                )?;
                tx.commit()?;
                warn!(
                    source,
                    stale_run_id = %active_run_id,
                    stale_heartbeat_at = %heartbeat_raw,
                    "Recovered stale running ingestion run and starting a new one"
                );
                continue;
            }

            return Err(StoreError::RunAlreadyActive {
                source_name: source.to_string(),
                run_id: active_run_id,
                heartbeat_at: heartbeat_raw,
            });
        }
    }

    /// Refresh the heartbeat of a still-running run; no-op otherwise.
    pub fn touch_run(&mut self, run_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE ingestion_runs SET heartbeat_at = ?1
             WHERE run_id = ?2 AND user_id = ?3 AND status = 'running'",
            params![ts(now()), run_id, self.user_id],
        )?;
        Ok(())
    }

    /// Write terminal status and counters in one transaction.
    pub fn finish_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        counters: &IngestionRunCounters,
        error_summary: Option<&str>,
    ) -> Result<()> {
        let finished = ts(now());
        let changed = self.conn.execute(
            "UPDATE ingestion_runs
             SET status = ?1, finished_at = ?2, heartbeat_at = ?2,
                 ingested_count = ?3, updated_count = ?4, skipped_count = ?5,
                 dedup_clusters_count = ?6, dedup_duplicates_count = ?7,
                 gaps_opened_count = ?8, error_summary = ?9
             WHERE run_id = ?10 AND user_id = ?11",
            params![
                status.as_str(),
                finished,
                counters.ingested,
                counters.updated,
                counters.skipped,
                counters.dedup_clusters,
                counters.dedup_duplicates,
                counters.gaps_opened,
                error_summary,
                run_id,
                self.user_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Aggregate run counters for a time window.
    pub fn summarize_runs(
        &mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<IngestionWindowStats> {
        let mut stmt = self.conn.prepare(
            "SELECT status, ingested_count, updated_count, skipped_count,
                    dedup_clusters_count, dedup_duplicates_count, gaps_opened_count, source
             FROM ingestion_runs
             WHERE user_id = ?1 AND started_at >= ?2 AND started_at < ?3",
        )?;
        let rows = stmt.query_map(params![self.user_id, ts(since), ts(until)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut summary = IngestionWindowStats::default();
        for row in rows {
            let (status, ingested, updated, skipped, clusters, duplicates, gaps, row_source) =
                row?;
            if let Some(wanted) = source {
                if row_source != wanted {
                    continue;
                }
            }
            summary.runs += 1;
            summary.ingested += ingested;
            summary.updated += updated;
            summary.skipped += skipped;
            summary.dedup_clusters += clusters;
            summary.dedup_duplicates += duplicates;
            summary.gaps_opened += gaps;
            match RunStatus::parse(&status) {
                Some(RunStatus::Succeeded) => summary.succeeded_runs += 1,
                Some(RunStatus::Partial) => summary.partial_runs += 1,
                Some(RunStatus::Failed) => summary.failed_runs += 1,
                _ => summary.other_runs += 1,
            }
        }
        Ok(summary)
    }

    pub fn list_recent_runs(
        &mut self,
        limit: i64,
        source: Option<&str>,
    ) -> Result<Vec<IngestionRunView>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, source, status, started_at, finished_at,
                    ingested_count, updated_count, skipped_count,
                    dedup_clusters_count, dedup_duplicates_count, gaps_opened_count
             FROM ingestion_runs
             WHERE user_id = ?1 AND (?2 IS NULL OR source = ?2)
             ORDER BY started_at DESC, run_id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![self.user_id, source, limit.max(1)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, i64>(10)?,
            ))
        })?;

        let mut views = Vec::new();
        for row in rows {
            let (
                run_id,
                row_source,
                status,
                started_at,
                finished_at,
                ingested,
                updated,
                skipped,
                clusters,
                duplicates,
                gaps,
            ) = row?;
            views.push(IngestionRunView {
                run_id,
                source: row_source,
                status,
                started_at: parse_ts("started_at", &started_at)?,
                finished_at: parse_ts_opt("finished_at", finished_at)?,
                counters: IngestionRunCounters {
                    ingested,
                    updated,
                    skipped,
                    dedup_clusters: clusters,
                    dedup_duplicates: duplicates,
                    gaps_opened: gaps,
                },
            });
        }
        Ok(views)
    }

    pub fn latest_run_id(&mut self, source: Option<&str>) -> Result<Option<String>> {
        let run_id = self
            .conn
            .query_row(
                "SELECT run_id FROM ingestion_runs
                 WHERE user_id = ?1 AND (?2 IS NULL OR source = ?2)
                 ORDER BY started_at DESC, run_id DESC LIMIT 1",
                params![self.user_id, source],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    pub fn create_gap(&mut self, run_id: &str, source: &str, gap: &GapWrite) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO ingestion_gaps
             (user_id, run_id, source, from_cursor_or_time, to_cursor_or_time,
              error_code, retry_after, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8)",
            params![
                self.user_id,
                run_id,
                source,
                gap.from_cursor_or_time,
                gap.to_cursor_or_time,
                gap.error_code,
                gap.retry_after,
                ts(now()),
            ],
        )?;
        let gap_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(gap_id)
    }

    pub fn list_open_gaps(&mut self, source: &str, limit: i64) -> Result<Vec<IngestionGap>> {
        let mut stmt = self.conn.prepare(
            "SELECT gap_id, source, from_cursor_or_time, to_cursor_or_time,
                    error_code, retry_after, status
             FROM ingestion_gaps
             WHERE user_id = ?1 AND source = ?2 AND status = 'open'
             ORDER BY gap_id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![self.user_id, source, limit], |row| {
            Ok(IngestionGap {
                gap_id: row.get(0)?,
                source: row.get(1)?,
                from_cursor_or_time: row.get(2)?,
                to_cursor_or_time: row.get(3)?,
                error_code: row.get(4)?,
                retry_after: row.get(5)?,
                status: GapStatus::parse(&row.get::<_, String>(6)?).unwrap_or(GapStatus::Open),
            })
        })?;
        let mut gaps = Vec::new();
        for row in rows {
            gaps.push(row?);
        }
        Ok(gaps)
    }

    pub fn resolve_gap(&mut self, gap_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE ingestion_gaps SET status = 'resolved', resolved_at = ?1
             WHERE gap_id = ?2 AND user_id = ?3",
            params![ts(now()), gap_id, self.user_id],
        )?;
        Ok(())
    }

    /// Persist a normalized article with identity reconciliation.
    ///
    /// Resolution order: alias table, then (for generated external ids)
    /// canonical URL, then the `source|url_hash|published_at` fallback key.
    /// A generated external id is promoted to a stable one when both map to
    /// the same row.
    pub fn upsert_article(
        &mut self,
        article: &NormalizedArticle,
        run_id: &str,
    ) -> Result<UpsertResult> {
        let user_id = self.user_id.clone();
        let mut tx = self.conn.transaction()?;

        let mut inserted_article = false;
        let existing = match find_existing_article(&tx, article)? {
            Some(row) => Some(row),
            None => match try_insert_article(&mut tx, article, run_id)? {
                Some(article_id) => {
                    inserted_article = true;
                    fetch_article_row(&tx, &article_id)?
                }
                None => find_existing_article(&tx, article)?,
            },
        };
        let existing = existing.ok_or_else(|| {
            StoreError::Invalid("failed to resolve article after insertion conflict".to_string())
        })?;

        ensure_external_alias(
            &tx,
            &article.source_name,
            &article.external_id,
            &existing.article_id,
        )?;

        let target_fallback_key =
            target_fallback_key(article, existing.fallback_key.as_deref());
        let row_changed = row_changed(&existing, article, target_fallback_key.as_deref());

        if row_changed {
            let promote = is_generated_external_id(&existing.external_id)
                && !is_generated_external_id(&article.external_id);
            let external_id = if promote {
                article.external_id.as_str()
            } else {
                existing.external_id.as_str()
            };
            tx.execute(
                "UPDATE articles SET
                     external_id = ?1, url = ?2, url_canonical = ?3, url_hash = ?4,
                     title = ?5, source_domain = ?6, published_at = ?7,
                     language_detected = ?8, content_raw = ?9, summary_raw = ?10,
                     is_full_content = ?11, clean_text = ?12, clean_text_chars = ?13,
                     is_truncated = ?14, fallback_key = ?15, last_processed_run_id = ?16
                 WHERE article_id = ?17",
                params![
                    external_id,
                    article.url,
                    article.url_canonical,
                    article.url_hash,
                    article.title,
                    article.source_domain,
                    ts(article.published_at),
                    article.language_detected,
                    article.content_raw,
                    article.summary_raw,
                    article.is_full_content,
                    article.clean_text,
                    article.clean_text_chars,
                    article.is_truncated,
                    target_fallback_key,
                    run_id,
                    existing.article_id,
                ],
            )?;
        }

        let user_link_inserted = ensure_user_article_link(&tx, &user_id, &existing.article_id)?;
        tx.commit()?;

        let action = if user_link_inserted {
            UpsertAction::Inserted
        } else if inserted_article || row_changed {
            UpsertAction::Updated
        } else {
            UpsertAction::Skipped
        };
        Ok(UpsertResult {
            article_id: existing.article_id,
            action,
        })
    }

    /// Keep the original unparsed feed payload, one row per article.
    pub fn upsert_raw_article(
        &mut self,
        source_name: &str,
        external_id: &str,
        raw_payload: &serde_json::Value,
        article_id: Option<&str>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let resolved: Option<String> = match article_id {
            Some(id) => Some(id.to_string()),
            None => tx
                .query_row(
                    "SELECT article_id FROM article_external_ids
                     WHERE source_name = ?1 AND external_id = ?2",
                    params![source_name, external_id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        let Some(resolved) = resolved else {
            return Ok(());
        };

        let raw_json =
            serde_json::to_string(raw_payload).map_err(|source| StoreError::Json {
                context: "articles_raw.raw_json",
                source,
            })?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT article_id FROM articles_raw
                 WHERE source_name = ?1 AND external_id = ?2",
                params![source_name, external_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => {
                tx.execute(
                    "INSERT INTO articles_raw
                     (article_id, source_name, external_id, raw_json, first_seen_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![resolved, source_name, external_id, raw_json, ts(now())],
                )?;
            }
            Some(current) if current != resolved => {
                tx.execute(
                    "UPDATE articles_raw SET article_id = ?1
                     WHERE source_name = ?2 AND external_id = ?3",
                    params![resolved, source_name, external_id],
                )?;
            }
            Some(_) => {}
        }
        tx.commit()?;
        Ok(())
    }

    /// Per-user retention: drop user links (and private resources) older
    /// than the cutoff. Shared article rows are left to the global GC.
    pub fn prune_articles(
        &mut self,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<RetentionPruneResult> {
        let cutoff_db = ts(cutoff);
        let tx = self.conn.transaction()?;
        let articles_deleted: i64 = tx.query_row(
            "SELECT COUNT(*) FROM user_articles WHERE user_id = ?1 AND discovered_at < ?2",
            params![self.user_id, cutoff_db],
            |row| row.get(0),
        )?;
        let private_resources_deleted: i64 = tx.query_row(
            "SELECT COUNT(*) FROM article_resources WHERE user_id = ?1 AND updated_at < ?2",
            params![self.user_id, cutoff_db],
            |row| row.get(0),
        )?;
        if !dry_run {
            tx.execute(
                "DELETE FROM user_articles WHERE user_id = ?1 AND discovered_at < ?2",
                params![self.user_id, cutoff_db],
            )?;
            tx.execute(
                "DELETE FROM article_resources WHERE user_id = ?1 AND updated_at < ?2",
                params![self.user_id, cutoff_db],
            )?;
            tx.commit()?;
        }
        Ok(RetentionPruneResult {
            cutoff,
            dry_run,
            articles_deleted,
            private_resources_deleted,
        })
    }

    /// Global GC: delete articles with no user link anywhere, cascading
    /// aliases/raw/embeddings, and purge expired or orphaned public
    /// resources. Citation snapshots are never touched.
    pub fn gc_unreferenced_articles(&mut self, dry_run: bool) -> Result<GlobalGcResult> {
        let now_db = ts(now());
        let tx = self.conn.transaction()?;

        let orphan_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT article_id FROM articles a
                 WHERE NOT EXISTS (
                     SELECT 1 FROM user_articles ua WHERE ua.article_id = a.article_id
                 )",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let raw_payloads_deleted: i64 = if orphan_ids.is_empty() {
            0
        } else {
            let placeholders = sql_placeholders(orphan_ids.len());
            let sql = format!(
                "SELECT COUNT(*) FROM articles_raw WHERE article_id IN ({placeholders})"
            );
            tx.query_row(&sql, rusqlite::params_from_iter(orphan_ids.iter()), |row| {
                row.get(0)
            })?
        };

        let public_resources_deleted: i64 = tx.query_row(
            "SELECT COUNT(*) FROM article_resources r
             WHERE r.user_id IS NULL
               AND ((r.expires_at IS NOT NULL AND r.expires_at <= ?1)
                    OR NOT EXISTS (
                        SELECT 1 FROM articles a
                        JOIN user_articles ua ON ua.article_id = a.article_id
                        WHERE a.url_hash = r.url_hash
                    ))",
            params![now_db],
            |row| row.get(0),
        )?;

        if !dry_run {
            if !orphan_ids.is_empty() {
                let placeholders = sql_placeholders(orphan_ids.len());
                let sql = format!("DELETE FROM articles WHERE article_id IN ({placeholders})");
                tx.execute(&sql, rusqlite::params_from_iter(orphan_ids.iter()))?;
            }
            if public_resources_deleted > 0 {
                tx.execute(
                    "DELETE FROM article_resources
                     WHERE user_id IS NULL
                       AND ((expires_at IS NOT NULL AND expires_at <= ?1)
                            OR NOT EXISTS (
                                SELECT 1 FROM articles a
                                JOIN user_articles ua ON ua.article_id = a.article_id
                                WHERE a.url_hash = article_resources.url_hash
                            ))",
                    params![now_db],
                )?;
            }
            tx.commit()?;
        }

        Ok(GlobalGcResult {
            dry_run,
            articles_deleted: orphan_ids.len() as i64,
            raw_payloads_deleted,
            public_resources_deleted,
        })
    }

    // -- feed HTTP cache -------------------------------------------------

    pub fn feed_http_cache(
        &mut self,
        source_name: &str,
        feed_url: &str,
    ) -> Result<(Option<String>, Option<String>)> {
        let row: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT etag, last_modified FROM rss_feed_states
                 WHERE user_id = ?1 AND source_name = ?2 AND feed_url = ?3",
                params![self.user_id, source_name, feed_url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.unwrap_or((None, None)))
    }

    pub fn upsert_feed_http_cache(
        &mut self,
        source_name: &str,
        feed_url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rss_feed_states
             (user_id, source_name, feed_url, etag, last_modified, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, source_name, feed_url) DO UPDATE SET
                 etag = excluded.etag,
                 last_modified = excluded.last_modified,
                 updated_at = excluded.updated_at",
            params![self.user_id, source_name, feed_url, etag, last_modified, ts(now())],
        )?;
        Ok(())
    }

    // -- processing snapshots --------------------------------------------

    pub fn rss_processing_snapshot(
        &mut self,
        source_name: &str,
        feed_set_hash: &str,
    ) -> Result<Option<(String, Option<String>, DateTime<Utc>)>> {
        let row: Option<(String, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT snapshot_json, next_cursor, updated_at FROM rss_processing_snapshots
                 WHERE user_id = ?1 AND source_name = ?2 AND feed_set_hash = ?3",
                params![self.user_id, source_name, feed_set_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((snapshot_json, next_cursor, updated_at)) => Ok(Some((
                snapshot_json,
                next_cursor,
                parse_ts("updated_at", &updated_at)?,
            ))),
            None => Ok(None),
        }
    }

    pub fn upsert_rss_processing_snapshot(
        &mut self,
        source_name: &str,
        feed_set_hash: &str,
        snapshot_json: &str,
        next_cursor: Option<&str>,
    ) -> Result<()> {
        let stamp = ts(now());
        self.conn.execute(
            "INSERT INTO rss_processing_snapshots
             (user_id, source_name, feed_set_hash, snapshot_json, next_cursor, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (user_id, source_name, feed_set_hash) DO UPDATE SET
                 snapshot_json = excluded.snapshot_json,
                 next_cursor = excluded.next_cursor,
                 updated_at = excluded.updated_at",
            params![self.user_id, source_name, feed_set_hash, snapshot_json, next_cursor, stamp],
        )?;
        Ok(())
    }

    /// Advance the snapshot cursor after one processed page. Returns false
    /// (and logs) when the snapshot row has gone missing.
    pub fn update_rss_processing_snapshot_cursor(
        &mut self,
        source_name: &str,
        feed_set_hash: &str,
        next_cursor: Option<&str>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE rss_processing_snapshots SET next_cursor = ?1, updated_at = ?2
             WHERE user_id = ?3 AND source_name = ?4 AND feed_set_hash = ?5",
            params![next_cursor, ts(now()), self.user_id, source_name, feed_set_hash],
        )?;
        if changed == 0 {
            warn!(
                source = source_name,
                feed_set_hash,
                "RSS snapshot cursor update skipped because snapshot row is missing"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn delete_rss_processing_snapshot(
        &mut self,
        source_name: &str,
        feed_set_hash: &str,
    ) -> Result<()> {
        self.conn.execute(
            "DELETE FROM rss_processing_snapshots
             WHERE user_id = ?1 AND source_name = ?2 AND feed_set_hash = ?3",
            params![self.user_id, source_name, feed_set_hash],
        )?;
        Ok(())
    }

    // -- dedup -----------------------------------------------------------

    pub fn list_candidates_for_dedup(
        &mut self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DedupCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.article_id, a.title, a.url, a.source_domain, a.published_at,
                    a.clean_text, a.clean_text_chars
             FROM articles a
             JOIN user_articles ua ON ua.article_id = a.article_id
             WHERE ua.user_id = ?1 AND a.published_at >= ?2
             ORDER BY a.published_at DESC",
        )?;
        let rows = stmt.query_map(params![self.user_id, ts(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            let (article_id, title, url, source_domain, published_at, clean_text, chars) = row?;
            candidates.push(DedupCandidate {
                article_id,
                title,
                url,
                source_domain,
                published_at: parse_ts("published_at", &published_at)?,
                clean_text,
                clean_text_chars: chars,
            });
        }
        Ok(candidates)
    }

    /// Embeddings within TTL for the given articles, keyed by article id.
    pub fn get_embeddings(
        &mut self,
        article_ids: &[String],
        model_name: &str,
    ) -> Result<HashMap<String, Vec<f32>>> {
        if article_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = sql_placeholders(article_ids.len());
        let sql = format!(
            "SELECT article_id, embedding_dim, embedding_blob FROM article_embeddings
             WHERE model_name = ?1
               AND (expires_at IS NULL OR expires_at > ?2)
               AND article_id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&model_name];
        let now_db = ts(now());
        values.push(&now_db);
        for id in article_ids {
            values.push(id);
        }
        let rows = stmt.query_map(values.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut embeddings = HashMap::new();
        for row in rows {
            let (article_id, dim, blob) = row?;
            embeddings.insert(article_id, unpack_vector(&blob, dim as usize));
        }
        Ok(embeddings)
    }

    pub fn upsert_embeddings(
        &mut self,
        model_name: &str,
        vectors: &HashMap<String, Vec<f32>>,
        ttl_days: i64,
    ) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        let created_at = now();
        let expires_at = created_at + Duration::days(ttl_days);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO article_embeddings
                 (article_id, model_name, embedding_dim, embedding_blob, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (article_id, model_name) DO UPDATE SET
                     embedding_dim = excluded.embedding_dim,
                     embedding_blob = excluded.embedding_blob,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at",
            )?;
            for (article_id, vector) in vectors {
                stmt.execute(params![
                    article_id,
                    model_name,
                    vector.len() as i64,
                    pack_vector(vector),
                    ts(created_at),
                    ts(expires_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace dedup rows for this (user, run) with the given clusters.
    pub fn save_dedup_clusters(
        &mut self,
        run_id: &str,
        model_name: &str,
        threshold: f64,
        clusters: &[DedupCluster],
    ) -> Result<()> {
        let created_at = ts(now());
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM article_dedup WHERE user_id = ?1 AND run_id = ?2",
            params![self.user_id, run_id],
        )?;
        tx.execute(
            "DELETE FROM dedup_clusters WHERE user_id = ?1 AND run_id = ?2",
            params![self.user_id, run_id],
        )?;
        for cluster in clusters {
            let alt_sources_json =
                serde_json::to_string(&cluster.alt_sources).map_err(|source| {
                    StoreError::Json {
                        context: "dedup_clusters.alt_sources_json",
                        source,
                    }
                })?;
            tx.execute(
                "INSERT INTO dedup_clusters
                 (user_id, run_id, cluster_id, representative_article_id,
                  alt_sources_json, model_name, threshold, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    self.user_id,
                    run_id,
                    cluster.cluster_id,
                    cluster.representative_article_id,
                    alt_sources_json,
                    model_name,
                    threshold,
                    created_at,
                ],
            )?;
            for member in &cluster.members {
                tx.execute(
                    "INSERT INTO article_dedup
                     (user_id, run_id, article_id, cluster_id, is_representative, similarity_to_rep)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        self.user_id,
                        run_id,
                        member.article_id,
                        cluster.cluster_id,
                        member.is_representative,
                        member.similarity_to_representative as f64,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_clusters_for_run(
        &mut self,
        run_id: &str,
        min_size: usize,
        limit: usize,
        members_per_cluster: usize,
    ) -> Result<ClusterListResult> {
        let min_size = min_size.max(1);
        let members_per_cluster = members_per_cluster.max(1);

        let cluster_rows: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT cluster_id, representative_article_id FROM dedup_clusters
                 WHERE user_id = ?1 AND run_id = ?2 ORDER BY cluster_id",
            )?;
            let rows = stmt.query_map(params![self.user_id, run_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let mut collected = Vec::new();
            for row in rows {
                collected.push(row?);
            }
            collected
        };

        let mut members_by_cluster: HashMap<String, Vec<ClusterMemberPreview>> = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT d.cluster_id, d.article_id, d.is_representative, d.similarity_to_rep,
                        a.title, a.url, a.source_domain
                 FROM article_dedup d
                 LEFT JOIN articles a ON a.article_id = d.article_id
                 WHERE d.user_id = ?1 AND d.run_id = ?2",
            )?;
            let rows = stmt.query_map(params![self.user_id, run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;
            for row in rows {
                let (cluster_id, article_id, is_representative, similarity, title, url, domain) =
                    row?;
                members_by_cluster
                    .entry(cluster_id)
                    .or_default()
                    .push(ClusterMemberPreview {
                        title: title.unwrap_or_else(|| format!("[missing] {article_id}")),
                        url: url.unwrap_or_default(),
                        source_domain: domain.unwrap_or_else(|| "unknown".to_string()),
                        article_id,
                        similarity_to_representative: similarity as f32,
                        is_representative,
                    });
            }
        }

        let mut previews = Vec::new();
        let mut total_articles = 0;
        for (cluster_id, representative_article_id) in cluster_rows {
            let mut members = members_by_cluster.remove(&cluster_id).unwrap_or_default();
            let size = members.len();
            if size < min_size {
                continue;
            }
            total_articles += size;
            members.sort_by(|left, right| {
                right
                    .is_representative
                    .cmp(&left.is_representative)
                    .then_with(|| {
                        right
                            .similarity_to_representative
                            .partial_cmp(&left.similarity_to_representative)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| left.article_id.cmp(&right.article_id))
            });
            let representative = members
                .iter()
                .find(|member| member.article_id == representative_article_id);
            let representative_title = representative
                .map(|member| member.title.clone())
                .unwrap_or_else(|| format!("[missing] {representative_article_id}"));
            let representative_url = representative
                .map(|member| member.url.clone())
                .unwrap_or_default();
            members.truncate(members_per_cluster);
            previews.push(ClusterPreview {
                cluster_id,
                run_id: run_id.to_string(),
                size,
                representative_article_id,
                representative_title,
                representative_url,
                members,
            });
        }

        let total_clusters = previews.len();
        let clusters = if limit > 0 {
            previews.into_iter().take(limit).collect()
        } else {
            Vec::new()
        };
        Ok(ClusterListResult {
            run_id: run_id.to_string(),
            total_clusters,
            total_articles,
            clusters,
        })
    }

    // -- user corpus -----------------------------------------------------

    /// Recent per-user articles for recap and retrieval, newest first.
    pub fn list_user_corpus_entries(
        &mut self,
        limit: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceCorpusEntry>> {
        let since_db = since.map(ts);
        let until_db = until.map(ts);
        let mut stmt = self.conn.prepare(
            "SELECT a.article_id, a.title, a.url, a.source_domain, a.published_at, a.clean_text
             FROM articles a
             JOIN user_articles ua ON ua.article_id = a.article_id
             WHERE ua.user_id = ?1
               AND (?2 IS NULL OR ua.discovered_at >= ?2)
               AND (?3 IS NULL OR ua.discovered_at < ?3)
             ORDER BY ua.discovered_at DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![self.user_id, since_db, until_db, limit.max(1)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            let (article_id, title, url, source, published_at, clean_text) = row?;
            entries.push(SourceCorpusEntry {
                source_id: format!("article:{article_id}"),
                article_id,
                title,
                url,
                source,
                published_at: parse_ts("published_at", &published_at)?,
                clean_text,
            });
        }
        Ok(entries)
    }

    /// Resolve source ids against the user's article links; returns the
    /// resolved entries and the ids that did not resolve.
    pub fn validate_user_source_ids(
        &mut self,
        source_ids: &[String],
    ) -> Result<(Vec<SourceCorpusEntry>, Vec<String>)> {
        let mut ordered_unique: Vec<String> = Vec::new();
        for source_id in source_ids {
            if !ordered_unique.contains(source_id) {
                ordered_unique.push(source_id.clone());
            }
        }

        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for source_id in &ordered_unique {
            let Some(article_id) = article_id_from_source_id(source_id) else {
                return Err(StoreError::Invalid(format!(
                    "Invalid source_id format: {source_id}. Expected 'article:<article_id>'."
                )));
            };
            let row: Option<(String, String, String, String, String)> = self
                .conn
                .query_row(
                    "SELECT a.title, a.url, a.source_domain, a.published_at, a.clean_text
                     FROM articles a
                     JOIN user_articles ua ON ua.article_id = a.article_id
                     WHERE ua.user_id = ?1 AND a.article_id = ?2",
                    params![self.user_id, article_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((title, url, source, published_at, clean_text)) => {
                    resolved.push(SourceCorpusEntry {
                        source_id: source_id.clone(),
                        article_id: article_id.to_string(),
                        title,
                        url,
                        source,
                        published_at: parse_ts("published_at", &published_at)?,
                        clean_text,
                    });
                }
                None => missing.push(source_id.clone()),
            }
        }
        Ok((resolved, missing))
    }

    // -- article resources ----------------------------------------------

    /// Best matching cached resource: content-bearing rows first, then the
    /// user's own row over the public one, then freshest.
    pub fn get_article_resource(&mut self, url_hash: &str) -> Result<Option<ArticleResourceView>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, url_hash, url_canonical, fetch_status, http_status,
                        content_text, error_code, fetched_at, updated_at
                 FROM article_resources
                 WHERE url_hash = ?1
                   AND (user_id = ?2 OR user_id IS NULL)
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY
                     CASE WHEN content_text IS NOT NULL AND length(trim(content_text)) > 0
                          THEN 0 ELSE 1 END,
                     CASE WHEN user_id = ?2 THEN 0 ELSE 1 END,
                     updated_at DESC
                 LIMIT 1",
                params![url_hash, self.user_id, ts(now())],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((
                user_id,
                url_hash,
                url_canonical,
                fetch_status,
                http_status,
                content_text,
                error_code,
                fetched_at,
                updated_at,
            )) => Ok(Some(ArticleResourceView {
                user_id,
                url_hash,
                url_canonical,
                fetch_status,
                http_status,
                content_text,
                error_code,
                fetched_at: parse_ts_opt("fetched_at", fetched_at)?,
                updated_at: parse_ts("updated_at", &updated_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn upsert_public_article_resource(
        &mut self,
        resource: &ArticleResourceWrite,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO article_resources
             (user_id, url_hash, url_canonical, fetch_status, http_status,
              content_text, error_code, fetched_at, updated_at, expires_at)
             VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (url_hash) WHERE user_id IS NULL DO UPDATE SET
                 url_canonical = excluded.url_canonical,
                 fetch_status = excluded.fetch_status,
                 http_status = excluded.http_status,
                 content_text = excluded.content_text,
                 error_code = excluded.error_code,
                 fetched_at = excluded.fetched_at,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at",
            params![
                resource.url_hash,
                resource.url_canonical,
                resource.fetch_status,
                resource.http_status,
                resource.content_text,
                resource.error_code,
                resource.fetched_at.map(ts),
                ts(now()),
                resource.expires_at.map(ts),
            ],
        )?;
        Ok(())
    }

    /// Drop this user's private cached resources older than the cutoff.
    pub fn prune_user_private_resources(
        &mut self,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<i64> {
        let cutoff_db = ts(cutoff);
        let tx = self.conn.transaction()?;
        let to_delete: i64 = tx.query_row(
            "SELECT COUNT(*) FROM article_resources WHERE user_id = ?1 AND updated_at < ?2",
            params![self.user_id, cutoff_db],
            |row| row.get(0),
        )?;
        if !dry_run && to_delete > 0 {
            tx.execute(
                "DELETE FROM article_resources WHERE user_id = ?1 AND updated_at < ?2",
                params![self.user_id, cutoff_db],
            )?;
            tx.commit()?;
        }
        Ok(to_delete)
    }

    pub fn upsert_user_article_resource(&mut self, resource: &ArticleResourceWrite) -> Result<()> {
        self.conn.execute(
            "INSERT INTO article_resources
             (user_id, url_hash, url_canonical, fetch_status, http_status,
              content_text, error_code, fetched_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (user_id, url_hash) WHERE user_id IS NOT NULL DO UPDATE SET
                 url_canonical = excluded.url_canonical,
                 fetch_status = excluded.fetch_status,
                 http_status = excluded.http_status,
                 content_text = excluded.content_text,
                 error_code = excluded.error_code,
                 fetched_at = excluded.fetched_at,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at",
            params![
                self.user_id,
                resource.url_hash,
                resource.url_canonical,
                resource.fetch_status,
                resource.http_status,
                resource.content_text,
                resource.error_code,
                resource.fetched_at.map(ts),
                ts(now()),
                resource.expires_at.map(ts),
            ],
        )?;
        Ok(())
    }
}

#[derive(Debug)]
struct ArticleRow {
    article_id: String,
    external_id: String,
    url: String,
    url_canonical: String,
    url_hash: String,
    title: String,
    source_domain: String,
    published_at: DateTime<Utc>,
    language_detected: String,
    content_raw: Option<String>,
    summary_raw: Option<String>,
    is_full_content: bool,
    clean_text: String,
    clean_text_chars: i64,
    is_truncated: bool,
    fallback_key: Option<String>,
}

const ARTICLE_COLUMNS: &str = "article_id, external_id, url, url_canonical, url_hash, title, \
     source_domain, published_at, language_detected, content_raw, summary_raw, \
     is_full_content, clean_text, clean_text_chars, is_truncated, fallback_key";

fn read_article_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ArticleRow, String)> {
    let published_at: String = row.get(7)?;
    Ok((
        ArticleRow {
            article_id: row.get(0)?,
            external_id: row.get(1)?,
            url: row.get(2)?,
            url_canonical: row.get(3)?,
            url_hash: row.get(4)?,
            title: row.get(5)?,
            source_domain: row.get(6)?,
            published_at: DateTime::<Utc>::UNIX_EPOCH,
            language_detected: row.get(8)?,
            content_raw: row.get(9)?,
            summary_raw: row.get(10)?,
            is_full_content: row.get(11)?,
            clean_text: row.get(12)?,
            clean_text_chars: row.get(13)?,
            is_truncated: row.get(14)?,
            fallback_key: row.get(15)?,
        },
        published_at,
    ))
}

fn fetch_article_query<P: rusqlite::Params>(
    tx: &Transaction<'_>,
    sql: &str,
    params: P,
) -> Result<Option<ArticleRow>> {
    let row = tx.query_row(sql, params, read_article_row).optional()?;
    match row {
        Some((mut article, published_at)) => {
            article.published_at = parse_ts("published_at", &published_at)?;
            Ok(Some(article))
        }
        None => Ok(None),
    }
}

fn fetch_article_row(tx: &Transaction<'_>, article_id: &str) -> Result<Option<ArticleRow>> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE article_id = ?1");
    fetch_article_query(tx, &sql, params![article_id])
}

fn find_existing_article(
    tx: &Transaction<'_>,
    article: &NormalizedArticle,
) -> Result<Option<ArticleRow>> {
    let alias: Option<String> = tx
        .query_row(
            "SELECT article_id FROM article_external_ids
             WHERE source_name = ?1 AND external_id = ?2",
            params![article.source_name, article.external_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(article_id) = alias {
        return fetch_article_row(tx, &article_id);
    }

    let generated = use_url_timestamp_fallback(article);
    if generated && !article.url_canonical.is_empty() {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles
             WHERE source_name = ?1 AND url_canonical = ?2 LIMIT 1"
        );
        if let Some(found) = fetch_article_query(
            tx,
            &sql,
            params![article.source_name, article.url_canonical],
        )? {
            return Ok(Some(found));
        }
    }

    let fallback_key = build_fallback_key(article);
    if generated {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles
             WHERE source_name = ?1 AND fallback_key = ?2 LIMIT 1"
        );
        return fetch_article_query(tx, &sql, params![article.source_name, fallback_key]);
    }

    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles
         WHERE source_name = ?1 AND fallback_key = ?2 AND external_id LIKE 'generated:%' LIMIT 1"
    );
    fetch_article_query(tx, &sql, params![article.source_name, fallback_key])
}

fn try_insert_article(
    tx: &mut Transaction<'_>,
    article: &NormalizedArticle,
    run_id: &str,
) -> Result<Option<String>> {
    let article_id = Uuid::new_v4().to_string();
    let stamp = ts(now());
    let mut savepoint = tx.savepoint()?;
    let inserted = savepoint.execute(
        "INSERT INTO articles
         (article_id, source_name, external_id, url, url_canonical, url_hash, title,
          source_domain, published_at, language_detected, content_raw, summary_raw,
          is_full_content, clean_text, clean_text_chars, is_truncated, ingested_at,
          fallback_key, last_processed_run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            article_id,
            article.source_name,
            article.external_id,
            article.url,
            article.url_canonical,
            article.url_hash,
            article.title,
            article.source_domain,
            ts(article.published_at),
            article.language_detected,
            article.content_raw,
            article.summary_raw,
            article.is_full_content,
            article.clean_text,
            article.clean_text_chars,
            article.is_truncated,
            stamp,
            target_fallback_key(article, None),
            run_id,
        ],
    );
    let inserted = inserted.and_then(|_| {
        savepoint.execute(
            "INSERT INTO article_external_ids
             (source_name, external_id, article_id, is_primary, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![article.source_name, article.external_id, article_id, stamp],
        )
    });
    match inserted {
        Ok(_) => {
            savepoint.commit()?;
            Ok(Some(article_id))
        }
        Err(error) => {
            let store_error = StoreError::from(error);
            if store_error.is_constraint_violation() {
                savepoint.rollback()?;
                Ok(None)
            } else {
                Err(store_error)
            }
        }
    }
}

fn ensure_external_alias(
    tx: &Transaction<'_>,
    source_name: &str,
    external_id: &str,
    article_id: &str,
) -> Result<()> {
    let mapped: Option<String> = tx
        .query_row(
            "SELECT article_id FROM article_external_ids
             WHERE source_name = ?1 AND external_id = ?2",
            params![source_name, external_id],
            |row| row.get(0),
        )
        .optional()?;
    match mapped {
        None => {
            tx.execute(
                "INSERT INTO article_external_ids
                 (source_name, external_id, article_id, is_primary, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![source_name, external_id, article_id, ts(now())],
            )?;
            Ok(())
        }
        Some(existing) if existing != article_id => Err(StoreError::AliasCollision {
            source_name: source_name.to_string(),
            external_id: external_id.to_string(),
            existing,
            candidate: article_id.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

fn ensure_user_article_link(
    tx: &Transaction<'_>,
    user_id: &str,
    article_id: &str,
) -> Result<bool> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO user_articles (user_id, article_id, discovered_at, state)
         VALUES (?1, ?2, ?3, 'active')",
        params![user_id, article_id, ts(now())],
    )?;
    Ok(inserted == 1)
}

fn is_generated_external_id(external_id: &str) -> bool {
    external_id.starts_with(GENERATED_ID_PREFIX)
}

fn use_url_timestamp_fallback(article: &NormalizedArticle) -> bool {
    article.external_id.is_empty() || is_generated_external_id(&article.external_id)
}

fn build_fallback_key(article: &NormalizedArticle) -> String {
    format!(
        "{}|{}|{}",
        article.source_name,
        article.url_hash,
        ts(article.published_at)
    )
}

fn target_fallback_key(
    article: &NormalizedArticle,
    existing_fallback_key: Option<&str>,
) -> Option<String> {
    if use_url_timestamp_fallback(article) {
        Some(build_fallback_key(article))
    } else {
        existing_fallback_key.map(str::to_string)
    }
}

fn row_changed(
    existing: &ArticleRow,
    article: &NormalizedArticle,
    target_fallback_key: Option<&str>,
) -> bool {
    existing.url != article.url
        || existing.url_canonical != article.url_canonical
        || existing.url_hash != article.url_hash
        || existing.title != article.title
        || existing.source_domain != article.source_domain
        || existing.published_at != article.published_at
        || existing.language_detected != article.language_detected
        || existing.content_raw != article.content_raw
        || existing.summary_raw != article.summary_raw
        || existing.is_full_content != article.is_full_content
        || existing.clean_text != article.clean_text
        || existing.clean_text_chars != article.clean_text_chars
        || existing.is_truncated != article.is_truncated
        || existing.fallback_key.as_deref() != target_fallback_key
}

fn article_id_from_source_id(source_id: &str) -> Option<&str> {
    let article_id = source_id.strip_prefix("article:")?.trim();
    if article_id.is_empty() {
        return None;
    }
    Some(article_id)
}

fn sql_placeholders(count: usize) -> String {
    let mut placeholders = String::new();
    for index in 0..count {
        if index > 0 {
            placeholders.push(',');
        }
        placeholders.push('?');
    }
    placeholders
}

/// Alternative sources for a cluster, deduplicated by (url, domain) and
/// sorted by (domain, url).
pub fn build_alt_sources(candidates: &[DedupCandidate]) -> Vec<AltSource> {
    let mut sources: Vec<AltSource> = Vec::new();
    for candidate in candidates {
        let entry = AltSource {
            url: candidate.url.clone(),
            domain: candidate.source_domain.clone(),
        };
        if !sources.contains(&entry) {
            sources.push(entry);
        }
    }
    sources.sort_by(|left, right| {
        left.domain
            .cmp(&right.domain)
            .then_with(|| left.url.cmp(&right.url))
    });
    sources
}
