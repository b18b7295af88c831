//! Semantic deduplication stage
//!
//! Builds embedding texts for recent per-user articles, reuses cached
//! vectors within TTL, clusters by cosine similarity, and persists the
//! clustering artifacts for the run.

pub mod cluster;
pub mod embedder;

use std::collections::HashMap;

use chrono::{Duration, Utc};
use newsstore::{DedupCandidate, IngestionRunCounters, Store};
use tracing::{debug, info};

pub use cluster::{cluster_candidates, count_duplicates};
pub use embedder::{build_embedder, cosine_similarity, Embedder, EmbedderError, HashingEmbedder};

pub const EMBEDDING_TEXT_VERSION: &str = "title-clean-v1";

/// Dedup stage tunables.
#[derive(Debug, Clone)]
pub struct DedupStageConfig {
    pub threshold: f32,
    pub model_name: String,
    pub lookback_days: i64,
    pub embedding_ttl_days: i64,
}

impl Default for DedupStageConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            model_name: "intfloat/multilingual-e5-small".to_string(),
            lookback_days: 3,
            embedding_ttl_days: 7,
        }
    }
}

/// Runs the dedup stage and persists clustering artifacts.
pub struct DedupStage {
    config: DedupStageConfig,
    embedder: Box<dyn Embedder>,
}

impl DedupStage {
    pub fn new(config: DedupStageConfig, embedder: Box<dyn Embedder>) -> Self {
        Self { config, embedder }
    }

    pub fn run(
        &self,
        store: &mut Store,
        run_id: &str,
        counters: &mut IngestionRunCounters,
    ) -> eyre::Result<()> {
        store.touch_run(run_id)?;
        let since = Utc::now() - Duration::days(self.config.lookback_days);
        let candidates = store.list_candidates_for_dedup(since)?;
        let storage_model_name = storage_model_name(&self.config.model_name);

        if candidates.is_empty() {
            store.save_dedup_clusters(run_id, &storage_model_name, self.config.threshold as f64, &[])?;
            return Ok(());
        }

        let article_ids: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.article_id.clone())
            .collect();
        let mut embeddings = store.get_embeddings(&article_ids, &storage_model_name)?;

        let missing: Vec<&DedupCandidate> = candidates
            .iter()
            .filter(|candidate| !embeddings.contains_key(&candidate.article_id))
            .collect();
        if !missing.is_empty() {
            debug!(missing = missing.len(), "embedding dedup candidates");
            let texts: Vec<String> = missing
                .iter()
                .map(|candidate| build_embedding_text(candidate))
                .collect();
            let vectors = self.embedder.embed(&texts);
            store.touch_run(run_id)?;
            let generated: HashMap<String, Vec<f32>> = missing
                .iter()
                .zip(vectors)
                .map(|(candidate, vector)| (candidate.article_id.clone(), vector))
                .collect();
            store.upsert_embeddings(
                &storage_model_name,
                &generated,
                self.config.embedding_ttl_days,
            )?;
            embeddings.extend(generated);
        }

        let clusters = cluster_candidates(&candidates, &embeddings, self.config.threshold);
        store.save_dedup_clusters(
            run_id,
            &storage_model_name,
            self.config.threshold as f64,
            &clusters,
        )?;
        store.touch_run(run_id)?;

        counters.dedup_clusters = clusters.len() as i64;
        counters.dedup_duplicates = count_duplicates(&clusters);
        info!(
            clusters = counters.dedup_clusters,
            duplicates = counters.dedup_duplicates,
            "dedup stage complete"
        );
        Ok(())
    }
}

/// Embedding text: title and body when both exist, whichever is non-empty
/// otherwise, and a sentinel for fully empty articles.
pub fn build_embedding_text(candidate: &DedupCandidate) -> String {
    let title = candidate.title.trim();
    let clean_text = candidate.clean_text.trim();
    if !title.is_empty() && !clean_text.is_empty() {
        format!("{title}. {clean_text}")
    } else if !title.is_empty() {
        title.to_string()
    } else if !clean_text.is_empty() {
        clean_text.to_string()
    } else {
        format!("[article:{}]", candidate.article_id)
    }
}

pub fn storage_model_name(model_name: &str) -> String {
    format!("{model_name}@{EMBEDDING_TEXT_VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn candidate(title: &str, clean_text: &str) -> DedupCandidate {
        DedupCandidate {
            article_id: "a1".to_string(),
            title: title.to_string(),
            url: "https://example.com/a1".to_string(),
            source_domain: "example.com".to_string(),
            published_at: "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap(),
            clean_text: clean_text.to_string(),
            clean_text_chars: clean_text.len() as i64,
        }
    }

    #[test]
    fn test_embedding_text_variants() {
        assert_eq!(
            build_embedding_text(&candidate("Title", "Body")),
            "Title. Body"
        );
        assert_eq!(build_embedding_text(&candidate("Title", "  ")), "Title");
        assert_eq!(build_embedding_text(&candidate("", "Body")), "Body");
        assert_eq!(build_embedding_text(&candidate("", "")), "[article:a1]");
    }

    #[test]
    fn test_storage_model_name_carries_text_version() {
        assert_eq!(
            storage_model_name("intfloat/multilingual-e5-small"),
            "intfloat/multilingual-e5-small@title-clean-v1"
        );
    }

    #[test]
    fn test_empty_bodies_with_distinct_titles_stay_separate() {
        let embedder = HashingEmbedder::new("hash-test");
        let mut left = candidate("Central bank raises interest rates", "");
        left.article_id = "a1".to_string();
        let mut right = candidate("Volcano erupts on remote island", "");
        right.article_id = "a2".to_string();

        let texts = vec![
            build_embedding_text(&left),
            build_embedding_text(&right),
        ];
        let vectors = embedder.embed(&texts);
        let embeddings: HashMap<String, Vec<f32>> = vec![
            ("a1".to_string(), vectors[0].clone()),
            ("a2".to_string(), vectors[1].clone()),
        ]
        .into_iter()
        .collect();

        let clusters = cluster_candidates(&[left, right], &embeddings, 0.95);
        assert_eq!(clusters.len(), 2);
    }
}
