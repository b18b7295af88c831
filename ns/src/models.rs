//! Ingestion and dedup domain types
//!
//! These model the pipeline's view of the data: source payloads, normalized
//! articles ready for persistence, run counters, gaps, and dedup clusters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states for ingestion runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle states for ingestion gaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Open,
    Resolved,
    Expired,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for GapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation result for article upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
    Skipped,
}

/// Normalized article payload from a source connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceArticle {
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub raw_payload: Value,
}

/// Page of source articles with cursor-based pagination
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub articles: Vec<SourceArticle>,
    pub next_cursor: Option<String>,
    pub cursor: Option<String>,
}

/// Article record ready for persistence
#[derive(Debug, Clone)]
pub struct NormalizedArticle {
    pub source_name: String,
    pub external_id: String,
    pub url: String,
    pub url_canonical: String,
    pub url_hash: String,
    pub title: String,
    pub source_domain: String,
    pub published_at: DateTime<Utc>,
    pub language_detected: String,
    pub content_raw: Option<String>,
    pub summary_raw: Option<String>,
    pub is_full_content: bool,
    pub needs_enrichment: bool,
    pub clean_text: String,
    pub clean_text_chars: i64,
    pub is_truncated: bool,
}

/// Result of persisting a normalized article
#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub article_id: String,
    pub action: UpsertAction,
}

/// Failed ingestion window that should be retried
#[derive(Debug, Clone)]
pub struct IngestionGap {
    pub gap_id: i64,
    pub source: String,
    pub from_cursor_or_time: Option<String>,
    pub to_cursor_or_time: Option<String>,
    pub error_code: String,
    pub retry_after: Option<i64>,
    pub status: GapStatus,
}

/// Input payload for recording failed source windows
#[derive(Debug, Clone)]
pub struct GapWrite {
    pub from_cursor_or_time: Option<String>,
    pub to_cursor_or_time: Option<String>,
    pub error_code: String,
    pub retry_after: Option<i64>,
}

/// Counters tracked for ingestion run statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionRunCounters {
    pub ingested: i64,
    pub updated: i64,
    pub skipped: i64,
    pub dedup_clusters: i64,
    pub dedup_duplicates: i64,
    pub gaps_opened: i64,
}

/// Aggregated ingestion counters for a time window
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionWindowStats {
    pub runs: i64,
    pub succeeded_runs: i64,
    pub partial_runs: i64,
    pub failed_runs: i64,
    pub other_runs: i64,
    pub ingested: i64,
    pub updated: i64,
    pub skipped: i64,
    pub dedup_clusters: i64,
    pub dedup_duplicates: i64,
    pub gaps_opened: i64,
}

/// Compact run view for CLI reporting
#[derive(Debug, Clone)]
pub struct IngestionRunView {
    pub run_id: String,
    pub source: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: IngestionRunCounters,
}

/// Article view used by the deduplication stage
#[derive(Debug, Clone)]
pub struct DedupCandidate {
    pub article_id: String,
    pub title: String,
    pub url: String,
    pub source_domain: String,
    pub published_at: DateTime<Utc>,
    pub clean_text: String,
    pub clean_text_chars: i64,
}

/// Dedup cluster member metadata
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub article_id: String,
    pub similarity_to_representative: f32,
    pub is_representative: bool,
}

/// Alternative source entry kept with each cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSource {
    pub url: String,
    pub domain: String,
}

/// Dedup cluster with representative and alternative sources
#[derive(Debug, Clone)]
pub struct DedupCluster {
    pub cluster_id: String,
    pub representative_article_id: String,
    pub alt_sources: Vec<AltSource>,
    pub members: Vec<ClusterMember>,
}

/// Readable article entry for cluster inspection
#[derive(Debug, Clone)]
pub struct ClusterMemberPreview {
    pub article_id: String,
    pub title: String,
    pub url: String,
    pub source_domain: String,
    pub similarity_to_representative: f32,
    pub is_representative: bool,
}

/// Cluster details for observability commands
#[derive(Debug, Clone)]
pub struct ClusterPreview {
    pub cluster_id: String,
    pub run_id: String,
    pub size: usize,
    pub representative_article_id: String,
    pub representative_title: String,
    pub representative_url: String,
    pub members: Vec<ClusterMemberPreview>,
}

/// Paginated view of clusters for one ingestion run
#[derive(Debug, Clone)]
pub struct ClusterListResult {
    pub run_id: String,
    pub total_clusters: usize,
    pub total_articles: usize,
    pub clusters: Vec<ClusterPreview>,
}

/// Result of retention cleanup for article-related records
#[derive(Debug, Clone)]
pub struct RetentionPruneResult {
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub articles_deleted: i64,
    pub private_resources_deleted: i64,
}

/// Result of global garbage collection for unreferenced shared records
#[derive(Debug, Clone)]
pub struct GlobalGcResult {
    pub dry_run: bool,
    pub articles_deleted: i64,
    pub raw_payloads_deleted: i64,
    pub public_resources_deleted: i64,
}

/// User-scoped corpus entry resolved from shared articles via user link
#[derive(Debug, Clone)]
pub struct SourceCorpusEntry {
    pub source_id: String,
    pub article_id: String,
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub clean_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Timeout,
            RunStatus::Partial,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_gap_status_round_trip() {
        for status in [GapStatus::Open, GapStatus::Resolved, GapStatus::Expired] {
            assert_eq!(GapStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_source_article_snapshot_serde() {
        let article = SourceArticle {
            external_id: "abc:1".to_string(),
            url: "https://example.com/a".to_string(),
            title: "Title".to_string(),
            source: "Example".to_string(),
            published_at: "2026-03-01T10:00:00Z".parse().unwrap(),
            content: None,
            summary: Some("summary".to_string()),
            raw_payload: serde_json::json!({"guid": "1"}),
        };
        let encoded = serde_json::to_string(&article).unwrap();
        let decoded: SourceArticle = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.external_id, article.external_id);
        assert_eq!(decoded.published_at, article.published_at);
        assert_eq!(decoded.content, None);
    }
}
