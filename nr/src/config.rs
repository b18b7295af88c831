//! Configuration types and loading
//!
//! YAML config with a fallback chain: explicit path, project-local
//! `.newsrecap.yml`, then `~/.config/newsrecap/newsrecap.yml`, else
//! defaults. A couple of runtime knobs (database path, feed URLs) can be
//! overridden through `NEWSRECAP_*` environment variables.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingestion::dedup::DedupStageConfig;
use crate::ingestion::rss::RssSourceConfig;
use crate::ingestion::IngestionConfig;
use crate::orchestrator::routing::RoutingDefaults;
use crate::orchestrator::worker::WorkerConfig;
use crate::recap::RecapConfig;

pub const DB_PATH_ENV_VAR: &str = "NEWSRECAP_DB_PATH";
pub const FEED_URLS_ENV_VAR: &str = "NEWSRECAP_FEED_URLS";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage locations
    pub storage: StorageConfig,

    /// Actor scope
    pub user: UserConfig,

    /// Ingestion pipeline settings
    pub ingestion: IngestionSettings,

    /// RSS source settings
    pub rss: RssSettings,

    /// Semantic dedup settings
    pub dedup: DedupSettings,

    /// Task queue and agent routing settings
    pub orchestrator: OrchestratorSettings,

    /// Recap pipeline settings
    pub recap: RecapSettings,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let config = Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()))?;
            return Ok(config.with_env_overrides());
        }

        let local_config = PathBuf::from(".newsrecap.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config.with_env_overrides()),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("newsrecap").join("newsrecap.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config.with_env_overrides()),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}",
                            user_config.display(),
                            e
                        );
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default().with_env_overrides())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(db_path) = std::env::var(DB_PATH_ENV_VAR) {
            if !db_path.trim().is_empty() {
                self.storage.db_path = PathBuf::from(db_path.trim());
            }
        }
        if let Ok(feed_urls) = std::env::var(FEED_URLS_ENV_VAR) {
            let parsed: Vec<String> = feed_urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                self.rss.feed_urls = parsed;
            }
        }
        self
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            page_size: self.ingestion.page_size,
            max_pages: self.ingestion.max_pages,
            active_run_stale_after: Duration::seconds(
                self.ingestion.active_run_stale_after_seconds,
            ),
            backfill_max_gaps: self.ingestion.backfill_max_gaps,
            clean_text_max_chars: self.ingestion.clean_text_max_chars,
        }
    }

    pub fn rss_source_config(&self) -> RssSourceConfig {
        RssSourceConfig {
            feed_urls: self.rss.feed_urls.clone(),
            default_items_per_feed: self.rss.default_items_per_feed,
            per_feed_items: self.rss.per_feed_items.clone(),
            snapshot_max_age: Some(Duration::hours(self.rss.snapshot_max_age_hours)),
            max_retries: self.rss.max_retries,
            retry_backoff_seconds: self.rss.retry_backoff_seconds,
        }
    }

    pub fn dedup_stage_config(&self) -> DedupStageConfig {
        DedupStageConfig {
            threshold: self.dedup.threshold,
            model_name: self.dedup.model_name.clone(),
            lookback_days: self.dedup.lookback_days,
            embedding_ttl_days: self.dedup.embedding_ttl_days,
        }
    }

    pub fn routing_defaults(&self) -> Result<RoutingDefaults> {
        let mut command_templates = HashMap::new();
        command_templates.insert(
            "codex".to_string(),
            self.orchestrator.codex_command_template.clone(),
        );
        command_templates.insert(
            "claude".to_string(),
            self.orchestrator.claude_command_template.clone(),
        );
        command_templates.insert(
            "gemini".to_string(),
            self.orchestrator.gemini_command_template.clone(),
        );

        let mut models = HashMap::new();
        for (agent, fast, quality) in [
            (
                "codex",
                &self.orchestrator.codex_model_fast,
                &self.orchestrator.codex_model_quality,
            ),
            (
                "claude",
                &self.orchestrator.claude_model_fast,
                &self.orchestrator.claude_model_quality,
            ),
            (
                "gemini",
                &self.orchestrator.gemini_model_fast,
                &self.orchestrator.gemini_model_quality,
            ),
        ] {
            let mut profiles = HashMap::new();
            profiles.insert("fast".to_string(), fast.clone());
            profiles.insert("quality".to_string(), quality.clone());
            models.insert(agent.to_string(), profiles);
        }

        let defaults = RoutingDefaults {
            default_agent: self.orchestrator.default_agent.clone(),
            task_type_profile_map: self.orchestrator.task_type_profile_map.clone(),
            command_templates,
            models,
        };
        Ok(defaults.validated()?)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.orchestrator.worker_id.clone(),
            poll_interval_seconds: self.orchestrator.poll_interval_seconds,
            retry_base_seconds: self.orchestrator.retry_base_seconds,
            retry_max_seconds: self.orchestrator.retry_max_seconds,
            timeout_retry_cap_seconds: self.orchestrator.timeout_retry_cap_seconds,
            transient_exit_codes: self.orchestrator.transient_exit_codes.clone(),
            stale_task_after: Duration::seconds(self.orchestrator.stale_attempt_seconds),
        }
    }

    pub fn recap_config(&self) -> RecapConfig {
        RecapConfig {
            poll_interval_seconds: self.recap.poll_interval_seconds,
            max_poll_seconds: self.recap.max_poll_seconds,
            stale_run_after: Duration::seconds(self.recap.stale_run_seconds),
            task_priority: 100,
            task_max_attempts: 3,
            task_timeout_seconds: self.recap.task_timeout_seconds,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,

    /// Root directory for per-task workdirs
    #[serde(rename = "workdir-root")]
    pub workdir_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("newsrecap.db"),
            workdir_root: PathBuf::from(".newsrecap_workdir"),
        }
    }
}

/// Actor scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    #[serde(rename = "user-id")]
    pub user_id: String,

    #[serde(rename = "user-name")]
    pub user_name: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user_id: "default_user".to_string(),
            user_name: "Default User".to_string(),
        }
    }
}

/// Ingestion pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    #[serde(rename = "page-size")]
    pub page_size: usize,

    /// Per-chain page budget; 0 means unlimited
    #[serde(rename = "max-pages")]
    pub max_pages: i64,

    #[serde(rename = "active-run-stale-after-seconds")]
    pub active_run_stale_after_seconds: i64,

    #[serde(rename = "backfill-max-gaps")]
    pub backfill_max_gaps: i64,

    #[serde(rename = "clean-text-max-chars")]
    pub clean_text_max_chars: usize,

    #[serde(rename = "article-retention-days")]
    pub article_retention_days: i64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 0,
            active_run_stale_after_seconds: 1_800,
            backfill_max_gaps: 10,
            clean_text_max_chars: 12_000,
            article_retention_days: 30,
        }
    }
}

/// RSS source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RssSettings {
    #[serde(rename = "feed-urls")]
    pub feed_urls: Vec<String>,

    #[serde(rename = "default-items-per-feed")]
    pub default_items_per_feed: usize,

    #[serde(rename = "per-feed-items")]
    pub per_feed_items: HashMap<String, usize>,

    #[serde(rename = "snapshot-max-age-hours")]
    pub snapshot_max_age_hours: i64,

    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "retry-backoff-seconds")]
    pub retry_backoff_seconds: f64,

    #[serde(rename = "request-timeout-seconds")]
    pub request_timeout_seconds: f64,
}

impl Default for RssSettings {
    fn default() -> Self {
        Self {
            feed_urls: Vec::new(),
            default_items_per_feed: 10_000,
            per_feed_items: HashMap::new(),
            snapshot_max_age_hours: 24,
            max_retries: 3,
            retry_backoff_seconds: 1.0,
            request_timeout_seconds: 30.0,
        }
    }
}

/// Semantic dedup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub threshold: f32,

    #[serde(rename = "model-name")]
    pub model_name: String,

    #[serde(rename = "allow-model-fallback")]
    pub allow_model_fallback: bool,

    #[serde(rename = "lookback-days")]
    pub lookback_days: i64,

    #[serde(rename = "embedding-ttl-days")]
    pub embedding_ttl_days: i64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            model_name: "intfloat/multilingual-e5-small".to_string(),
            allow_model_fallback: false,
            lookback_days: 3,
            embedding_ttl_days: 7,
        }
    }
}

/// Task queue and agent routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    #[serde(rename = "default-agent")]
    pub default_agent: String,

    #[serde(rename = "task-type-profile-map")]
    pub task_type_profile_map: HashMap<String, String>,

    #[serde(rename = "codex-command-template")]
    pub codex_command_template: String,

    #[serde(rename = "claude-command-template")]
    pub claude_command_template: String,

    #[serde(rename = "gemini-command-template")]
    pub gemini_command_template: String,

    #[serde(rename = "codex-model-fast")]
    pub codex_model_fast: String,

    #[serde(rename = "codex-model-quality")]
    pub codex_model_quality: String,

    #[serde(rename = "claude-model-fast")]
    pub claude_model_fast: String,

    #[serde(rename = "claude-model-quality")]
    pub claude_model_quality: String,

    #[serde(rename = "gemini-model-fast")]
    pub gemini_model_fast: String,

    #[serde(rename = "gemini-model-quality")]
    pub gemini_model_quality: String,

    #[serde(rename = "worker-id")]
    pub worker_id: String,

    #[serde(rename = "poll-interval-seconds")]
    pub poll_interval_seconds: f64,

    #[serde(rename = "retry-base-seconds")]
    pub retry_base_seconds: i64,

    #[serde(rename = "retry-max-seconds")]
    pub retry_max_seconds: i64,

    #[serde(rename = "timeout-retry-cap-seconds")]
    pub timeout_retry_cap_seconds: i64,

    #[serde(rename = "transient-exit-codes")]
    pub transient_exit_codes: Vec<i64>,

    #[serde(rename = "stale-attempt-seconds")]
    pub stale_attempt_seconds: i64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let mut task_type_profile_map = HashMap::new();
        task_type_profile_map.insert("highlights".to_string(), "fast".to_string());
        task_type_profile_map.insert("story".to_string(), "quality".to_string());
        task_type_profile_map.insert("qa".to_string(), "fast".to_string());

        Self {
            default_agent: "codex".to_string(),
            task_type_profile_map,
            codex_command_template: "codex exec --sandbox workspace-write \
                 -c sandbox_workspace_write.network_access=true \
                 --model {model} task_manifest={task_manifest} {prompt}"
                .to_string(),
            claude_command_template: "claude -p --model {model} --permission-mode dontAsk \
                 -- task_manifest={task_manifest} {prompt}"
                .to_string(),
            gemini_command_template: "gemini --model {model} --approval-mode auto_edit \
                 --prompt {prompt} task_manifest={task_manifest}"
                .to_string(),
            codex_model_fast: "gpt-5-codex-mini".to_string(),
            codex_model_quality: "gpt-5-codex".to_string(),
            claude_model_fast: "sonnet".to_string(),
            claude_model_quality: "opus".to_string(),
            gemini_model_fast: "gemini-2.5-flash".to_string(),
            gemini_model_quality: "gemini-2.5-pro".to_string(),
            worker_id: "worker-default".to_string(),
            poll_interval_seconds: 2.0,
            retry_base_seconds: 30,
            retry_max_seconds: 900,
            timeout_retry_cap_seconds: 1_800,
            transient_exit_codes: vec![137, 143],
            stale_attempt_seconds: 1_800,
        }
    }
}

/// Recap pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecapSettings {
    #[serde(rename = "poll-interval-seconds")]
    pub poll_interval_seconds: f64,

    #[serde(rename = "max-poll-seconds")]
    pub max_poll_seconds: f64,

    #[serde(rename = "stale-run-seconds")]
    pub stale_run_seconds: i64,

    #[serde(rename = "task-timeout-seconds")]
    pub task_timeout_seconds: i64,

    #[serde(rename = "resource-max-chars")]
    pub resource_max_chars: usize,

    #[serde(rename = "corpus-limit")]
    pub corpus_limit: i64,
}

impl Default for RecapSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5.0,
            max_poll_seconds: 1_800.0,
            stale_run_seconds: 1_800,
            task_timeout_seconds: 600,
            resource_max_chars: 50_000,
            corpus_limit: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_routing_validates() {
        let config = Config::default();
        let defaults = config.routing_defaults().unwrap();
        assert_eq!(defaults.default_agent, "codex");
        assert_eq!(
            defaults.task_type_profile_map.get("story").map(String::as_str),
            Some("quality")
        );
    }

    #[test]
    fn test_yaml_round_trip_with_kebab_keys() {
        let yaml = r#"
storage:
  db-path: /tmp/news.db
ingestion:
  page-size: 25
dedup:
  threshold: 0.9
orchestrator:
  default-agent: claude
rss:
  feed-urls:
    - https://example.com/feed
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/news.db"));
        assert_eq!(config.ingestion.page_size, 25);
        assert!((config.dedup.threshold - 0.9).abs() < 1e-6);
        assert_eq!(config.orchestrator.default_agent, "claude");
        assert_eq!(config.rss.feed_urls.len(), 1);
        // Untouched sections keep defaults.
        assert_eq!(config.orchestrator.retry_base_seconds, 30);
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        // SAFETY: serialized test; no concurrent env access.
        unsafe {
            std::env::set_var(DB_PATH_ENV_VAR, "/tmp/override.db");
            std::env::set_var(
                FEED_URLS_ENV_VAR,
                "https://a.example/feed, https://b.example/feed",
            );
        }
        let config = Config::default().with_env_overrides();
        unsafe {
            std::env::remove_var(DB_PATH_ENV_VAR);
            std::env::remove_var(FEED_URLS_ENV_VAR);
        }

        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.rss.feed_urls.len(), 2);
    }

    #[test]
    fn test_component_config_conversions() {
        let config = Config::default();
        let ingestion = config.ingestion_config();
        assert_eq!(ingestion.page_size, 50);
        assert_eq!(ingestion.active_run_stale_after, Duration::seconds(1_800));

        let worker = config.worker_config();
        assert_eq!(worker.transient_exit_codes, vec![137, 143]);

        let rss = config.rss_source_config();
        assert_eq!(rss.snapshot_max_age, Some(Duration::hours(24)));
    }
}
