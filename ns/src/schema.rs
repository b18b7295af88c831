//! Table and index definitions
//!
//! Partial unique indexes enforce the "at most one running run per
//! (user, source)" invariant, the public/private article resource split,
//! and per-kind user output identity. Citation snapshots deliberately
//! carry no foreign key to articles so they survive article GC.

use rusqlite::Connection;

pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    run_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    heartbeat_at TEXT,
    finished_at TEXT,
    ingested_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    dedup_clusters_count INTEGER NOT NULL DEFAULT 0,
    dedup_duplicates_count INTEGER NOT NULL DEFAULT 0,
    gaps_opened_count INTEGER NOT NULL DEFAULT 0,
    error_summary TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_ingestion_runs_scope_source_running
    ON ingestion_runs (user_id, source) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS idx_ingestion_runs_scope_started
    ON ingestion_runs (user_id, started_at);

CREATE TABLE IF NOT EXISTS ingestion_gaps (
    gap_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    run_id TEXT NOT NULL REFERENCES ingestion_runs(run_id),
    source TEXT NOT NULL,
    from_cursor_or_time TEXT,
    to_cursor_or_time TEXT,
    error_code TEXT NOT NULL,
    retry_after INTEGER,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_ingestion_gaps_scope_source_status
    ON ingestion_gaps (user_id, source, status);

CREATE TABLE IF NOT EXISTS rss_feed_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    source_name TEXT NOT NULL,
    feed_url TEXT NOT NULL,
    etag TEXT,
    last_modified TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, source_name, feed_url)
);

CREATE TABLE IF NOT EXISTS rss_processing_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    source_name TEXT NOT NULL,
    feed_set_hash TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    next_cursor TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, source_name, feed_set_hash)
);

CREATE TABLE IF NOT EXISTS articles (
    article_id TEXT PRIMARY KEY,
    source_name TEXT NOT NULL,
    external_id TEXT NOT NULL,
    url TEXT NOT NULL,
    url_canonical TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    title TEXT NOT NULL,
    source_domain TEXT NOT NULL,
    published_at TEXT NOT NULL,
    language_detected TEXT NOT NULL,
    content_raw TEXT,
    summary_raw TEXT,
    is_full_content INTEGER NOT NULL,
    clean_text TEXT NOT NULL,
    clean_text_chars INTEGER NOT NULL,
    is_truncated INTEGER NOT NULL,
    ingested_at TEXT NOT NULL,
    fallback_key TEXT,
    last_processed_run_id TEXT NOT NULL,
    UNIQUE (source_name, external_id)
);
CREATE INDEX IF NOT EXISTS idx_articles_url_hash ON articles (url_hash);
CREATE INDEX IF NOT EXISTS idx_articles_fallback_key ON articles (source_name, fallback_key);
CREATE INDEX IF NOT EXISTS idx_articles_published ON articles (published_at);

CREATE TABLE IF NOT EXISTS user_articles (
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    discovered_at TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'active',
    deleted_at TEXT,
    PRIMARY KEY (user_id, article_id)
);
CREATE INDEX IF NOT EXISTS idx_user_articles_user_discovered
    ON user_articles (user_id, discovered_at);
CREATE INDEX IF NOT EXISTS idx_user_articles_article ON user_articles (article_id);

CREATE TABLE IF NOT EXISTS article_external_ids (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    external_id TEXT NOT NULL,
    article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (source_name, external_id)
);
CREATE INDEX IF NOT EXISTS idx_article_external_ids_article
    ON article_external_ids (article_id);

CREATE TABLE IF NOT EXISTS articles_raw (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    source_name TEXT NOT NULL,
    external_id TEXT NOT NULL,
    raw_json TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    UNIQUE (source_name, external_id),
    UNIQUE (article_id)
);

CREATE TABLE IF NOT EXISTS article_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    model_name TEXT NOT NULL,
    embedding_dim INTEGER NOT NULL,
    embedding_blob BLOB NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    UNIQUE (article_id, model_name)
);

CREATE TABLE IF NOT EXISTS article_resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT REFERENCES users(user_id) ON DELETE CASCADE,
    url_hash TEXT NOT NULL,
    url_canonical TEXT NOT NULL,
    fetch_status TEXT NOT NULL,
    http_status INTEGER,
    content_text TEXT,
    error_code TEXT,
    fetched_at TEXT,
    updated_at TEXT NOT NULL,
    expires_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_article_resources_public_url_hash
    ON article_resources (url_hash) WHERE user_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_article_resources_private_user_url_hash
    ON article_resources (user_id, url_hash) WHERE user_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_article_resources_lookup
    ON article_resources (url_hash, user_id);

CREATE TABLE IF NOT EXISTS dedup_clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    run_id TEXT NOT NULL REFERENCES ingestion_runs(run_id),
    cluster_id TEXT NOT NULL,
    representative_article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    alt_sources_json TEXT NOT NULL,
    model_name TEXT NOT NULL,
    threshold REAL NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, run_id, cluster_id)
);

CREATE TABLE IF NOT EXISTS article_dedup (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    run_id TEXT NOT NULL,
    article_id TEXT NOT NULL REFERENCES articles(article_id) ON DELETE CASCADE,
    cluster_id TEXT NOT NULL,
    is_representative INTEGER NOT NULL,
    similarity_to_rep REAL NOT NULL,
    UNIQUE (user_id, run_id, article_id),
    FOREIGN KEY (user_id, run_id, cluster_id)
        REFERENCES dedup_clusters (user_id, run_id, cluster_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS llm_tasks (
    task_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    task_type TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 100,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 600,
    run_after TEXT NOT NULL,
    started_at TEXT,
    heartbeat_at TEXT,
    finished_at TEXT,
    failure_class TEXT,
    last_exit_code INTEGER,
    repair_attempted_at TEXT,
    worker_id TEXT,
    input_manifest_path TEXT NOT NULL,
    output_path TEXT,
    error_summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_llm_tasks_queue
    ON llm_tasks (user_id, status, priority, run_after);

CREATE TABLE IF NOT EXISTS llm_task_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES llm_tasks(task_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    status_from TEXT,
    status_to TEXT,
    details_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_llm_task_events_task_time
    ON llm_task_events (task_id, created_at);

CREATE TABLE IF NOT EXISTS llm_task_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES llm_tasks(task_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    checksum_sha256 TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_llm_task_artifacts_task_kind
    ON llm_task_artifacts (task_id, kind);

CREATE TABLE IF NOT EXISTS llm_task_attempts (
    attempt_id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES llm_tasks(task_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    attempt_no INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    worker_id TEXT,
    agent TEXT,
    model TEXT,
    profile TEXT,
    exit_code INTEGER,
    timed_out INTEGER NOT NULL DEFAULT 0,
    failure_class TEXT,
    attempt_failure_code TEXT,
    error_summary_sanitized TEXT,
    stdout_preview_sanitized TEXT,
    stderr_preview_sanitized TEXT,
    output_chars INTEGER,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    total_tokens INTEGER,
    usage_status TEXT,
    usage_source TEXT,
    usage_parser_version TEXT,
    estimated_cost_usd REAL,
    created_at TEXT NOT NULL,
    UNIQUE (task_id, attempt_no)
);
CREATE INDEX IF NOT EXISTS idx_llm_task_attempts_scope_time
    ON llm_task_attempts (user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_llm_task_attempts_task_type_time
    ON llm_task_attempts (task_type, created_at);
CREATE INDEX IF NOT EXISTS idx_llm_task_attempts_failure_time
    ON llm_task_attempts (failure_class, created_at);

CREATE TABLE IF NOT EXISTS output_citation_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    task_id TEXT NOT NULL REFERENCES llm_tasks(task_id) ON DELETE CASCADE,
    source_id TEXT NOT NULL,
    article_id TEXT,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT '',
    published_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, task_id, source_id)
);
CREATE INDEX IF NOT EXISTS idx_output_citation_snapshots_scope_task
    ON output_citation_snapshots (user_id, task_id);

CREATE TABLE IF NOT EXISTS recap_pipeline_runs (
    pipeline_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    business_date TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recap_pipeline_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL REFERENCES recap_pipeline_runs(pipeline_id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    task_id TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_outputs (
    output_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    business_date TEXT NOT NULL,
    status TEXT NOT NULL,
    story_id TEXT,
    monitor_id TEXT,
    request_id TEXT,
    task_id TEXT,
    title TEXT,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_user_outputs_highlights
    ON user_outputs (user_id, kind, business_date) WHERE kind = 'highlights';
CREATE UNIQUE INDEX IF NOT EXISTS uq_user_outputs_story
    ON user_outputs (user_id, kind, business_date, story_id) WHERE kind = 'story_details';
CREATE UNIQUE INDEX IF NOT EXISTS uq_user_outputs_monitor
    ON user_outputs (user_id, kind, business_date, monitor_id) WHERE kind = 'monitor_answer';
CREATE UNIQUE INDEX IF NOT EXISTS uq_user_outputs_qa
    ON user_outputs (user_id, kind, business_date, request_id) WHERE kind = 'qa_answer';

CREATE TABLE IF NOT EXISTS user_output_blocks (
    block_id INTEGER PRIMARY KEY AUTOINCREMENT,
    output_id TEXT NOT NULL REFERENCES user_outputs(output_id) ON DELETE CASCADE,
    block_order INTEGER NOT NULL,
    text TEXT NOT NULL,
    source_ids_json TEXT NOT NULL,
    UNIQUE (output_id, block_order)
);

CREATE TABLE IF NOT EXISTS read_state_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    output_id TEXT NOT NULL REFERENCES user_outputs(output_id) ON DELETE CASCADE,
    output_block_id INTEGER REFERENCES user_output_blocks(block_id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    details_json TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS output_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    output_id TEXT NOT NULL REFERENCES user_outputs(output_id) ON DELETE CASCADE,
    output_block_id INTEGER REFERENCES user_output_blocks(block_id) ON DELETE CASCADE,
    feedback_type TEXT NOT NULL,
    value TEXT,
    details_json TEXT,
    created_at TEXT NOT NULL
);
"#;
