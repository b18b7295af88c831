//! NewsRecap - ingestion and LLM task orchestration daemon
//!
//! NewsRecap periodically ingests articles from RSS/Atom feeds,
//! deduplicates them semantically, and drives long-running LLM CLI
//! subprocess jobs through a durable, retryable task queue that
//! coordinates multi-step recap generation.
//!
//! # Core Concepts
//!
//! - **Durable queue**: every LLM job is a row with a CAS-guarded
//!   lifecycle; workers claim atomically and can crash safely
//! - **File-based contracts**: agents read and write a per-task workdir,
//!   never the database
//! - **Crash-safe ingestion**: feed snapshots and page cursors make an
//!   interrupted run resume without refetching
//! - **Deterministic failure handling**: classification, retry with
//!   jitter, and one in-attempt repair are all pure decisions
//!
//! # Modules
//!
//! - [`ingestion`] - RSS source, normalization, dedup, run lifecycle
//! - [`orchestrator`] - contracts, routing, backend, worker, smoke
//! - [`recap`] - the six-step digest pipeline coordinator
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod ingestion;
pub mod orchestrator;
pub mod recap;

// Re-export commonly used types
pub use config::Config;
pub use ingestion::dedup::{build_embedder, DedupStage, DedupStageConfig, Embedder, HashingEmbedder};
pub use ingestion::rss::{
    FeedTransport, HttpFeedTransport, RssSource, RssSourceConfig, SourceAdapter, SourceError,
};
pub use ingestion::{IngestionConfig, IngestionOrchestrator, IngestionSummary};
pub use orchestrator::{
    AgentBackend, BackendRunError, BackendRunRequest, BackendRunResult, CliAgentBackend,
    FrozenRouting, OrchestratorWorker, RoutingDefaults, TaskWorkdirManager, WorkerConfig,
    WorkerRunSummary,
};
pub use recap::{
    PipelineRunResult, PipelineStepResult, RecapConfig, RecapPipelineRunner, RecapStepError,
    UserPreferences,
};
