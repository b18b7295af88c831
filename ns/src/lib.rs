//! NewsStore - SQLite persistence for the news recap core
//!
//! One shared relational store backs the whole system: ingestion runs,
//! articles and per-user links, dedup clusters and embeddings, the durable
//! LLM task queue with events/artifacts/attempts, citation snapshots,
//! recap pipeline state, and business-level user outputs.
//!
//! Every public store method executes as a single transaction. Components
//! open their own [`Store`] over the same database file; WAL mode plus a
//! busy timeout make concurrent writers safe.
//!
//! # Modules
//!
//! - [`models`] - ingestion and dedup domain types
//! - [`tasks`] - task queue domain types
//! - [`outputs`] - business output domain types
//! - [`store`] - connection management and the [`Store`] handle
//! - [`schema`] - table and index definitions

pub mod error;
pub mod ingest;
pub mod models;
pub mod outputs;
pub mod pipeline;
pub mod queue;
pub mod schema;
pub mod store;
pub mod tasks;

pub use error::{Result, StoreError};
pub use ingest::{build_alt_sources, ArticleResourceView, ArticleResourceWrite};
pub use models::{
    AltSource, ClusterListResult, ClusterMember, ClusterMemberPreview, ClusterPreview,
    DedupCandidate, DedupCluster, GapStatus, GapWrite, GlobalGcResult, IngestionGap,
    IngestionRunCounters, IngestionRunView, IngestionWindowStats, NormalizedArticle,
    RetentionPruneResult, RunStatus, SourceArticle, SourceCorpusEntry, SourcePage, UpsertAction,
    UpsertResult,
};
pub use outputs::{
    OutputFeedbackWrite, ReadStateEventWrite, UserOutputBlockWrite, UserOutputUpsert,
    UserOutputView,
};
pub use pipeline::{PipelineRunView, PipelineStepStatus};
pub use store::{Store, UserContext, DEFAULT_USER_ID};
pub use tasks::{
    FailureClass, LlmTaskArtifactWrite, LlmTaskAttemptWrite, LlmTaskCreate, LlmTaskDetails,
    LlmTaskEventView, LlmTaskStatus, LlmTaskView, OutputCitationView, OutputCitationWrite,
};
