//! Store error types

use thiserror::Error;

/// Errors surfaced by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid JSON in {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "another ingestion run is already active for this source \
         (source={source_name}, run_id={run_id}, heartbeat_at={heartbeat_at})"
    )]
    RunAlreadyActive {
        source_name: String,
        run_id: String,
        heartbeat_at: String,
    },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("external id collision for {source_name}:{external_id}: {existing} != {candidate}")]
    AliasCollision {
        source_name: String,
        external_id: String,
        existing: String,
        candidate: String,
    },

    #[error("task {task_id} in status {status}: {reason}")]
    InvalidTransition {
        task_id: String,
        status: String,
        reason: String,
    },

    #[error("invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    #[error("output not found: {0}")]
    OutputNotFound(String),

    #[error("block {block_id} does not belong to output {output_id}")]
    BlockMismatch { block_id: i64, output_id: String },

    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    /// Check whether the underlying failure is a uniqueness/FK violation.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
