//! Task queue domain types
//!
//! Durable LLM task lifecycle states, failure classes used by the retry
//! policy, and the read/write payloads exchanged with the queue store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl LlmTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states are absorbing for complete/fail/retry transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled
        )
    }
}

impl std::fmt::Display for LlmTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized failure classes used by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    BackendTransient,
    BackendNonRetryable,
    OutputInvalidJson,
    SourceMappingFailed,
    InputContractError,
    BillingOrQuota,
    AccessOrAuth,
    ModelNotAvailable,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BackendTransient => "backend_transient",
            Self::BackendNonRetryable => "backend_non_retryable",
            Self::OutputInvalidJson => "output_invalid_json",
            Self::SourceMappingFailed => "source_mapping_failed",
            Self::InputContractError => "input_contract_error",
            Self::BillingOrQuota => "billing_or_quota",
            Self::AccessOrAuth => "access_or_auth",
            Self::ModelNotAvailable => "model_not_available",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "timeout" => Some(Self::Timeout),
            "backend_transient" => Some(Self::BackendTransient),
            "backend_non_retryable" => Some(Self::BackendNonRetryable),
            "output_invalid_json" => Some(Self::OutputInvalidJson),
            "source_mapping_failed" => Some(Self::SourceMappingFailed),
            "input_contract_error" => Some(Self::InputContractError),
            "billing_or_quota" => Some(Self::BillingOrQuota),
            "access_or_auth" => Some(Self::AccessOrAuth),
            "model_not_available" => Some(Self::ModelNotAvailable),
            _ => None,
        }
    }

    /// Only these classes participate in automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::BackendTransient)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input payload for enqueuing an LLM task
#[derive(Debug, Clone)]
pub struct LlmTaskCreate {
    pub task_type: String,
    pub task_id: Option<String>,
    pub priority: i64,
    pub max_attempts: i64,
    pub timeout_seconds: i64,
    pub run_after: Option<DateTime<Utc>>,
    pub input_manifest_path: String,
    pub output_path: Option<String>,
}

impl LlmTaskCreate {
    pub fn new(task_type: impl Into<String>, input_manifest_path: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            task_id: None,
            priority: 100,
            max_attempts: 3,
            timeout_seconds: 600,
            run_after: None,
            input_manifest_path: input_manifest_path.into(),
            output_path: None,
        }
    }
}

/// Readable task view for CLI and worker logic
#[derive(Debug, Clone)]
pub struct LlmTaskView {
    pub task_id: String,
    pub user_id: String,
    pub task_type: String,
    pub priority: i64,
    pub status: LlmTaskStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub timeout_seconds: i64,
    pub run_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_class: Option<FailureClass>,
    pub last_exit_code: Option<i64>,
    pub repair_attempted_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub input_manifest_path: String,
    pub output_path: Option<String>,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task event entry for the audit trail
#[derive(Debug, Clone)]
pub struct LlmTaskEventView {
    pub event_id: i64,
    pub task_id: String,
    pub event_type: String,
    pub status_from: Option<LlmTaskStatus>,
    pub status_to: Option<LlmTaskStatus>,
    pub created_at: DateTime<Utc>,
    pub details: Value,
}

/// Artifact metadata captured during execution
#[derive(Debug, Clone)]
pub struct LlmTaskArtifactWrite {
    pub kind: String,
    pub path: String,
    pub size_bytes: i64,
    pub checksum_sha256: Option<String>,
}

/// Per-attempt telemetry captured by the worker
#[derive(Debug, Clone, Default)]
pub struct LlmTaskAttemptWrite {
    pub attempt_no: i64,
    pub task_type: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub worker_id: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub failure_class: Option<FailureClass>,
    pub attempt_failure_code: Option<String>,
    pub error_summary_sanitized: Option<String>,
    pub stdout_preview_sanitized: Option<String>,
    pub stderr_preview_sanitized: Option<String>,
    pub output_chars: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub usage_status: Option<String>,
    pub usage_source: Option<String>,
    pub usage_parser_version: Option<String>,
    pub estimated_cost_usd: Option<f64>,
}

/// Task details with event stream
#[derive(Debug, Clone)]
pub struct LlmTaskDetails {
    pub task: LlmTaskView,
    pub events: Vec<LlmTaskEventView>,
}

/// Immutable citation snapshot captured when a task succeeds
#[derive(Debug, Clone)]
pub struct OutputCitationWrite {
    pub source_id: String,
    pub article_id: Option<String>,
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Stored citation snapshot row
#[derive(Debug, Clone)]
pub struct OutputCitationView {
    pub task_id: String,
    pub source_id: String,
    pub article_id: Option<String>,
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(!LlmTaskStatus::Queued.is_terminal());
        assert!(!LlmTaskStatus::Running.is_terminal());
        assert!(LlmTaskStatus::Succeeded.is_terminal());
        assert!(LlmTaskStatus::Failed.is_terminal());
        assert!(LlmTaskStatus::Timeout.is_terminal());
        assert!(LlmTaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_failure_class_retryable() {
        assert!(FailureClass::Timeout.is_retryable());
        assert!(FailureClass::BackendTransient.is_retryable());
        assert!(!FailureClass::BackendNonRetryable.is_retryable());
        assert!(!FailureClass::OutputInvalidJson.is_retryable());
        assert!(!FailureClass::SourceMappingFailed.is_retryable());
        assert!(!FailureClass::InputContractError.is_retryable());
        assert!(!FailureClass::BillingOrQuota.is_retryable());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            LlmTaskStatus::Queued,
            LlmTaskStatus::Running,
            LlmTaskStatus::Succeeded,
            LlmTaskStatus::Failed,
            LlmTaskStatus::Timeout,
            LlmTaskStatus::Canceled,
        ] {
            assert_eq!(LlmTaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_failure_class_round_trip() {
        for class in [
            FailureClass::Timeout,
            FailureClass::BackendTransient,
            FailureClass::BackendNonRetryable,
            FailureClass::OutputInvalidJson,
            FailureClass::SourceMappingFailed,
            FailureClass::InputContractError,
            FailureClass::BillingOrQuota,
            FailureClass::AccessOrAuth,
            FailureClass::ModelNotAvailable,
        ] {
            assert_eq!(FailureClass::parse(class.as_str()), Some(class));
        }
    }
}
