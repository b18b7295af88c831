//! Deterministic backend failure classification
//!
//! A pure function over the agent, exit code, and captured output. Rules
//! are ordered; the first matching substring set wins.

use newsstore::FailureClass;
use serde_json::Value;

pub const CLASSIFIER_VERSION: i64 = 1;

const BILLING_OR_QUOTA_PATTERNS: [&str; 8] = [
    "quota",
    "resource_exhausted",
    "insufficient",
    "billing",
    "payment",
    "credits",
    "usage limit",
    "exceeded",
];
const ACCESS_OR_AUTH_PATTERNS: [&str; 7] = [
    "unauthorized",
    "forbidden",
    "permission denied",
    "invalid api key",
    "authentication",
    "auth",
    "restricted token",
];
const MODEL_NOT_AVAILABLE_PATTERNS: [&str; 6] = [
    "model not found",
    "unknown model",
    "unsupported model",
    "invalid model",
    "model is not available",
    "not available in your region",
];
const RATE_LIMIT_TRANSIENT_PATTERNS: [&str; 5] = [
    "too many requests",
    "rate limit",
    "429",
    "please retry",
    "try again later",
];
const GENERIC_TRANSIENT_PATTERNS: [&str; 6] = [
    "temporarily unavailable",
    "temporary failure",
    "connection reset",
    "network error",
    "could not resolve host",
    "dns",
];

/// Normalized failure classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailureClassification {
    pub failure_class: FailureClass,
    pub reason_code: String,
    pub matched_rule: String,
    pub matched_pattern: Option<String>,
}

impl BackendFailureClassification {
    /// Serialize classifier diagnostics for task events.
    pub fn to_event_details(&self, agent: &str, model: &str) -> Value {
        serde_json::json!({
            "classifier_version": CLASSIFIER_VERSION,
            "resolved_agent": agent,
            "resolved_model": model,
            "reason_code": self.reason_code,
            "matched_rule": self.matched_rule,
            "matched_pattern": self.matched_pattern,
        })
    }
}

/// Classify a non-timeout backend failure into a deterministic retry class.
pub fn classify_backend_failure(
    agent: &str,
    exit_code: i64,
    stdout: &str,
    stderr: &str,
    transient_exit_codes: &[i64],
) -> BackendFailureClassification {
    let haystack = format!("{stderr}\n{stdout}").to_lowercase();

    if let Some(pattern) = first_match(&haystack, &BILLING_OR_QUOTA_PATTERNS) {
        return classification(
            FailureClass::BillingOrQuota,
            agent,
            "billing_or_quota",
            Some(pattern),
        );
    }
    if let Some(pattern) = first_match(&haystack, &ACCESS_OR_AUTH_PATTERNS) {
        return classification(
            FailureClass::AccessOrAuth,
            agent,
            "access_or_auth",
            Some(pattern),
        );
    }
    if let Some(pattern) = first_match(&haystack, &MODEL_NOT_AVAILABLE_PATTERNS) {
        return classification(
            FailureClass::ModelNotAvailable,
            agent,
            "model_not_available",
            Some(pattern),
        );
    }
    if let Some(pattern) = first_match(&haystack, &RATE_LIMIT_TRANSIENT_PATTERNS) {
        return BackendFailureClassification {
            failure_class: FailureClass::BackendTransient,
            reason_code: format!("{agent}_rate_limit_transient"),
            matched_rule: "rate_limit_transient".to_string(),
            matched_pattern: Some(pattern.to_string()),
        };
    }

    let generic = first_match(&haystack, &GENERIC_TRANSIENT_PATTERNS);
    if generic.is_some() || transient_exit_codes.contains(&exit_code) {
        let matched_rule = if generic.is_none() {
            "transient_exit_code"
        } else {
            "generic_transient"
        };
        return BackendFailureClassification {
            failure_class: FailureClass::BackendTransient,
            reason_code: format!("{agent}_backend_transient"),
            matched_rule: matched_rule.to_string(),
            matched_pattern: generic.map(str::to_string),
        };
    }

    BackendFailureClassification {
        failure_class: FailureClass::BackendNonRetryable,
        reason_code: format!("{agent}_backend_non_retryable"),
        matched_rule: "fallback_non_retryable".to_string(),
        matched_pattern: None,
    }
}

fn classification(
    failure_class: FailureClass,
    agent: &str,
    rule: &str,
    pattern: Option<&str>,
) -> BackendFailureClassification {
    BackendFailureClassification {
        failure_class,
        reason_code: format!("{agent}_{rule}"),
        matched_rule: rule.to_string(),
        matched_pattern: pattern.map(str::to_string),
    }
}

fn first_match<'a>(haystack: &str, patterns: &'a [&'a str]) -> Option<&'a str> {
    patterns
        .iter()
        .find(|pattern| haystack.contains(*pattern))
        .copied()
}
