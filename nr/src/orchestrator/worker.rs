//! Queue worker that executes CLI-backed LLM tasks
//!
//! One `run_once` cycle claims a task, reads its file contracts, resolves
//! routing, executes the backend, classifies failures, applies the retry
//! policy, validates output with one optional in-attempt repair, persists
//! citation snapshots, and finalizes an attempt telemetry row on every
//! path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use eyre::Result;
use newsstore::{
    FailureClass, LlmTaskArtifactWrite, LlmTaskAttemptWrite, LlmTaskStatus, LlmTaskView,
    OutputCitationWrite, Store,
};
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::{AgentBackend, BackendRunRequest, BackendRunResult};
use super::classifier::classify_backend_failure;
use super::contracts::{read_articles_index, read_manifest, read_task_input, ArticleIndexEntry};
use super::routing::{resolve_routing_for_execution, FrozenRouting, RoutingDefaults};
use super::usage::extract_usage;
use super::validator::{is_recap_task_type, validate_output_contract, ValidationResult};
use crate::orchestrator::pricing::estimate_cost_usd;

const PREVIEW_LIMIT_CHARS: usize = 1_200;

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"));

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval_seconds: f64,
    pub retry_base_seconds: i64,
    pub retry_max_seconds: i64,
    pub timeout_retry_cap_seconds: i64,
    pub transient_exit_codes: Vec<i64>,
    pub stale_task_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-default".to_string(),
            poll_interval_seconds: 2.0,
            retry_base_seconds: 30,
            retry_max_seconds: 900,
            timeout_retry_cap_seconds: 1_800,
            transient_exit_codes: vec![137, 143],
            stale_task_after: Duration::seconds(1_800),
        }
    }
}

/// Aggregate worker counters for CLI reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerRunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub timeouts: u64,
    pub idle_polls: u64,
}

impl WorkerRunSummary {
    fn absorb(&mut self, other: WorkerRunSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self.timeouts += other.timeouts;
        self.idle_polls += other.idle_polls;
    }
}

struct AttemptTracker {
    attempt_no: i64,
    task_type: String,
    worker_id: String,
    started_at: DateTime<Utc>,
    agent: Option<String>,
    model: Option<String>,
    profile: Option<String>,
    exit_code: Option<i64>,
    timed_out: bool,
    failure_class: Option<FailureClass>,
    attempt_failure_code: Option<String>,
    error_summary: Option<String>,
    stdout_preview: Option<String>,
    stderr_preview: Option<String>,
    output_chars: Option<i64>,
}

impl AttemptTracker {
    fn new(task: &LlmTaskView, worker_id: &str) -> Self {
        Self {
            attempt_no: task.attempt,
            task_type: task.task_type.clone(),
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
            agent: None,
            model: None,
            profile: None,
            exit_code: None,
            timed_out: false,
            failure_class: None,
            attempt_failure_code: None,
            error_summary: None,
            stdout_preview: None,
            stderr_preview: None,
            output_chars: None,
        }
    }

    fn routing(&mut self, routing: &FrozenRouting) {
        self.agent = Some(routing.agent.clone());
        self.model = Some(routing.model.clone());
        self.profile = Some(routing.profile.clone());
    }

    fn finalize(self, status: &str) -> LlmTaskAttemptWrite {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0);
        let usage = extract_usage(
            self.agent.as_deref().unwrap_or(""),
            self.stdout_preview.as_deref().unwrap_or(""),
            self.stderr_preview.as_deref().unwrap_or(""),
        );
        let estimated_cost_usd = match (&self.agent, &self.model) {
            (Some(agent), Some(model)) => estimate_cost_usd(
                agent,
                model,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
            ),
            _ => None,
        };
        LlmTaskAttemptWrite {
            attempt_no: self.attempt_no,
            task_type: self.task_type,
            status: status.to_string(),
            started_at: Some(self.started_at),
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            worker_id: Some(self.worker_id),
            agent: self.agent,
            model: self.model,
            profile: self.profile,
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            failure_class: self.failure_class,
            attempt_failure_code: self.attempt_failure_code,
            error_summary_sanitized: self.error_summary.as_deref().map(sanitize_preview),
            stdout_preview_sanitized: self.stdout_preview.clone(),
            stderr_preview_sanitized: self.stderr_preview.clone(),
            output_chars: self.output_chars,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            usage_status: Some(usage.usage_status),
            usage_source: Some(usage.usage_source),
            usage_parser_version: Some(usage.parser_version),
            estimated_cost_usd,
        }
    }
}

/// Consumes queued tasks and executes them via the backend seam.
pub struct OrchestratorWorker<B: AgentBackend> {
    store: Store,
    backend: B,
    routing_defaults: RoutingDefaults,
    config: WorkerConfig,
}

impl<B: AgentBackend> OrchestratorWorker<B> {
    pub fn new(
        store: Store,
        backend: B,
        routing_defaults: RoutingDefaults,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            routing_defaults,
            config,
        }
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Requeue running tasks with stale heartbeats.
    pub fn recover_stale(&mut self) -> Result<i64> {
        Ok(self
            .store
            .recover_stale_running_tasks(self.config.stale_task_after)?)
    }

    /// Process at most one task from the queue.
    pub async fn run_once(&mut self) -> Result<WorkerRunSummary> {
        let mut summary = WorkerRunSummary::default();
        let Some(task) = self.store.claim_next_ready_task(&self.config.worker_id)? else {
            summary.idle_polls = 1;
            return Ok(summary);
        };
        summary.processed = 1;
        debug!(task_id = %task.task_id, task_type = %task.task_type, attempt = task.attempt, "claimed task");

        let mut tracker = AttemptTracker::new(&task, &self.config.worker_id);
        let manifest_path = PathBuf::from(&task.input_manifest_path);
        let contracts = read_manifest(&manifest_path).and_then(|manifest| {
            let task_input = read_task_input(Path::new(&manifest.task_input_path))?;
            let entries = read_articles_index(Path::new(&manifest.articles_index_path))?;
            Ok((manifest, task_input, entries))
        });
        let (manifest, task_input, article_entries) = match contracts {
            Ok(parts) => parts,
            Err(error) => {
                let message = format!("Input contract error: {error}");
                tracker.failure_class = Some(FailureClass::InputContractError);
                tracker.error_summary = Some(message.clone());
                let failed = self.store.fail_task(
                    &task.task_id,
                    LlmTaskStatus::Failed,
                    FailureClass::InputContractError,
                    &message,
                    None,
                    None,
                )?;
                if failed {
                    summary.failed = 1;
                }
                self.record_attempt(&task.task_id, tracker, "failed")?;
                return Ok(summary);
            }
        };

        let allowed_source_ids: HashSet<String> = article_entries
            .iter()
            .map(|entry| entry.source_id.clone())
            .collect();
        let (routing, fallback_reason) = resolve_routing_for_execution(
            &task_input.metadata,
            &task.task_type,
            &self.routing_defaults,
        )?;
        tracker.routing(&routing);
        if let Some(reason) = fallback_reason {
            self.store.add_task_event(
                &task.task_id,
                "routing_fallback_applied",
                Some(LlmTaskStatus::Running),
                Some(LlmTaskStatus::Running),
                Some(serde_json::json!({
                    "reason": reason,
                    "routing": routing.to_metadata(),
                })),
            )?;
        }

        let execution = match self
            .execute_backend(&task, &manifest_path, &routing, false)
            .await
        {
            Ok(execution) => execution,
            Err(error) => {
                let failure_class = if error.transient {
                    FailureClass::BackendTransient
                } else {
                    FailureClass::BackendNonRetryable
                };
                let details = serde_json::json!({
                    "reason_code": format!("{}_backend_run_error", routing.agent),
                    "resolved_agent": routing.agent,
                    "resolved_model": routing.model,
                    "resolved_profile": routing.profile,
                });
                tracker.failure_class = Some(failure_class);
                tracker.error_summary = Some(error.message.clone());
                tracker.attempt_failure_code =
                    Some(format!("{}_backend_run_error", routing.agent));

                if failure_class == FailureClass::BackendTransient {
                    let outcome = self.retry_or_fail(
                        &task,
                        failure_class,
                        &error.message,
                        None,
                        task.timeout_seconds,
                        LlmTaskStatus::Failed,
                        Some(details),
                    )?;
                    apply_outcome(&mut summary, outcome, false);
                    let status = if outcome.0 { "retried" } else { "failed" };
                    self.record_attempt(&task.task_id, tracker, status)?;
                    return Ok(summary);
                }

                let failed = self.store.fail_task(
                    &task.task_id,
                    LlmTaskStatus::Failed,
                    failure_class,
                    &error.message,
                    None,
                    Some(details),
                )?;
                if failed {
                    summary.failed = 1;
                }
                self.record_attempt(&task.task_id, tracker, "failed")?;
                return Ok(summary);
            }
        };

        tracker.exit_code = Some(execution.exit_code);
        tracker.timed_out = execution.timed_out;
        tracker.stdout_preview = Some(read_preview(&execution.stdout_path));
        tracker.stderr_preview = Some(read_preview(&execution.stderr_path));

        if execution.timed_out {
            let next_timeout = ((task.timeout_seconds as f64) * 1.5) as i64;
            let timeout_seconds = next_timeout.min(self.config.timeout_retry_cap_seconds);
            tracker.failure_class = Some(FailureClass::Timeout);
            tracker.error_summary = Some("Task timed out.".to_string());
            let outcome = self.retry_or_fail(
                &task,
                FailureClass::Timeout,
                "Task timed out.",
                Some(execution.exit_code),
                timeout_seconds,
                LlmTaskStatus::Timeout,
                None,
            )?;
            apply_outcome(&mut summary, outcome, true);
            let status = if outcome.0 { "retried" } else { "timeout" };
            self.record_attempt(&task.task_id, tracker, status)?;
            return Ok(summary);
        }

        if execution.exit_code != 0 {
            let stdout_preview = tracker.stdout_preview.clone().unwrap_or_default();
            let stderr_preview = tracker.stderr_preview.clone().unwrap_or_default();
            let classification = classify_backend_failure(
                &routing.agent,
                execution.exit_code,
                &stdout_preview,
                &stderr_preview,
                &self.config.transient_exit_codes,
            );
            let mut details = classification.to_event_details(&routing.agent, &routing.model);
            if let Some(object) = details.as_object_mut() {
                object.insert(
                    "resolved_profile".to_string(),
                    Value::String(routing.profile.clone()),
                );
                object.insert(
                    "stdout_preview".to_string(),
                    Value::String(stdout_preview.clone()),
                );
                object.insert(
                    "stderr_preview".to_string(),
                    Value::String(stderr_preview.clone()),
                );
            }
            let error_summary = format!(
                "{}: backend exited with code {}.",
                classification.reason_code, execution.exit_code
            );
            tracker.failure_class = Some(classification.failure_class);
            tracker.attempt_failure_code = Some(classification.reason_code.clone());
            tracker.error_summary = Some(error_summary.clone());

            if classification.failure_class == FailureClass::BackendTransient {
                let outcome = self.retry_or_fail(
                    &task,
                    classification.failure_class,
                    &error_summary,
                    Some(execution.exit_code),
                    task.timeout_seconds,
                    LlmTaskStatus::Failed,
                    Some(details),
                )?;
                apply_outcome(&mut summary, outcome, false);
                let status = if outcome.0 { "retried" } else { "failed" };
                self.record_attempt(&task.task_id, tracker, status)?;
                return Ok(summary);
            }

            let failed = self.store.fail_task(
                &task.task_id,
                LlmTaskStatus::Failed,
                classification.failure_class,
                &error_summary,
                Some(execution.exit_code),
                Some(details),
            )?;
            if failed {
                summary.failed = 1;
            }
            self.record_attempt(&task.task_id, tracker, "failed")?;
            return Ok(summary);
        }

        // Exit code zero: validate the output contract.
        let output_path = PathBuf::from(&manifest.output_result_path);
        let validation =
            validate_output_contract(&output_path, &task.task_type, &allowed_source_ids);
        tracker.output_chars = output_chars(&output_path);

        if validation.is_valid {
            self.store.add_task_event(
                &task.task_id,
                "first_pass_validation_passed",
                Some(LlmTaskStatus::Running),
                Some(LlmTaskStatus::Running),
                Some(serde_json::json!({
                    "schema_valid": true,
                    "source_mapping_valid": true,
                })),
            )?;
            let completed = self.complete_with_citations(
                &task,
                &manifest.output_result_path,
                &article_entries,
                &validation,
                execution.exit_code,
                &mut summary,
            )?;
            let status = if completed { "succeeded" } else { "failed" };
            self.record_attempt(&task.task_id, tracker, status)?;
            return Ok(summary);
        }

        let failure_class = validation
            .failure_class
            .unwrap_or(FailureClass::OutputInvalidJson);
        let error_summary = validation
            .error_summary
            .clone()
            .unwrap_or_else(|| "Unknown validation failure.".to_string());
        self.store.add_task_event(
            &task.task_id,
            "first_pass_validation_failed",
            Some(LlmTaskStatus::Running),
            Some(LlmTaskStatus::Running),
            Some(serde_json::json!({
                "failure_class": failure_class.as_str(),
                "error_summary": error_summary,
            })),
        )?;
        tracker.failure_class = Some(failure_class);
        tracker.error_summary = Some(error_summary.clone());

        if decide_repair(failure_class, task.repair_attempted_at)
            && self.store.mark_repair_attempted(&task.task_id)?
        {
            info!(task_id = %task.task_id, "running one repair pass");
            let repair = self
                .execute_backend(&task, &manifest_path, &routing, true)
                .await;
            if let Ok(repair_execution) = repair {
                tracker.exit_code = Some(repair_execution.exit_code);
                if repair_execution.exit_code == 0 && !repair_execution.timed_out {
                    let repaired = validate_output_contract(
                        &output_path,
                        &task.task_type,
                        &allowed_source_ids,
                    );
                    if repaired.is_valid {
                        tracker.output_chars = output_chars(&output_path);
                        tracker.failure_class = None;
                        tracker.error_summary = None;
                        let completed = self.complete_with_citations(
                            &task,
                            &manifest.output_result_path,
                            &article_entries,
                            &repaired,
                            repair_execution.exit_code,
                            &mut summary,
                        )?;
                        let status = if completed { "succeeded" } else { "failed" };
                        self.record_attempt(&task.task_id, tracker, status)?;
                        return Ok(summary);
                    }
                }
            }
        }

        // Failed repair never retries; the original failure is terminal.
        let failed = self.store.fail_task(
            &task.task_id,
            LlmTaskStatus::Failed,
            failure_class,
            &error_summary,
            Some(execution.exit_code),
            None,
        )?;
        if failed {
            summary.failed = 1;
        }
        self.record_attempt(&task.task_id, tracker, "failed")?;
        Ok(summary)
    }

    /// Run the worker loop until the queue is idle or max_tasks is hit.
    pub async fn run_loop(&mut self, max_tasks: Option<u64>) -> Result<WorkerRunSummary> {
        let mut aggregate = WorkerRunSummary::default();
        loop {
            if let Some(max_tasks) = max_tasks {
                if aggregate.processed >= max_tasks {
                    return Ok(aggregate);
                }
            }

            let summary = self.run_once().await?;
            let processed = summary.processed;
            aggregate.absorb(summary);

            if processed == 0 {
                return Ok(aggregate);
            }
            if max_tasks.is_none() && self.config.poll_interval_seconds > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(
                    self.config.poll_interval_seconds,
                ))
                .await;
            }
        }
    }

    async fn execute_backend(
        &mut self,
        task: &LlmTaskView,
        manifest_path: &Path,
        routing: &FrozenRouting,
        repair_mode: bool,
    ) -> std::result::Result<BackendRunResult, super::backend::BackendRunError> {
        let result = self
            .backend
            .run(&BackendRunRequest {
                manifest_path: manifest_path.to_path_buf(),
                timeout_seconds: task.timeout_seconds,
                agent: routing.agent.clone(),
                profile: routing.profile.clone(),
                model: routing.model.clone(),
                command_template: routing.command_template.clone(),
                repair_mode,
            })
            .await;
        if let Ok(execution) = &result {
            self.record_artifacts(&task.task_id, execution);
        }
        result
    }

    fn record_artifacts(&mut self, task_id: &str, execution: &BackendRunResult) {
        for (kind, path) in [
            ("stdout_log", &execution.stdout_path),
            ("stderr_log", &execution.stderr_path),
        ] {
            if !path.exists() {
                continue;
            }
            let size_bytes = std::fs::metadata(path)
                .map(|meta| meta.len() as i64)
                .unwrap_or(0);
            let artifact = LlmTaskArtifactWrite {
                kind: kind.to_string(),
                path: path.display().to_string(),
                size_bytes,
                checksum_sha256: None,
            };
            if let Err(error) = self.store.add_artifact(task_id, &artifact) {
                warn!(task_id, kind, %error, "failed to record artifact");
            }
        }
    }

    fn record_attempt(
        &mut self,
        task_id: &str,
        tracker: AttemptTracker,
        status: &str,
    ) -> Result<()> {
        let attempt = tracker.finalize(status);
        self.store.record_attempt(task_id, &attempt)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn retry_or_fail(
        &mut self,
        task: &LlmTaskView,
        failure_class: FailureClass,
        error_summary: &str,
        last_exit_code: Option<i64>,
        timeout_seconds: i64,
        status_on_final: LlmTaskStatus,
        details: Option<Value>,
    ) -> Result<(bool, bool)> {
        let retries_left = task.attempt < task.max_attempts;
        if retries_left && failure_class.is_retryable() {
            let delay_seconds = self.compute_retry_delay(task.attempt);
            let run_after = Utc::now()
                + Duration::milliseconds((delay_seconds * 1_000.0) as i64);
            let retried = self.store.schedule_retry(
                &task.task_id,
                run_after,
                timeout_seconds,
                failure_class,
                error_summary,
                last_exit_code,
                details,
            )?;
            return Ok((retried, false));
        }

        let failed = self.store.fail_task(
            &task.task_id,
            status_on_final,
            failure_class,
            error_summary,
            last_exit_code,
            details,
        )?;
        Ok((false, failed))
    }

    /// Delay drawn uniformly from [0, cap]; the cap doubles per attempt.
    fn compute_retry_delay(&self, retry_number: i64) -> f64 {
        let cap = retry_delay_cap(
            self.config.retry_base_seconds,
            self.config.retry_max_seconds,
            retry_number,
        );
        rand::rng().random_range(0.0..=cap)
    }

    fn complete_with_citations(
        &mut self,
        task: &LlmTaskView,
        output_path: &str,
        article_entries: &[ArticleIndexEntry],
        validation: &ValidationResult,
        exit_code: i64,
        summary: &mut WorkerRunSummary,
    ) -> Result<bool> {
        // Recap task outputs never produce citation snapshots.
        let citations = if is_recap_task_type(&task.task_type) {
            Vec::new()
        } else {
            match build_output_citations(article_entries, validation.payload.as_ref()) {
                Ok(citations) => citations,
                Err(error) => {
                    let failed = self.store.fail_task(
                        &task.task_id,
                        LlmTaskStatus::Failed,
                        FailureClass::BackendNonRetryable,
                        &format!("Citation snapshot persist failed: {error}"),
                        Some(exit_code),
                        None,
                    )?;
                    if failed {
                        summary.failed = 1;
                    }
                    return Ok(false);
                }
            }
        };

        let completed = self
            .store
            .complete_task(&task.task_id, output_path, &citations)?;
        if completed {
            summary.succeeded = 1;
        }
        Ok(completed)
    }
}

fn apply_outcome(summary: &mut WorkerRunSummary, outcome: (bool, bool), timeout: bool) {
    let (retried, failed) = outcome;
    if retried {
        summary.retried = 1;
    } else if failed {
        summary.failed = 1;
        if timeout {
            summary.timeouts = 1;
        }
    }
}

/// Repair is allowed once per attempt, only for validation-class failures.
pub fn decide_repair(
    failure_class: FailureClass,
    repair_attempted_at: Option<DateTime<Utc>>,
) -> bool {
    repair_attempted_at.is_none()
        && matches!(
            failure_class,
            FailureClass::OutputInvalidJson | FailureClass::SourceMappingFailed
        )
}

/// Upper bound of the retry delay distribution.
pub fn retry_delay_cap(retry_base_seconds: i64, retry_max_seconds: i64, retry_number: i64) -> f64 {
    let exponent = (retry_number - 1).max(0).min(32) as u32;
    let grown = retry_base_seconds.saturating_mul(1_i64 << exponent);
    grown.min(retry_max_seconds) as f64
}

fn read_preview(path: &Path) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let compact = sanitize_preview(text.trim());
    compact.chars().take(PREVIEW_LIMIT_CHARS).collect()
}

fn sanitize_preview(text: &str) -> String {
    let stripped = ANSI_ESCAPE_RE.replace_all(text, "");
    stripped
        .chars()
        .filter(|ch| !ch.is_control() || *ch == '\n' || *ch == '\t')
        .collect()
}

fn output_chars(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path)
        .ok()
        .map(|raw| raw.chars().count() as i64)
}

/// One citation per distinct source id, in block order.
fn build_output_citations(
    article_entries: &[ArticleIndexEntry],
    payload: Option<&Value>,
) -> std::result::Result<Vec<OutputCitationWrite>, String> {
    let payload =
        payload.ok_or_else(|| "Validation payload is missing for citation snapshot persistence.".to_string())?;
    let blocks = payload
        .get("blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| "Validation payload has invalid blocks for citation snapshots.".to_string())?;

    let mut ordered: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for block in blocks {
        let Some(source_ids) = block.get("source_ids").and_then(Value::as_array) else {
            continue;
        };
        for source_id in source_ids.iter().filter_map(Value::as_str) {
            if seen.insert(source_id) {
                ordered.push(source_id);
            }
        }
    }

    let entries_by_source_id: HashMap<&str, &ArticleIndexEntry> = article_entries
        .iter()
        .map(|entry| (entry.source_id.as_str(), entry))
        .collect();
    let mut citations = Vec::with_capacity(ordered.len());
    for source_id in ordered {
        let entry = entries_by_source_id
            .get(source_id)
            .ok_or_else(|| format!("Source id missing in article index: {source_id}"))?;
        citations.push(OutputCitationWrite {
            source_id: source_id.to_string(),
            article_id: article_id_from_source_id(source_id),
            title: entry.title.clone(),
            url: entry.url.clone(),
            source: entry.source.clone(),
            published_at: entry
                .published_at
                .as_deref()
                .and_then(parse_optional_datetime),
        });
    }
    Ok(citations)
}

fn article_id_from_source_id(source_id: &str) -> Option<String> {
    let article_id = source_id.strip_prefix("article:")?.trim();
    if article_id.is_empty() {
        return None;
    }
    Some(article_id.to_string())
}

fn parse_optional_datetime(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::backend::BackendRunError;
    use crate::orchestrator::contracts::{read_manifest, TaskInput};
    use crate::orchestrator::routing::test_defaults;
    use crate::orchestrator::workdir::{MaterializeOptions, TaskWorkdirManager};
    use async_trait::async_trait;
    use newsstore::LlmTaskCreate;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scripted backend run: what to do when invoked.
    enum Script {
        /// Exit with code, writing stdout/stderr and optionally the result file.
        Exit {
            code: i64,
            stdout: String,
            stderr: String,
            result: Option<String>,
        },
        Timeout,
        Error { transient: bool },
    }

    struct ScriptedBackend {
        runs: Mutex<Vec<Script>>,
        repair_modes: Mutex<Vec<bool>>,
    }

    impl ScriptedBackend {
        fn new(runs: Vec<Script>) -> Self {
            Self {
                runs: Mutex::new(runs),
                repair_modes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn run(
            &self,
            request: &BackendRunRequest,
        ) -> std::result::Result<BackendRunResult, BackendRunError> {
            self.repair_modes.lock().unwrap().push(request.repair_mode);
            let manifest = read_manifest(&request.manifest_path)
                .map_err(|error| BackendRunError::terminal(error.to_string()))?;
            let stdout_path = PathBuf::from(&manifest.output_stdout_path);
            let stderr_path = PathBuf::from(&manifest.output_stderr_path);

            let script = self.runs.lock().unwrap().remove(0);
            match script {
                Script::Exit {
                    code,
                    stdout,
                    stderr,
                    result,
                } => {
                    std::fs::write(&stdout_path, stdout).unwrap();
                    std::fs::write(&stderr_path, stderr).unwrap();
                    if let Some(result) = result {
                        std::fs::write(&manifest.output_result_path, result).unwrap();
                    }
                    Ok(BackendRunResult {
                        exit_code: code,
                        timed_out: false,
                        stdout_path,
                        stderr_path,
                    })
                }
                Script::Timeout => {
                    std::fs::write(&stdout_path, "").unwrap();
                    std::fs::write(&stderr_path, "").unwrap();
                    Ok(BackendRunResult {
                        exit_code: 124,
                        timed_out: true,
                        stdout_path,
                        stderr_path,
                    })
                }
                Script::Error { transient } => Err(BackendRunError {
                    message: "backend exploded".to_string(),
                    transient,
                }),
            }
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        worker: OrchestratorWorker<ScriptedBackend>,
        task_id: String,
    }

    fn harness(runs: Vec<Script>) -> Harness {
        harness_with_timeout(runs, 600)
    }

    fn harness_with_timeout(runs: Vec<Script>, timeout_seconds: i64) -> Harness {
        let temp = tempdir().unwrap();
        let mut store = Store::open_default(temp.path().join("worker.db")).unwrap();
        let defaults = test_defaults().validated().unwrap();

        let workdir = TaskWorkdirManager::new(temp.path().join("workdir"));
        let task_id = "task-under-test".to_string();
        let routing = crate::orchestrator::routing::resolve_routing_for_enqueue(
            &defaults,
            "highlights",
            None,
            None,
            None,
        )
        .unwrap();
        let materialized = workdir
            .materialize(
                &task_id,
                "highlights",
                &TaskInput {
                    task_type: "highlights".to_string(),
                    prompt: "Summarize.".to_string(),
                    metadata: serde_json::json!({"routing": routing.to_metadata()}),
                },
                &[
                    ArticleIndexEntry {
                        source_id: "article:a".to_string(),
                        title: "A".to_string(),
                        url: "https://example.com/a".to_string(),
                        source: "example.com".to_string(),
                        published_at: Some("2026-03-01T10:00:00Z".to_string()),
                    },
                    ArticleIndexEntry {
                        source_id: "article:b".to_string(),
                        title: "B".to_string(),
                        url: "https://example.com/b".to_string(),
                        source: "example.com".to_string(),
                        published_at: None,
                    },
                ],
                &MaterializeOptions::default(),
            )
            .unwrap();

        let mut create = LlmTaskCreate::new(
            "highlights",
            materialized.manifest_path.display().to_string(),
        );
        create.task_id = Some(task_id.clone());
        create.timeout_seconds = timeout_seconds;
        create.output_path = Some(materialized.manifest.output_result_path.clone());
        store.enqueue_task(&create).unwrap();

        let worker = OrchestratorWorker::new(
            store,
            ScriptedBackend::new(runs),
            defaults,
            WorkerConfig {
                worker_id: "worker-test".to_string(),
                poll_interval_seconds: 0.0,
                ..WorkerConfig::default()
            },
        );
        Harness {
            _temp: temp,
            worker,
            task_id,
        }
    }

    const VALID_OUTPUT: &str =
        r#"{"blocks": [{"text": "summary", "source_ids": ["article:a", "article:b"]}]}"#;

    #[tokio::test]
    async fn test_success_path_persists_citations_and_attempt() {
        let mut harness = harness(vec![Script::Exit {
            code: 0,
            stdout: "total_tokens: 150".to_string(),
            stderr: String::new(),
            result: Some(VALID_OUTPUT.to_string()),
        }]);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let store = harness.worker.store_mut();
        let details = store.get_task_details(&harness.task_id).unwrap().unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Succeeded);
        assert!(details
            .events
            .iter()
            .any(|event| event.event_type == "first_pass_validation_passed"));

        let citations = store.list_output_citations(&harness.task_id).unwrap();
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].source_id, "article:a");
        assert_eq!(citations[0].article_id.as_deref(), Some("a"));
        assert!(citations[0].published_at.is_some());

        assert_eq!(store.count_attempts(&harness.task_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repair_success_after_mapping_failure() {
        let invalid = r#"{"blocks": [{"text": "summary", "source_ids": []}]}"#;
        let mut harness = harness(vec![
            Script::Exit {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
                result: Some(invalid.to_string()),
            },
            Script::Exit {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
                result: Some(VALID_OUTPUT.to_string()),
            },
        ]);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let repair_modes = harness
            .worker
            .backend
            .repair_modes
            .lock()
            .unwrap()
            .clone();
        assert_eq!(repair_modes, vec![false, true]);

        let store = harness.worker.store_mut();
        let details = store.get_task_details(&harness.task_id).unwrap().unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Succeeded);
        assert!(details.task.repair_attempted_at.is_some());
        assert!(details
            .events
            .iter()
            .any(|event| event.event_type == "repair_attempted"));

        // Exactly one citation per distinct source id, in block order.
        let citations = store.list_output_citations(&harness.task_id).unwrap();
        let ids: Vec<&str> = citations
            .iter()
            .map(|citation| citation.source_id.as_str())
            .collect();
        assert_eq!(ids, vec!["article:a", "article:b"]);
    }

    #[tokio::test]
    async fn test_failed_repair_is_terminal_with_original_class() {
        let invalid = r#"{"blocks": [{"text": "summary", "source_ids": []}]}"#;
        let mut harness = harness(vec![
            Script::Exit {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
                result: Some(invalid.to_string()),
            },
            Script::Exit {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
                result: Some(invalid.to_string()),
            },
        ]);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let details = harness
            .worker
            .store_mut()
            .get_task_details(&harness.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Failed);
        assert_eq!(
            details.task.failure_class,
            Some(FailureClass::SourceMappingFailed)
        );
    }

    #[tokio::test]
    async fn test_timeout_grows_timeout_and_requeues() {
        let mut harness = harness_with_timeout(vec![Script::Timeout], 60);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.retried, 1);

        let details = harness
            .worker
            .store_mut()
            .get_task_details(&harness.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Queued);
        assert_eq!(details.task.timeout_seconds, 90);
        assert_eq!(details.task.attempt, 1);
    }

    #[tokio::test]
    async fn test_transient_classification_requeues() {
        let mut harness = harness(vec![Script::Exit {
            code: 1,
            stdout: String::new(),
            stderr: "Error: 429 too many requests".to_string(),
            result: None,
        }]);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.retried, 1);

        let details = harness
            .worker
            .store_mut()
            .get_task_details(&harness.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Queued);
        let retry_event = details
            .events
            .iter()
            .find(|event| event.event_type == "retry_scheduled")
            .unwrap();
        assert_eq!(retry_event.details["matched_rule"], "rate_limit_transient");
    }

    #[tokio::test]
    async fn test_non_retryable_exit_fails_terminally() {
        let mut harness = harness(vec![Script::Exit {
            code: 2,
            stdout: String::new(),
            stderr: "some fatal problem".to_string(),
            result: None,
        }]);

        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        let details = harness
            .worker
            .store_mut()
            .get_task_details(&harness.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Failed);
        assert_eq!(
            details.task.failure_class,
            Some(FailureClass::BackendNonRetryable)
        );
        assert_eq!(details.task.last_exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_non_transient_backend_error_fails() {
        let mut harness = harness(vec![Script::Error { transient: false }]);
        let summary = harness.worker.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        let details = harness
            .worker
            .store_mut()
            .get_task_details(&harness.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(
            details.task.failure_class,
            Some(FailureClass::BackendNonRetryable)
        );
    }

    #[tokio::test]
    async fn test_input_contract_error_is_terminal() {
        let temp = tempdir().unwrap();
        let mut store = Store::open_default(temp.path().join("worker.db")).unwrap();
        let mut create = LlmTaskCreate::new("highlights", "/nonexistent/manifest.json");
        create.task_id = Some("broken-task".to_string());
        store.enqueue_task(&create).unwrap();

        let mut worker = OrchestratorWorker::new(
            store,
            ScriptedBackend::new(Vec::new()),
            test_defaults().validated().unwrap(),
            WorkerConfig::default(),
        );
        let summary = worker.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let details = worker
            .store_mut()
            .get_task_details("broken-task")
            .unwrap()
            .unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Failed);
        assert_eq!(
            details.task.failure_class,
            Some(FailureClass::InputContractError)
        );
        assert_eq!(worker.store_mut().count_attempts("broken-task").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_stops_when_idle() {
        let mut harness = harness(vec![Script::Exit {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
            result: Some(VALID_OUTPUT.to_string()),
        }]);
        let summary = harness.worker.run_loop(Some(5)).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.idle_polls, 1);
    }

    #[test]
    fn test_retry_delay_cap_growth() {
        assert_eq!(retry_delay_cap(30, 900, 1), 30.0);
        assert_eq!(retry_delay_cap(30, 900, 2), 60.0);
        assert_eq!(retry_delay_cap(30, 900, 3), 120.0);
        assert_eq!(retry_delay_cap(30, 900, 6), 900.0);
        assert_eq!(retry_delay_cap(30, 900, 0), 30.0);
    }

    #[test]
    fn test_decide_repair_rules() {
        assert!(decide_repair(FailureClass::OutputInvalidJson, None));
        assert!(decide_repair(FailureClass::SourceMappingFailed, None));
        assert!(!decide_repair(FailureClass::Timeout, None));
        assert!(!decide_repair(
            FailureClass::OutputInvalidJson,
            Some(Utc::now())
        ));
    }

    #[test]
    fn test_sanitize_preview_strips_ansi() {
        let raw = "\x1b[31mred error\x1b[0m\nline";
        assert_eq!(sanitize_preview(raw), "red error\nline");
    }

    #[test]
    fn test_build_output_citations_orders_and_dedupes() {
        let entries = vec![
            ArticleIndexEntry {
                source_id: "article:a".to_string(),
                title: "A".to_string(),
                url: "https://example.com/a".to_string(),
                source: String::new(),
                published_at: None,
            },
            ArticleIndexEntry {
                source_id: "article:b".to_string(),
                title: "B".to_string(),
                url: "https://example.com/b".to_string(),
                source: String::new(),
                published_at: None,
            },
        ];
        let payload = serde_json::json!({
            "blocks": [
                {"text": "one", "source_ids": ["article:b", "article:a"]},
                {"text": "two", "source_ids": ["article:a"]},
            ]
        });
        let citations = build_output_citations(&entries, Some(&payload)).unwrap();
        let ids: Vec<&str> = citations
            .iter()
            .map(|citation| citation.source_id.as_str())
            .collect();
        assert_eq!(ids, vec!["article:b", "article:a"]);

        let bad_payload = serde_json::json!({
            "blocks": [{"text": "one", "source_ids": ["article:missing"]}]
        });
        assert!(build_output_citations(&entries, Some(&bad_payload)).is_err());
    }
}
