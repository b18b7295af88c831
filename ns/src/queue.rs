//! Durable LLM task queue operations
//!
//! Claiming and every terminal transition are compare-and-swap conditional
//! updates pairing the row's expected status with the transition; a zero
//! row count means a lost race and is reported, never retried here. Each
//! transition appends a matching audit event in the same transaction.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::{now, parse_ts, parse_ts_opt, ts, Store};
use crate::tasks::{
    FailureClass, LlmTaskArtifactWrite, LlmTaskAttemptWrite, LlmTaskCreate, LlmTaskDetails,
    LlmTaskEventView, LlmTaskStatus, LlmTaskView, OutputCitationView, OutputCitationWrite,
};

const TASK_COLUMNS: &str = "task_id, user_id, task_type, priority, status, attempt, \
     max_attempts, timeout_seconds, run_after, started_at, heartbeat_at, finished_at, \
     failure_class, last_exit_code, repair_attempted_at, worker_id, input_manifest_path, \
     output_path, error_summary, created_at, updated_at";

impl Store {
    /// Create a queued task and its `enqueued` event.
    pub fn enqueue_task(&mut self, payload: &LlmTaskCreate) -> Result<LlmTaskView> {
        let task_id = payload
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created = now();
        let run_after = payload.run_after.unwrap_or(created);

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO llm_tasks
             (task_id, user_id, task_type, priority, status, attempt, max_attempts,
              timeout_seconds, run_after, input_manifest_path, output_path,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                task_id,
                self.user_id,
                payload.task_type,
                payload.priority,
                payload.max_attempts,
                payload.timeout_seconds,
                ts(run_after),
                payload.input_manifest_path,
                payload.output_path,
                ts(created),
            ],
        )?;
        add_event(
            &tx,
            &self.user_id,
            &task_id,
            "enqueued",
            None,
            Some(LlmTaskStatus::Queued),
            Some(serde_json::json!({
                "task_type": payload.task_type,
                "priority": payload.priority,
                "max_attempts": payload.max_attempts,
                "timeout_seconds": payload.timeout_seconds,
            })),
        )?;
        let view = fetch_task_view(&tx, &self.user_id, &task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
        tx.commit()?;
        Ok(view)
    }

    /// Atomically claim the next ready task for this worker, or None when
    /// the queue is idle.
    pub fn claim_next_ready_task(&mut self, worker_id: &str) -> Result<Option<LlmTaskView>> {
        loop {
            let claim_now = now();
            let tx = self.conn.transaction()?;
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT task_id FROM llm_tasks
                     WHERE user_id = ?1 AND status = 'queued' AND run_after <= ?2
                     ORDER BY priority ASC, run_after ASC, created_at ASC
                     LIMIT 1",
                    params![self.user_id, ts(claim_now)],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(task_id) = candidate else {
                return Ok(None);
            };

            let claimed = tx.execute(
                "UPDATE llm_tasks SET
                     status = 'running', attempt = attempt + 1,
                     started_at = ?1, heartbeat_at = ?1, finished_at = NULL,
                     failure_class = NULL, error_summary = NULL, last_exit_code = NULL,
                     worker_id = ?2, updated_at = ?1
                 WHERE task_id = ?3 AND user_id = ?4 AND status = 'queued'",
                params![ts(claim_now), worker_id, task_id, self.user_id],
            )?;
            if claimed != 1 {
                drop(tx);
                continue;
            }

            let view = fetch_task_view(&tx, &self.user_id, &task_id)?
                .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
            add_event(
                &tx,
                &self.user_id,
                &task_id,
                "claimed",
                Some(LlmTaskStatus::Queued),
                Some(LlmTaskStatus::Running),
                Some(serde_json::json!({
                    "worker_id": worker_id,
                    "attempt": view.attempt,
                })),
            )?;
            tx.commit()?;
            return Ok(Some(view));
        }
    }

    /// Heartbeat for a running task; no-op otherwise.
    pub fn touch_task(&mut self, task_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE llm_tasks SET heartbeat_at = ?1, updated_at = ?1
             WHERE task_id = ?2 AND user_id = ?3 AND status = 'running'",
            params![ts(now()), task_id, self.user_id],
        )?;
        Ok(())
    }

    /// Record the single in-attempt repair pass. False when the task is no
    /// longer running.
    pub fn mark_repair_attempted(&mut self, task_id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE llm_tasks SET repair_attempted_at = ?1, updated_at = ?1
             WHERE task_id = ?2 AND user_id = ?3 AND status = 'running'",
            params![ts(now()), task_id, self.user_id],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "repair_attempted",
            Some(LlmTaskStatus::Running),
            Some(LlmTaskStatus::Running),
            None,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Mark a running task succeeded and persist its citation snapshots in
    /// the same transaction; partial snapshot writes are impossible.
    pub fn complete_task(
        &mut self,
        task_id: &str,
        output_path: &str,
        citations: &[OutputCitationWrite],
    ) -> Result<bool> {
        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE llm_tasks SET
                 status = 'succeeded', finished_at = ?1, heartbeat_at = ?1,
                 output_path = ?2, updated_at = ?1
             WHERE task_id = ?3 AND user_id = ?4 AND status = 'running'",
            params![stamp, output_path, task_id, self.user_id],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        for citation in citations {
            tx.execute(
                "INSERT INTO output_citation_snapshots
                 (user_id, task_id, source_id, article_id, title, url, source,
                  published_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    self.user_id,
                    task_id,
                    citation.source_id,
                    citation.article_id,
                    citation.title,
                    citation.url,
                    citation.source,
                    citation.published_at.map(ts),
                    stamp,
                ],
            )?;
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "succeeded",
            Some(LlmTaskStatus::Running),
            Some(LlmTaskStatus::Succeeded),
            Some(serde_json::json!({ "output_path": output_path })),
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Mark a running task failed or timed out. False on a lost CAS.
    pub fn fail_task(
        &mut self,
        task_id: &str,
        status: LlmTaskStatus,
        failure_class: FailureClass,
        error_summary: &str,
        last_exit_code: Option<i64>,
        details: Option<Value>,
    ) -> Result<bool> {
        if !matches!(status, LlmTaskStatus::Failed | LlmTaskStatus::Timeout) {
            return Err(StoreError::Invalid(format!(
                "Unsupported failure status: {status}"
            )));
        }

        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE llm_tasks SET
                 status = ?1, failure_class = ?2, error_summary = ?3, last_exit_code = ?4,
                 finished_at = ?5, heartbeat_at = ?5, updated_at = ?5
             WHERE task_id = ?6 AND user_id = ?7 AND status = 'running'",
            params![
                status.as_str(),
                failure_class.as_str(),
                error_summary,
                last_exit_code,
                stamp,
                task_id,
                self.user_id,
            ],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        let mut event_details = serde_json::json!({
            "failure_class": failure_class.as_str(),
            "last_exit_code": last_exit_code,
            "error_summary": error_summary,
        });
        if let (Some(object), Some(Value::Object(extra))) =
            (event_details.as_object_mut(), details)
        {
            for (key, value) in extra {
                object.insert(key, value);
            }
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "failed",
            Some(LlmTaskStatus::Running),
            Some(status),
            Some(event_details),
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Requeue a running task for automatic retry, preserving its attempt
    /// counter. False on a lost CAS.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_retry(
        &mut self,
        task_id: &str,
        run_after: DateTime<Utc>,
        timeout_seconds: i64,
        failure_class: FailureClass,
        error_summary: &str,
        last_exit_code: Option<i64>,
        details: Option<Value>,
    ) -> Result<bool> {
        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE llm_tasks SET
                 status = 'queued', run_after = ?1, timeout_seconds = ?2,
                 failure_class = ?3, error_summary = ?4, last_exit_code = ?5,
                 started_at = NULL, finished_at = NULL, heartbeat_at = NULL,
                 worker_id = NULL, repair_attempted_at = NULL, updated_at = ?6
             WHERE task_id = ?7 AND user_id = ?8 AND status = 'running'",
            params![
                ts(run_after),
                timeout_seconds,
                failure_class.as_str(),
                error_summary,
                last_exit_code,
                stamp,
                task_id,
                self.user_id,
            ],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        let mut event_details = serde_json::json!({
            "run_after": ts(run_after),
            "timeout_seconds": timeout_seconds,
            "failure_class": failure_class.as_str(),
        });
        if let (Some(object), Some(Value::Object(extra))) =
            (event_details.as_object_mut(), details)
        {
            for (key, value) in extra {
                object.insert(key, value);
            }
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "retry_scheduled",
            Some(LlmTaskStatus::Running),
            Some(LlmTaskStatus::Queued),
            Some(event_details),
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Manual operator retry for failed/timeout/canceled tasks.
    pub fn retry_task(&mut self, task_id: &str) -> Result<()> {
        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let view = fetch_task_view(&tx, &self.user_id, task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if !matches!(
            view.status,
            LlmTaskStatus::Failed | LlmTaskStatus::Timeout | LlmTaskStatus::Canceled
        ) {
            return Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                status: view.status.to_string(),
                reason: "only failed/timeout/canceled tasks can be retried manually".to_string(),
            });
        }
        let changed = tx.execute(
            "UPDATE llm_tasks SET
                 status = 'queued', run_after = ?1, finished_at = NULL, started_at = NULL,
                 heartbeat_at = NULL, failure_class = NULL, error_summary = NULL,
                 last_exit_code = NULL, repair_attempted_at = NULL, worker_id = NULL,
                 updated_at = ?1
             WHERE task_id = ?2 AND user_id = ?3 AND status = ?4",
            params![stamp, task_id, self.user_id, view.status.as_str()],
        )?;
        if changed != 1 {
            return Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                status: view.status.to_string(),
                reason: "task state changed concurrently while retrying; please retry command"
                    .to_string(),
            });
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "manual_retry",
            Some(view.status),
            Some(LlmTaskStatus::Queued),
            None,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Cancel a queued or running task.
    pub fn cancel_task(&mut self, task_id: &str) -> Result<()> {
        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let view = fetch_task_view(&tx, &self.user_id, task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if !matches!(view.status, LlmTaskStatus::Queued | LlmTaskStatus::Running) {
            return Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                status: view.status.to_string(),
                reason: "task cannot be canceled from this status".to_string(),
            });
        }
        let changed = tx.execute(
            "UPDATE llm_tasks SET
                 status = 'canceled', finished_at = ?1, heartbeat_at = ?1, updated_at = ?1
             WHERE task_id = ?2 AND user_id = ?3 AND status = ?4",
            params![stamp, task_id, self.user_id, view.status.as_str()],
        )?;
        if changed != 1 {
            return Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                status: view.status.to_string(),
                reason: "task state changed concurrently while canceling; please retry command"
                    .to_string(),
            });
        }
        add_event(
            &tx,
            &self.user_id,
            task_id,
            "canceled",
            Some(view.status),
            Some(LlmTaskStatus::Canceled),
            None,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Requeue running tasks whose heartbeat is older than `stale_after`.
    pub fn recover_stale_running_tasks(&mut self, stale_after: Duration) -> Result<i64> {
        let cutoff = ts(now() - stale_after);
        let stamp = ts(now());
        let tx = self.conn.transaction()?;
        let stale_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM llm_tasks
                 WHERE user_id = ?1 AND status = 'running'
                   AND COALESCE(heartbeat_at, started_at, created_at) < ?2",
            )?;
            let rows = stmt.query_map(params![self.user_id, cutoff], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut recovered = 0;
        for task_id in &stale_ids {
            let changed = tx.execute(
                "UPDATE llm_tasks SET
                     status = 'queued', run_after = ?1, started_at = NULL,
                     heartbeat_at = NULL, worker_id = NULL, repair_attempted_at = NULL,
                     updated_at = ?1
                 WHERE task_id = ?2 AND user_id = ?3 AND status = 'running'",
                params![stamp, task_id, self.user_id],
            )?;
            if changed != 1 {
                continue;
            }
            add_event(
                &tx,
                &self.user_id,
                task_id,
                "stale_recovered",
                Some(LlmTaskStatus::Running),
                Some(LlmTaskStatus::Queued),
                None,
            )?;
            warn!(task_id = %task_id, "Requeued stale running task");
            recovered += 1;
        }
        tx.commit()?;
        Ok(recovered)
    }

    pub fn list_tasks(
        &mut self,
        status: Option<LlmTaskStatus>,
        limit: i64,
    ) -> Result<Vec<LlmTaskView>> {
        let status_filter = status.map(|value| value.as_str());
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM llm_tasks
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self.user_id, status_filter, limit], row_to_raw)?;
        let mut views = Vec::new();
        for row in rows {
            views.push(raw_to_view(row?)?);
        }
        Ok(views)
    }

    /// Task view plus its ordered event stream.
    pub fn get_task_details(&mut self, task_id: &str) -> Result<Option<LlmTaskDetails>> {
        let tx = self.conn.transaction()?;
        let Some(task) = fetch_task_view(&tx, &self.user_id, task_id)? else {
            return Ok(None);
        };

        let mut events = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, task_id, event_type, status_from, status_to, details_json, created_at
                 FROM llm_task_events
                 WHERE task_id = ?1 AND user_id = ?2
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![task_id, self.user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;
            for row in rows {
                let (event_id, task_id, event_type, status_from, status_to, details_json, created) =
                    row?;
                let details = match details_json {
                    Some(raw) => {
                        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                            context: "llm_task_events.details_json",
                            source,
                        })?
                    }
                    None => Value::Object(serde_json::Map::new()),
                };
                events.push(LlmTaskEventView {
                    event_id,
                    task_id,
                    event_type,
                    status_from: status_from.as_deref().and_then(LlmTaskStatus::parse),
                    status_to: status_to.as_deref().and_then(LlmTaskStatus::parse),
                    created_at: parse_ts("created_at", &created)?,
                    details,
                });
            }
        }
        tx.commit()?;
        Ok(Some(LlmTaskDetails { task, events }))
    }

    /// Append a worker-emitted event outside of a state transition.
    pub fn add_task_event(
        &mut self,
        task_id: &str,
        event_type: &str,
        status_from: Option<LlmTaskStatus>,
        status_to: Option<LlmTaskStatus>,
        details: Option<Value>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        add_event(
            &tx,
            &self.user_id,
            task_id,
            event_type,
            status_from,
            status_to,
            details,
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_artifact(&mut self, task_id: &str, artifact: &LlmTaskArtifactWrite) -> Result<()> {
        self.conn.execute(
            "INSERT INTO llm_task_artifacts
             (task_id, user_id, kind, path, size_bytes, checksum_sha256, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task_id,
                self.user_id,
                artifact.kind,
                artifact.path,
                artifact.size_bytes,
                artifact.checksum_sha256,
                ts(now()),
            ],
        )?;
        Ok(())
    }

    /// Finalize one attempt telemetry row.
    pub fn record_attempt(&mut self, task_id: &str, attempt: &LlmTaskAttemptWrite) -> Result<()> {
        let started_at = attempt.started_at.unwrap_or_else(now);
        self.conn.execute(
            "INSERT INTO llm_task_attempts
             (task_id, user_id, attempt_no, task_type, status, started_at, finished_at,
              duration_ms, worker_id, agent, model, profile, exit_code, timed_out,
              failure_class, attempt_failure_code, error_summary_sanitized,
              stdout_preview_sanitized, stderr_preview_sanitized, output_chars,
              prompt_tokens, completion_tokens, total_tokens, usage_status, usage_source,
              usage_parser_version, estimated_cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                task_id,
                self.user_id,
                attempt.attempt_no,
                attempt.task_type,
                attempt.status,
                ts(started_at),
                attempt.finished_at.map(ts),
                attempt.duration_ms,
                attempt.worker_id,
                attempt.agent,
                attempt.model,
                attempt.profile,
                attempt.exit_code,
                attempt.timed_out,
                attempt.failure_class.map(|class| class.as_str()),
                attempt.attempt_failure_code,
                attempt.error_summary_sanitized,
                attempt.stdout_preview_sanitized,
                attempt.stderr_preview_sanitized,
                attempt.output_chars,
                attempt.prompt_tokens,
                attempt.completion_tokens,
                attempt.total_tokens,
                attempt.usage_status,
                attempt.usage_source,
                attempt.usage_parser_version,
                attempt.estimated_cost_usd,
                ts(now()),
            ],
        )?;
        Ok(())
    }

    pub fn count_attempts(&mut self, task_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM llm_task_attempts WHERE task_id = ?1 AND user_id = ?2",
            params![task_id, self.user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Citation snapshots for one task, in insertion (block) order.
    pub fn list_output_citations(&mut self, task_id: &str) -> Result<Vec<OutputCitationView>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, source_id, article_id, title, url, source, published_at, created_at
             FROM output_citation_snapshots
             WHERE user_id = ?1 AND task_id = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![self.user_id, task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut citations = Vec::new();
        for row in rows {
            let (task_id, source_id, article_id, title, url, source, published_at, created_at) =
                row?;
            citations.push(OutputCitationView {
                task_id,
                source_id,
                article_id,
                title,
                url,
                source,
                published_at: parse_ts_opt("published_at", published_at)?,
                created_at: parse_ts("created_at", &created_at)?,
            });
        }
        Ok(citations)
    }

    /// Task counts by status for the stats command.
    pub fn task_status_counts(&mut self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM llm_tasks
             WHERE user_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map(params![self.user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Attempt failure-class counts since a cutoff, for the stats command.
    pub fn attempt_failure_counts(&mut self, since: DateTime<Utc>) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(failure_class, 'none'), COUNT(*) FROM llm_task_attempts
             WHERE user_id = ?1 AND created_at >= ?2
             GROUP BY failure_class ORDER BY 1",
        )?;
        let rows = stmt.query_map(params![self.user_id, ts(since)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

fn add_event(
    tx: &Transaction<'_>,
    user_id: &str,
    task_id: &str,
    event_type: &str,
    status_from: Option<LlmTaskStatus>,
    status_to: Option<LlmTaskStatus>,
    details: Option<Value>,
) -> Result<()> {
    let details_json = match details {
        Some(value) => Some(serde_json::to_string(&value).map_err(|source| StoreError::Json {
            context: "llm_task_events.details_json",
            source,
        })?),
        None => None,
    };
    tx.execute(
        "INSERT INTO llm_task_events
         (task_id, user_id, event_type, status_from, status_to, details_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task_id,
            user_id,
            event_type,
            status_from.map(|status| status.as_str()),
            status_to.map(|status| status.as_str()),
            details_json,
            ts(now()),
        ],
    )?;
    Ok(())
}

type RawTaskRow = (
    String,
    String,
    String,
    i64,
    String,
    i64,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
        row.get(20)?,
    ))
}

fn raw_to_view(raw: RawTaskRow) -> Result<LlmTaskView> {
    let (
        task_id,
        user_id,
        task_type,
        priority,
        status,
        attempt,
        max_attempts,
        timeout_seconds,
        run_after,
        started_at,
        heartbeat_at,
        finished_at,
        failure_class,
        last_exit_code,
        repair_attempted_at,
        worker_id,
        input_manifest_path,
        output_path,
        error_summary,
        created_at,
        updated_at,
    ) = raw;
    let status = LlmTaskStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("unknown task status: {status}")))?;
    Ok(LlmTaskView {
        task_id,
        user_id,
        task_type,
        priority,
        status,
        attempt,
        max_attempts,
        timeout_seconds,
        run_after: parse_ts("run_after", &run_after)?,
        started_at: parse_ts_opt("started_at", started_at)?,
        heartbeat_at: parse_ts_opt("heartbeat_at", heartbeat_at)?,
        finished_at: parse_ts_opt("finished_at", finished_at)?,
        failure_class: failure_class.as_deref().and_then(FailureClass::parse),
        last_exit_code,
        repair_attempted_at: parse_ts_opt("repair_attempted_at", repair_attempted_at)?,
        worker_id,
        input_manifest_path,
        output_path,
        error_summary,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

fn fetch_task_view(
    tx: &Transaction<'_>,
    user_id: &str,
    task_id: &str,
) -> Result<Option<LlmTaskView>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM llm_tasks WHERE task_id = ?1 AND user_id = ?2"
    );
    let raw = tx
        .query_row(&sql, params![task_id, user_id], row_to_raw)
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(raw_to_view(raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().unwrap();
        let store = Store::open_default(temp.path().join("queue.db")).unwrap();
        (temp, store)
    }

    fn enqueue(store: &mut Store, task_type: &str, priority: i64) -> LlmTaskView {
        let mut payload = LlmTaskCreate::new(task_type, "/tmp/manifest.json");
        payload.priority = priority;
        store.enqueue_task(&payload).unwrap()
    }

    #[test]
    fn test_enqueue_and_claim_order() {
        let (_temp, mut store) = test_store();
        enqueue(&mut store, "highlights", 200);
        let urgent = enqueue(&mut store, "highlights", 50);

        let claimed = store.claim_next_ready_task("worker-1").unwrap().unwrap();
        assert_eq!(claimed.task_id, urgent.task_id);
        assert_eq!(claimed.status, LlmTaskStatus::Running);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_claim_respects_run_after() {
        let (_temp, mut store) = test_store();
        let mut payload = LlmTaskCreate::new("highlights", "/tmp/manifest.json");
        payload.run_after = Some(now() + Duration::hours(1));
        store.enqueue_task(&payload).unwrap();

        assert!(store.claim_next_ready_task("worker-1").unwrap().is_none());
    }

    #[test]
    fn test_complete_task_persists_citations_atomically() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();

        let citations = vec![
            OutputCitationWrite {
                source_id: "article:a".to_string(),
                article_id: Some("a".to_string()),
                title: "A".to_string(),
                url: "https://example.com/a".to_string(),
                source: "example.com".to_string(),
                published_at: None,
            },
            OutputCitationWrite {
                source_id: "article:b".to_string(),
                article_id: Some("b".to_string()),
                title: "B".to_string(),
                url: "https://example.com/b".to_string(),
                source: "example.com".to_string(),
                published_at: None,
            },
        ];
        assert!(store
            .complete_task(&task.task_id, "/tmp/out.json", &citations)
            .unwrap());

        let stored = store.list_output_citations(&task.task_id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].source_id, "article:a");
        assert_eq!(stored[1].source_id, "article:b");

        // Terminal states are absorbing.
        assert!(!store
            .complete_task(&task.task_id, "/tmp/out.json", &[])
            .unwrap());
        assert!(!store
            .fail_task(
                &task.task_id,
                LlmTaskStatus::Failed,
                FailureClass::BackendNonRetryable,
                "late failure",
                None,
                None,
            )
            .unwrap());
    }

    #[test]
    fn test_schedule_retry_preserves_attempt_and_clears_claim() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();

        assert!(store
            .schedule_retry(
                &task.task_id,
                now() - Duration::seconds(1),
                900,
                FailureClass::Timeout,
                "Task timed out.",
                Some(124),
                None,
            )
            .unwrap());

        let reclaimed = store.claim_next_ready_task("worker-2").unwrap().unwrap();
        assert_eq!(reclaimed.task_id, task.task_id);
        assert_eq!(reclaimed.attempt, 2);
        assert_eq!(reclaimed.timeout_seconds, 900);

        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        let kinds: Vec<&str> = details
            .events
            .iter()
            .map(|event| event.event_type.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec!["enqueued", "claimed", "retry_scheduled", "claimed"]
        );
    }

    #[test]
    fn test_retry_attempt_matches_claim_count() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();
        store
            .schedule_retry(
                &task.task_id,
                now(),
                600,
                FailureClass::BackendTransient,
                "transient",
                Some(1),
                None,
            )
            .unwrap();

        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        let claims = details
            .events
            .iter()
            .filter(|event| event.event_type == "claimed")
            .count();
        let retry_event = details
            .events
            .iter()
            .find(|event| event.event_type == "retry_scheduled")
            .unwrap();
        // At retry time the attempt counter equals the number of prior claims.
        assert_eq!(claims as i64, details.task.attempt);
        assert_eq!(retry_event.details["failure_class"], "backend_transient");
    }

    #[test]
    fn test_cancel_then_complete_cas_fails() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();
        store.cancel_task(&task.task_id).unwrap();

        assert!(!store
            .complete_task(&task.task_id, "/tmp/out.json", &[])
            .unwrap());
        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Canceled);
        assert!(details.task.finished_at.is_some());
    }

    #[test]
    fn test_manual_retry_requires_terminal_state() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        let error = store.retry_task(&task.task_id).unwrap_err();
        assert!(matches!(error, StoreError::InvalidTransition { .. }));

        store.claim_next_ready_task("worker-1").unwrap().unwrap();
        store
            .fail_task(
                &task.task_id,
                LlmTaskStatus::Failed,
                FailureClass::BackendNonRetryable,
                "boom",
                Some(1),
                None,
            )
            .unwrap();
        store.retry_task(&task.task_id).unwrap();
        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        assert_eq!(details.task.status, LlmTaskStatus::Queued);
        assert_eq!(details.task.attempt, 1);
    }

    #[test]
    fn test_recover_stale_running_tasks() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();

        // Age the heartbeat.
        store
            .conn
            .execute(
                "UPDATE llm_tasks SET heartbeat_at = ?1 WHERE task_id = ?2",
                params![ts(now() - Duration::hours(1)), task.task_id],
            )
            .unwrap();

        let recovered = store
            .recover_stale_running_tasks(Duration::minutes(30))
            .unwrap();
        assert_eq!(recovered, 1);

        let reclaimed = store.claim_next_ready_task("worker-2").unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        assert!(details
            .events
            .iter()
            .any(|event| event.event_type == "stale_recovered"));
    }

    #[test]
    fn test_mark_repair_attempted_only_running() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        assert!(!store.mark_repair_attempted(&task.task_id).unwrap());

        store.claim_next_ready_task("worker-1").unwrap().unwrap();
        assert!(store.mark_repair_attempted(&task.task_id).unwrap());
        let details = store.get_task_details(&task.task_id).unwrap().unwrap();
        assert!(details.task.repair_attempted_at.is_some());
    }

    #[test]
    fn test_record_attempt_and_counts() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();

        let attempt = LlmTaskAttemptWrite {
            attempt_no: 1,
            task_type: "highlights".to_string(),
            status: "failed".to_string(),
            started_at: Some(now()),
            finished_at: Some(now()),
            duration_ms: Some(1200),
            worker_id: Some("worker-1".to_string()),
            agent: Some("codex".to_string()),
            model: Some("gpt-5-codex".to_string()),
            profile: Some("fast".to_string()),
            exit_code: Some(1),
            timed_out: false,
            failure_class: Some(FailureClass::BackendTransient),
            attempt_failure_code: Some("codex_rate_limit_transient".to_string()),
            ..Default::default()
        };
        store.record_attempt(&task.task_id, &attempt).unwrap();
        assert_eq!(store.count_attempts(&task.task_id).unwrap(), 1);

        let failures = store
            .attempt_failure_counts(now() - Duration::hours(1))
            .unwrap();
        assert_eq!(failures, vec![("backend_transient".to_string(), 1)]);
    }

    #[test]
    fn test_fail_task_rejects_non_failure_status() {
        let (_temp, mut store) = test_store();
        let task = enqueue(&mut store, "highlights", 100);
        store.claim_next_ready_task("worker-1").unwrap().unwrap();
        let error = store
            .fail_task(
                &task.task_id,
                LlmTaskStatus::Succeeded,
                FailureClass::Timeout,
                "bad",
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(error, StoreError::Invalid(_)));
    }
}
