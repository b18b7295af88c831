//! Recap pipeline run state
//!
//! Backs the coordinator's stale-run guard and per-step audit trail.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::store::{now, parse_ts, ts, Store};

/// Step/task status recorded for pipeline audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStepStatus {
    Running,
    Completed,
    Failed,
}

impl PipelineStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Stored pipeline run row.
#[derive(Debug, Clone)]
pub struct PipelineRunView {
    pub pipeline_id: String,
    pub business_date: String,
    pub status: String,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub fn insert_pipeline_run(
        &mut self,
        pipeline_id: &str,
        business_date: NaiveDate,
    ) -> Result<()> {
        let stamp = ts(now());
        self.conn.execute(
            "INSERT INTO recap_pipeline_runs
             (pipeline_id, user_id, business_date, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?4)",
            params![
                pipeline_id,
                self.user_id,
                business_date.format("%Y-%m-%d").to_string(),
                stamp,
            ],
        )?;
        Ok(())
    }

    pub fn set_pipeline_step(&mut self, pipeline_id: &str, step_name: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE recap_pipeline_runs SET current_step = ?1, updated_at = ?2
             WHERE pipeline_id = ?3 AND user_id = ?4",
            params![step_name, ts(now()), pipeline_id, self.user_id],
        )?;
        Ok(())
    }

    pub fn finish_pipeline_run(
        &mut self,
        pipeline_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE recap_pipeline_runs SET status = ?1, error = ?2, updated_at = ?3
             WHERE pipeline_id = ?4 AND user_id = ?5",
            params![status, error, ts(now()), pipeline_id, self.user_id],
        )?;
        Ok(())
    }

    pub fn insert_pipeline_task(
        &mut self,
        pipeline_id: &str,
        step_name: &str,
        task_id: Option<&str>,
        status: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO recap_pipeline_tasks
             (pipeline_id, step_name, task_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![pipeline_id, step_name, task_id, status, ts(now())],
        )?;
        Ok(())
    }

    /// Newest live pipeline run, auto-failing it first when its heartbeat
    /// is older than `stale_after`. Returns the still-live run if any.
    pub fn active_pipeline_run(
        &mut self,
        stale_after: Duration,
    ) -> Result<Option<PipelineRunView>> {
        let row: Option<(String, String, String, Option<String>, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT pipeline_id, business_date, status, current_step, error, updated_at
                 FROM recap_pipeline_runs
                 WHERE user_id = ?1 AND status = 'running'
                 ORDER BY created_at DESC LIMIT 1",
                params![self.user_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((pipeline_id, business_date, status, current_step, error, updated_at)) = row
        else {
            return Ok(None);
        };
        let updated = parse_ts("updated_at", &updated_at)?;
        if now() - updated > stale_after {
            self.conn.execute(
                "UPDATE recap_pipeline_runs
                 SET status = 'failed', error = 'Stale run auto-recovered', updated_at = ?1
                 WHERE pipeline_id = ?2 AND user_id = ?3",
                params![ts(now()), pipeline_id, self.user_id],
            )?;
            tracing::warn!(pipeline_id = %pipeline_id, "Recovered stale pipeline run");
            return Ok(None);
        }
        Ok(Some(PipelineRunView {
            pipeline_id,
            business_date,
            status,
            current_step,
            error,
            updated_at: updated,
        }))
    }
}
