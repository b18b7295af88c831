//! Business output persistence
//!
//! Stable user-facing artifacts (highlights, story details, monitor
//! answers, Q&A answers) with ordered source-mapped blocks, plus the
//! engagement events recorded against them. Identity is resolved per
//! kind; block replacement is atomic with the output upsert.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::{now, parse_ts, ts, Store};

/// One output block with strict source mapping
#[derive(Debug, Clone)]
pub struct UserOutputBlockWrite {
    pub block_order: i64,
    pub text: String,
    pub source_ids: Vec<String>,
}

/// Upsert payload for a stable business output object
///
/// Identity is resolved per kind: `(kind, business_date)` for highlights,
/// plus `story_id` / `monitor_id` / `request_id` for the scoped kinds.
#[derive(Debug, Clone)]
pub struct UserOutputUpsert {
    pub kind: String,
    pub business_date: NaiveDate,
    pub status: String,
    pub payload: Value,
    pub blocks: Vec<UserOutputBlockWrite>,
    pub story_id: Option<String>,
    pub monitor_id: Option<String>,
    pub request_id: Option<String>,
    pub task_id: Option<String>,
    pub title: Option<String>,
}

/// Stored business output record
#[derive(Debug, Clone)]
pub struct UserOutputView {
    pub output_id: String,
    pub user_id: String,
    pub kind: String,
    pub business_date: NaiveDate,
    pub status: String,
    pub story_id: Option<String>,
    pub monitor_id: Option<String>,
    pub request_id: Option<String>,
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub blocks: Vec<UserOutputBlockWrite>,
}

/// Read/open interaction event against a stable output identity
#[derive(Debug, Clone)]
pub struct ReadStateEventWrite {
    pub output_id: String,
    pub event_type: String,
    pub output_block_id: Option<i64>,
    pub details: Value,
}

/// Feedback event attached to an output or one of its blocks
#[derive(Debug, Clone)]
pub struct OutputFeedbackWrite {
    pub output_id: String,
    pub feedback_type: String,
    pub output_block_id: Option<i64>,
    pub value: Option<String>,
    pub details: Value,
}

impl Store {
    /// Create or replace the output row identified by its kind's identity
    /// rule, replacing all blocks atomically.
    pub fn upsert_user_output(&mut self, payload: &UserOutputUpsert) -> Result<UserOutputView> {
        let user_id = self.user_id.clone();
        let tx = self.conn.transaction()?;
        let date_db = payload.business_date.format("%Y-%m-%d").to_string();
        let existing = resolve_existing_output(&tx, &user_id, payload, &date_db)?;
        let payload_json =
            serde_json::to_string(&payload.payload).map_err(|source| StoreError::Json {
                context: "user_outputs.payload_json",
                source,
            })?;
        let stamp = ts(now());

        let output_id = match existing {
            Some(output_id) => {
                tx.execute(
                    "UPDATE user_outputs SET
                         status = ?1, task_id = ?2, title = ?3, payload_json = ?4,
                         updated_at = ?5
                     WHERE output_id = ?6 AND user_id = ?7",
                    params![
                        payload.status,
                        payload.task_id,
                        payload.title,
                        payload_json,
                        stamp,
                        output_id,
                        user_id,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM user_output_blocks WHERE output_id = ?1",
                    params![output_id],
                )?;
                output_id
            }
            None => {
                let output_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO user_outputs
                     (output_id, user_id, kind, business_date, status, story_id, monitor_id,
                      request_id, task_id, title, payload_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                    params![
                        output_id,
                        user_id,
                        payload.kind,
                        date_db,
                        payload.status,
                        payload.story_id,
                        payload.monitor_id,
                        payload.request_id,
                        payload.task_id,
                        payload.title,
                        payload_json,
                        stamp,
                    ],
                )?;
                output_id
            }
        };

        for block in &payload.blocks {
            let source_ids_json =
                serde_json::to_string(&block.source_ids).map_err(|source| StoreError::Json {
                    context: "user_output_blocks.source_ids_json",
                    source,
                })?;
            tx.execute(
                "INSERT INTO user_output_blocks (output_id, block_order, text, source_ids_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![output_id, block.block_order, block.text, source_ids_json],
            )?;
        }
        tx.commit()?;

        self.get_user_output(&output_id)?
            .ok_or_else(|| StoreError::OutputNotFound(output_id))
    }

    pub fn get_user_output(&mut self, output_id: &str) -> Result<Option<UserOutputView>> {
        let row: Option<(
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
            String,
        )> = self
            .conn
            .query_row(
                "SELECT output_id, user_id, kind, business_date, status, story_id, monitor_id,
                        request_id, task_id, title, payload_json, created_at, updated_at
                 FROM user_outputs WHERE output_id = ?1 AND user_id = ?2",
                params![output_id, self.user_id],
                |row| {
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
                    ))
                },
            )
            .optional()?;
        let Some((
            output_id,
            user_id,
            kind,
            business_date,
            status,
            story_id,
            monitor_id,
            request_id,
            task_id,
            title,
            payload_json,
            created_at,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let payload = serde_json::from_str(&payload_json).map_err(|source| StoreError::Json {
            context: "user_outputs.payload_json",
            source,
        })?;
        let business_date = NaiveDate::parse_from_str(&business_date, "%Y-%m-%d")
            .map_err(|_| StoreError::InvalidTimestamp {
                column: "business_date",
                value: business_date.clone(),
            })?;

        let mut blocks = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT block_order, text, source_ids_json FROM user_output_blocks
                 WHERE output_id = ?1 ORDER BY block_order ASC",
            )?;
            let rows = stmt.query_map(params![output_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (block_order, text, source_ids_json) = row?;
                let source_ids =
                    serde_json::from_str(&source_ids_json).map_err(|source| StoreError::Json {
                        context: "user_output_blocks.source_ids_json",
                        source,
                    })?;
                blocks.push(UserOutputBlockWrite {
                    block_order,
                    text,
                    source_ids,
                });
            }
        }

        Ok(Some(UserOutputView {
            output_id,
            user_id,
            kind,
            business_date,
            status,
            story_id,
            monitor_id,
            request_id,
            task_id,
            title,
            payload,
            created_at: parse_ts("created_at", &created_at)?,
            updated_at: parse_ts("updated_at", &updated_at)?,
            blocks,
        }))
    }

    pub fn record_read_state_event(&mut self, event: &ReadStateEventWrite) -> Result<()> {
        let user_id = self.user_id.clone();
        let tx = self.conn.transaction()?;
        ensure_output_exists(&tx, &user_id, &event.output_id)?;
        if let Some(block_id) = event.output_block_id {
            ensure_block_matches_output(&tx, block_id, &event.output_id)?;
        }
        let details_json = details_json(&event.details)?;
        tx.execute(
            "INSERT INTO read_state_events
             (user_id, output_id, output_block_id, event_type, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                event.output_id,
                event.output_block_id,
                event.event_type,
                details_json,
                ts(now()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_output_feedback(&mut self, feedback: &OutputFeedbackWrite) -> Result<()> {
        let user_id = self.user_id.clone();
        let tx = self.conn.transaction()?;
        ensure_output_exists(&tx, &user_id, &feedback.output_id)?;
        if let Some(block_id) = feedback.output_block_id {
            ensure_block_matches_output(&tx, block_id, &feedback.output_id)?;
        }
        let details_json = details_json(&feedback.details)?;
        tx.execute(
            "INSERT INTO output_feedback
             (user_id, output_id, output_block_id, feedback_type, value, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                feedback.output_id,
                feedback.output_block_id,
                feedback.feedback_type,
                feedback.value,
                details_json,
                ts(now()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn resolve_existing_output(
    tx: &Transaction<'_>,
    user_id: &str,
    payload: &UserOutputUpsert,
    date_db: &str,
) -> Result<Option<String>> {
    let (extra_column, extra_value): (&str, Option<&str>) = match payload.kind.as_str() {
        "highlights" => ("", None),
        "story_details" => ("story_id", payload.story_id.as_deref()),
        "monitor_answer" => ("monitor_id", payload.monitor_id.as_deref()),
        "qa_answer" => ("request_id", payload.request_id.as_deref()),
        other => {
            return Err(StoreError::Invalid(format!(
                "unsupported output kind: {other}"
            )))
        }
    };
    if extra_column.is_empty() {
        let output_id = tx
            .query_row(
                "SELECT output_id FROM user_outputs
                 WHERE user_id = ?1 AND kind = ?2 AND business_date = ?3",
                params![user_id, payload.kind, date_db],
                |row| row.get(0),
            )
            .optional()?;
        return Ok(output_id);
    }
    let Some(extra_value) = extra_value else {
        return Err(StoreError::Invalid(format!(
            "output kind {} requires {extra_column}",
            payload.kind
        )));
    };
    let sql = format!(
        "SELECT output_id FROM user_outputs
         WHERE user_id = ?1 AND kind = ?2 AND business_date = ?3 AND {extra_column} = ?4"
    );
    let output_id = tx
        .query_row(
            &sql,
            params![user_id, payload.kind, date_db, extra_value],
            |row| row.get(0),
        )
        .optional()?;
    Ok(output_id)
}

fn ensure_output_exists(tx: &Transaction<'_>, user_id: &str, output_id: &str) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM user_outputs WHERE output_id = ?1 AND user_id = ?2",
            params![output_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::OutputNotFound(output_id.to_string()));
    }
    Ok(())
}

fn ensure_block_matches_output(
    tx: &Transaction<'_>,
    block_id: i64,
    output_id: &str,
) -> Result<()> {
    let owner: Option<String> = tx
        .query_row(
            "SELECT output_id FROM user_output_blocks WHERE block_id = ?1",
            params![block_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == output_id => Ok(()),
        _ => Err(StoreError::BlockMismatch {
            block_id,
            output_id: output_id.to_string(),
        }),
    }
}

fn details_json(details: &Value) -> Result<Option<String>> {
    if details.is_null() {
        return Ok(None);
    }
    if let Some(object) = details.as_object() {
        if object.is_empty() {
            return Ok(None);
        }
    }
    serde_json::to_string(details)
        .map(Some)
        .map_err(|source| StoreError::Json {
            context: "output event details",
            source,
        })
}
