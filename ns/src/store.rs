//! Store handle and connection management
//!
//! Each component opens its own [`Store`] over the shared database file.
//! WAL mode, a busy timeout, and enforced foreign keys standardize the
//! SQLite policy across all connections; every public store method runs
//! as one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::schema;

pub const DEFAULT_USER_ID: &str = "default_user";

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Actor scope applied to every store call
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub user_name: String,
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            user_name: "Default User".to_string(),
        }
    }
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Connection-owning handle to the shared relational store
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) user_id: String,
    pub(crate) user_name: String,
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the database and ensure schema plus actor row exist.
    pub fn open(db_path: impl AsRef<Path>, user: UserContext) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;

        // PRAGMA journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;

        schema::init_schema(&conn)?;

        let store = Self {
            conn,
            user_id: user.user_id,
            user_name: user.user_name,
            db_path,
        };
        store.ensure_actor_context()?;
        Ok(store)
    }

    /// Open with the default single-tenant user.
    pub fn open_default(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open(db_path, UserContext::default())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn ensure_actor_context(&self) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (user_id, display_name, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![self.user_id, self.user_name, ts(now())],
        )?;
        Ok(())
    }
}

/// Current instant in UTC.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Fixed-width RFC 3339 UTC text; lexicographic order equals time order.
pub(crate) fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

pub(crate) fn parse_ts_opt(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_ts(column, &raw).map(Some),
        None => Ok(None),
    }
}

/// Embedding vectors are stored as packed little-endian f32 arrays.
pub(crate) fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub(crate) fn unpack_vector(blob: &[u8], dim: usize) -> Vec<f32> {
    blob.chunks_exact(4)
        .take(dim)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
