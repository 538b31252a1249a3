//! SQLite durable store for channels, email sources, ingested history and
//! calendar items.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod channels;
mod items;
mod messages;
mod migrations;
mod schema;
mod users;

pub use channels::{ChannelRecord, EmailSourceRecord};
pub use items::{ActionType, CalendarItem, ItemDraft, ItemKind, ItemSource, ItemStatus};

use schema::ASSISTANT_SCHEMA;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{0} not found")]
    NotFound(String),
}

/// Backfill progress of one channel or email source attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStatus {
    Skipped,
    InProgress,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Skipped => "skipped",
            BackfillStatus::InProgress => "in_progress",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackfillStatus::InProgress)
    }
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "skipped" => Ok(BackfillStatus::Skipped),
            "in_progress" => Ok(BackfillStatus::InProgress),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(StoreError::InvalidValue {
                field: "backfill_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Handle to the assistant database. Each call opens its own connection so
/// the store can be shared freely between worker threads.
#[derive(Debug, Clone)]
pub struct AssistantStore {
    path: PathBuf,
}

impl AssistantStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        if let Some(parent) = store.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = store.open()?;
        conn.execute_batch(ASSISTANT_SCHEMA)?;
        migrations::ensure_chat_message_columns(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match value {
        Some(raw) => Ok(Some(parse_datetime(&raw)?)),
        None => Ok(None),
    }
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
