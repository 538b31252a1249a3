use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    bool_to_int, format_datetime, parse_datetime, parse_optional_datetime, AssistantStore,
    BackfillStatus, StoreError,
};

const CHANNELS_TABLE: &str = "channels";
const EMAIL_SOURCES_TABLE: &str = "email_sources";

/// A chat channel attached by a user.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub external_channel_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub backfill_status: Option<BackfillStatus>,
    pub backfill_started_at: Option<DateTime<Utc>>,
    pub backfill_finished_at: Option<DateTime<Utc>>,
    pub backfill_error: Option<String>,
    pub backfill_processed: u32,
    pub created_at: DateTime<Utc>,
}

/// A mailbox address watched for a user.
#[derive(Debug, Clone)]
pub struct EmailSourceRecord {
    pub id: String,
    pub user_id: String,
    pub address: String,
    pub enabled: bool,
    pub backfill_status: Option<BackfillStatus>,
    pub backfill_started_at: Option<DateTime<Utc>>,
    pub backfill_finished_at: Option<DateTime<Utc>>,
    pub backfill_error: Option<String>,
    pub backfill_processed: u32,
    pub created_at: DateTime<Utc>,
}

const CHANNEL_COLUMNS: &str = "id, user_id, platform, external_channel_id, name, enabled,
    backfill_status, backfill_started_at, backfill_finished_at, backfill_error,
    backfill_processed, created_at";

const EMAIL_SOURCE_COLUMNS: &str = "id, user_id, address, enabled,
    backfill_status, backfill_started_at, backfill_finished_at, backfill_error,
    backfill_processed, created_at";

type ChannelRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    String,
);

type EmailSourceRow = (
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    String,
);

fn read_channel_row(row: &Row<'_>) -> rusqlite::Result<ChannelRow> {
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
    ))
}

fn read_email_source_row(row: &Row<'_>) -> rusqlite::Result<EmailSourceRow> {
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
    ))
}

fn parse_status(value: Option<String>) -> Result<Option<BackfillStatus>, StoreError> {
    value.map(|raw| raw.parse()).transpose()
}

fn channel_from_row(row: ChannelRow) -> Result<ChannelRecord, StoreError> {
    let (
        id,
        user_id,
        platform,
        external_channel_id,
        name,
        enabled,
        backfill_status,
        backfill_started_at,
        backfill_finished_at,
        backfill_error,
        backfill_processed,
        created_at,
    ) = row;
    Ok(ChannelRecord {
        id,
        user_id,
        platform,
        external_channel_id,
        name,
        enabled: enabled != 0,
        backfill_status: parse_status(backfill_status)?,
        backfill_started_at: parse_optional_datetime(backfill_started_at)?,
        backfill_finished_at: parse_optional_datetime(backfill_finished_at)?,
        backfill_error,
        backfill_processed: backfill_processed.max(0) as u32,
        created_at: parse_datetime(&created_at)?,
    })
}

fn email_source_from_row(row: EmailSourceRow) -> Result<EmailSourceRecord, StoreError> {
    let (
        id,
        user_id,
        address,
        enabled,
        backfill_status,
        backfill_started_at,
        backfill_finished_at,
        backfill_error,
        backfill_processed,
        created_at,
    ) = row;
    Ok(EmailSourceRecord {
        id,
        user_id,
        address,
        enabled: enabled != 0,
        backfill_status: parse_status(backfill_status)?,
        backfill_started_at: parse_optional_datetime(backfill_started_at)?,
        backfill_finished_at: parse_optional_datetime(backfill_finished_at)?,
        backfill_error,
        backfill_processed: backfill_processed.max(0) as u32,
        created_at: parse_datetime(&created_at)?,
    })
}

impl AssistantStore {
    /// Attach a channel, or re-enable the existing row for the same identifier.
    ///
    /// Re-attaching keeps the row id, so history ingested under the earlier
    /// attachment stays linked to it.
    pub fn attach_channel(
        &self,
        user_id: &str,
        platform: &str,
        external_channel_id: &str,
        name: Option<&str>,
    ) -> Result<ChannelRecord, StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO channels (id, user_id, platform, external_channel_id, name, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(user_id, platform, external_channel_id) DO UPDATE SET
                enabled = 1,
                name = COALESCE(excluded.name, channels.name)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                platform,
                external_channel_id,
                name,
                format_datetime(Utc::now())
            ],
        )?;
        self.find_channel_with(&conn, user_id, platform, external_channel_id)?
            .ok_or_else(|| StoreError::NotFound(format!("channel {}", external_channel_id)))
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<ChannelRecord, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
                params![channel_id],
                read_channel_row,
            )
            .optional()?;
        match row {
            Some(row) => channel_from_row(row),
            None => Err(StoreError::NotFound(format!("channel {}", channel_id))),
        }
    }

    pub fn find_channel(
        &self,
        user_id: &str,
        platform: &str,
        external_channel_id: &str,
    ) -> Result<Option<ChannelRecord>, StoreError> {
        let conn = self.open()?;
        self.find_channel_with(&conn, user_id, platform, external_channel_id)
    }

    fn find_channel_with(
        &self,
        conn: &Connection,
        user_id: &str,
        platform: &str,
        external_channel_id: &str,
    ) -> Result<Option<ChannelRecord>, StoreError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM channels
                     WHERE user_id = ?1 AND platform = ?2 AND external_channel_id = ?3",
                    CHANNEL_COLUMNS
                ),
                params![user_id, platform, external_channel_id],
                read_channel_row,
            )
            .optional()?;
        row.map(channel_from_row).transpose()
    }

    pub fn list_channels(&self, user_id: &str) -> Result<Vec<ChannelRecord>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE user_id = ?1 ORDER BY created_at",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], read_channel_row)?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(channel_from_row(row?)?);
        }
        Ok(channels)
    }

    /// Disabling only flips the flag; ingested messages are kept.
    pub fn set_channel_enabled(&self, channel_id: &str, enabled: bool) -> Result<(), StoreError> {
        self.set_enabled(CHANNELS_TABLE, channel_id, enabled)
    }

    pub fn set_channel_backfill_status(
        &self,
        channel_id: &str,
        status: BackfillStatus,
        processed: u32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.set_backfill_status(CHANNELS_TABLE, channel_id, status, processed, error)
    }

    pub fn attach_email_source(
        &self,
        user_id: &str,
        address: &str,
    ) -> Result<EmailSourceRecord, StoreError> {
        let address = address.trim().to_ascii_lowercase();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO email_sources (id, user_id, address, enabled, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(user_id, address) DO UPDATE SET enabled = 1",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                address,
                format_datetime(Utc::now())
            ],
        )?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM email_sources WHERE user_id = ?1 AND address = ?2",
                    EMAIL_SOURCE_COLUMNS
                ),
                params![user_id, address],
                read_email_source_row,
            )
            .optional()?;
        match row {
            Some(row) => email_source_from_row(row),
            None => Err(StoreError::NotFound(format!("email source {}", address))),
        }
    }

    pub fn get_email_source(&self, source_id: &str) -> Result<EmailSourceRecord, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM email_sources WHERE id = ?1",
                    EMAIL_SOURCE_COLUMNS
                ),
                params![source_id],
                read_email_source_row,
            )
            .optional()?;
        match row {
            Some(row) => email_source_from_row(row),
            None => Err(StoreError::NotFound(format!("email source {}", source_id))),
        }
    }

    pub fn list_email_sources(&self, user_id: &str) -> Result<Vec<EmailSourceRecord>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM email_sources WHERE user_id = ?1 ORDER BY created_at",
            EMAIL_SOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], read_email_source_row)?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(email_source_from_row(row?)?);
        }
        Ok(sources)
    }

    pub fn set_email_source_enabled(
        &self,
        source_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.set_enabled(EMAIL_SOURCES_TABLE, source_id, enabled)
    }

    pub fn set_email_source_backfill_status(
        &self,
        source_id: &str,
        status: BackfillStatus,
        processed: u32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.set_backfill_status(EMAIL_SOURCES_TABLE, source_id, status, processed, error)
    }

    fn set_enabled(&self, table: &str, id: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            &format!("UPDATE {} SET enabled = ?1 WHERE id = ?2", table),
            params![bool_to_int(enabled), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{} {}", table, id)));
        }
        Ok(())
    }

    /// `in_progress` opens a new pass (clears the previous outcome); any other
    /// status closes it.
    fn set_backfill_status(
        &self,
        table: &str,
        id: &str,
        status: BackfillStatus,
        processed: u32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        let now = format_datetime(Utc::now());
        let updated = if status == BackfillStatus::InProgress {
            conn.execute(
                &format!(
                    "UPDATE {} SET backfill_status = ?1, backfill_started_at = ?2,
                        backfill_finished_at = NULL, backfill_error = NULL, backfill_processed = 0
                     WHERE id = ?3",
                    table
                ),
                params![status.as_str(), now, id],
            )?
        } else {
            conn.execute(
                &format!(
                    "UPDATE {} SET backfill_status = ?1, backfill_finished_at = ?2,
                        backfill_error = ?3, backfill_processed = ?4
                     WHERE id = ?5",
                    table
                ),
                params![status.as_str(), now, error, processed as i64, id],
            )?
        };
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{} {}", table, id)));
        }
        Ok(())
    }
}
