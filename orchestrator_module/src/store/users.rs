use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{bool_to_int, format_datetime, AssistantStore, StoreError};

impl AssistantStore {
    /// Record whether the user currently holds a live chat session on `platform`.
    pub fn set_chat_session(
        &self,
        user_id: &str,
        platform: &str,
        active: bool,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO chat_sessions (user_id, platform, active, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, platform) DO UPDATE SET
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                user_id,
                platform,
                bool_to_int(active),
                format_datetime(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn has_active_chat_session(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_sessions WHERE user_id = ?1 AND active = 1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn users_with_active_chat_session(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_id FROM chat_sessions WHERE active = 1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut user_ids = Vec::new();
        for row in rows {
            user_ids.push(row?);
        }
        Ok(user_ids)
    }

    pub fn set_calendar_sync_enabled(&self, user_id: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO sync_settings (user_id, calendar_sync_enabled, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                calendar_sync_enabled = excluded.calendar_sync_enabled,
                updated_at = excluded.updated_at",
            params![user_id, bool_to_int(enabled), format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    /// Calendar sync is off until the user turns it on.
    pub fn calendar_sync_enabled(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT calendar_sync_enabled FROM sync_settings WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) != 0)
    }
}
