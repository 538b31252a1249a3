use chrono::Utc;
use rusqlite::params;

use crate::inbound::ChatMessage;

use super::{format_datetime, parse_datetime, AssistantStore, StoreError};

impl AssistantStore {
    /// Store a chat message, not yet analyzed. Returns `false` when the
    /// channel already holds a message with the same external id.
    pub fn insert_chat_message(
        &self,
        channel_id: &str,
        message: &ChatMessage,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO chat_messages (channel_id, external_message_id, author, content, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                channel_id,
                message.external_message_id,
                message.author,
                message.content,
                format_datetime(message.sent_at)
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_chat_message_analyzed(
        &self,
        channel_id: &str,
        external_message_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_messages
             WHERE channel_id = ?1 AND external_message_id = ?2 AND analyzed = 1",
            params![channel_id, external_message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns `false` when another caller already marked the message.
    pub fn mark_chat_message_analyzed(
        &self,
        channel_id: &str,
        external_message_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE chat_messages SET analyzed = 1
             WHERE channel_id = ?1 AND external_message_id = ?2 AND analyzed = 0",
            params![channel_id, external_message_id],
        )?;
        Ok(updated > 0)
    }

    pub fn count_channel_messages(&self, channel_id: &str) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// The latest `limit` messages of a channel, oldest first.
    pub fn recent_channel_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT external_message_id, author, content, sent_at
             FROM chat_messages
             WHERE channel_id = ?1
             ORDER BY sent_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (external_message_id, author, content, sent_at) = row?;
            messages.push(ChatMessage {
                external_message_id,
                author,
                content,
                sent_at: parse_datetime(&sent_at)?,
            });
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn is_email_processed(&self, user_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_emails WHERE user_id = ?1 AND message_id = ?2",
            params![user_id, message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns `false` when the email had already been recorded.
    pub fn mark_email_processed(&self, user_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_emails (user_id, message_id, processed_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, message_id, format_datetime(Utc::now())],
        )?;
        Ok(inserted > 0)
    }
}
