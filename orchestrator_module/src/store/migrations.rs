use rusqlite::Connection;
use std::collections::HashSet;

use super::StoreError;

/// Databases created before chat messages tracked analysis lack the column.
/// Rows already stored were analyzed when they were inserted.
pub(super) fn ensure_chat_message_columns(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("PRAGMA table_info(chat_messages)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }

    if !columns.contains("analyzed") {
        conn.execute(
            "ALTER TABLE chat_messages ADD COLUMN analyzed INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
        conn.execute("UPDATE chat_messages SET analyzed = 1", [])?;
    }
    Ok(())
}
