pub(super) const ASSISTANT_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS chat_sessions (
    user_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    active INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, platform)
);

CREATE TABLE IF NOT EXISTS sync_settings (
    user_id TEXT PRIMARY KEY,
    calendar_sync_enabled INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    external_channel_id TEXT NOT NULL,
    name TEXT,
    enabled INTEGER NOT NULL,
    backfill_status TEXT,
    backfill_started_at TEXT,
    backfill_finished_at TEXT,
    backfill_error TEXT,
    backfill_processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, platform, external_channel_id)
);

CREATE TABLE IF NOT EXISTS email_sources (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    address TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    backfill_status TEXT,
    backfill_started_at TEXT,
    backfill_finished_at TEXT,
    backfill_error TEXT,
    backfill_processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, address)
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    external_message_id TEXT NOT NULL,
    author TEXT NOT NULL,
    content TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    analyzed INTEGER NOT NULL DEFAULT 0,
    UNIQUE(channel_id, external_message_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_channel_sent
ON chat_messages(channel_id, sent_at);

CREATE TABLE IF NOT EXISTS processed_emails (
    user_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (user_id, message_id)
);

CREATE TABLE IF NOT EXISTS calendar_items (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    action_type TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    location TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    source TEXT NOT NULL,
    source_ref TEXT,
    external_id TEXT,
    target_external_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calendar_items_user_status
ON calendar_items(user_id, status);

CREATE INDEX IF NOT EXISTS idx_calendar_items_external
ON calendar_items(user_id, external_id);
"#;
