use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_optional_datetime, AssistantStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Confirmed,
    Synced,
    Rejected,
    Deleted,
    Dismissed,
    Completed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 7] = [
        ItemStatus::Pending,
        ItemStatus::Confirmed,
        ItemStatus::Synced,
        ItemStatus::Rejected,
        ItemStatus::Deleted,
        ItemStatus::Dismissed,
        ItemStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Confirmed => "confirmed",
            ItemStatus::Synced => "synced",
            ItemStatus::Rejected => "rejected",
            ItemStatus::Deleted => "deleted",
            ItemStatus::Dismissed => "dismissed",
            ItemStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Rejected | ItemStatus::Deleted | ItemStatus::Dismissed | ItemStatus::Completed
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| StoreError::InvalidValue {
                field: "status",
                value: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(ActionType::Create),
            "update" => Ok(ActionType::Update),
            "delete" => Ok(ActionType::Delete),
            other => Err(StoreError::InvalidValue {
                field: "action_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Event,
    Reminder,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Reminder => "reminder",
        }
    }
}

impl FromStr for ItemKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "event" => Ok(ItemKind::Event),
            "reminder" => Ok(ItemKind::Reminder),
            other => Err(StoreError::InvalidValue {
                field: "kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a calendar item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    Chat,
    Email,
    Manual,
}

impl ItemSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSource::Chat => "chat",
            ItemSource::Email => "email",
            ItemSource::Manual => "manual",
        }
    }
}

impl FromStr for ItemSource {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chat" => Ok(ItemSource::Chat),
            "email" => Ok(ItemSource::Email),
            "manual" => Ok(ItemSource::Manual),
            other => Err(StoreError::InvalidValue {
                field: "source",
                value: other.to_string(),
            }),
        }
    }
}

/// Content of a proposed or manually created calendar item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    #[serde(default)]
    pub kind: ItemKind,
    pub action_type: ActionType,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// External event an update/delete proposal refers to.
    #[serde(default)]
    pub target_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarItem {
    pub id: Uuid,
    pub user_id: String,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub action_type: ActionType,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub source: ItemSource,
    pub source_ref: Option<String>,
    pub external_id: Option<String>,
    pub target_external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarItem {
    /// External event this item mirrors or acts on.
    pub fn effective_external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .or(self.target_external_id.as_deref())
    }
}

const ITEM_COLUMNS: &str = "id, user_id, kind, status, action_type, title, description, location,
    start_time, end_time, source, source_ref, external_id, target_external_id, created_at, updated_at";

fn read_item(row: &Row<'_>) -> rusqlite::Result<Vec<Option<String>>> {
    (0..16).map(|idx| row.get::<_, Option<String>>(idx)).collect()
}

fn required(value: Option<String>, field: &'static str) -> Result<String, StoreError> {
    value.ok_or(StoreError::InvalidValue {
        field,
        value: "NULL".to_string(),
    })
}

fn item_from_row(columns: Vec<Option<String>>) -> Result<CalendarItem, StoreError> {
    let mut columns = columns.into_iter();
    let mut next = || columns.next().flatten();
    let id = required(next(), "id")?;
    let user_id = required(next(), "user_id")?;
    let kind = required(next(), "kind")?.parse()?;
    let status = required(next(), "status")?.parse()?;
    let action_type = required(next(), "action_type")?.parse()?;
    let title = required(next(), "title")?;
    let description = next();
    let location = next();
    let start_time = parse_datetime(&required(next(), "start_time")?)?;
    let end_time = parse_optional_datetime(next())?;
    let source = required(next(), "source")?.parse()?;
    let source_ref = next();
    let external_id = next();
    let target_external_id = next();
    let created_at = parse_datetime(&required(next(), "created_at")?)?;
    let updated_at = parse_datetime(&required(next(), "updated_at")?)?;
    let id = Uuid::parse_str(&id).map_err(|_| StoreError::InvalidValue {
        field: "id",
        value: id.clone(),
    })?;
    Ok(CalendarItem {
        id,
        user_id,
        kind,
        status,
        action_type,
        title,
        description,
        location,
        start_time,
        end_time,
        source,
        source_ref,
        external_id,
        target_external_id,
        created_at,
        updated_at,
    })
}

impl AssistantStore {
    pub fn insert_item(
        &self,
        user_id: &str,
        draft: &ItemDraft,
        status: ItemStatus,
        source: ItemSource,
        source_ref: Option<&str>,
    ) -> Result<CalendarItem, StoreError> {
        let conn = self.open()?;
        let id = Uuid::new_v4();
        let now = format_datetime(Utc::now());
        conn.execute(
            &format!(
                "INSERT INTO calendar_items ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?14, ?14)",
                ITEM_COLUMNS
            ),
            params![
                id.to_string(),
                user_id,
                draft.kind.as_str(),
                status.as_str(),
                draft.action_type.as_str(),
                draft.title,
                draft.description,
                draft.location,
                format_datetime(draft.start_time),
                draft.end_time.map(format_datetime),
                source.as_str(),
                source_ref,
                draft.target_external_id,
                now
            ],
        )?;
        self.get_item(&id)
    }

    pub fn get_item(&self, item_id: &Uuid) -> Result<CalendarItem, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM calendar_items WHERE id = ?1", ITEM_COLUMNS),
                params![item_id.to_string()],
                read_item,
            )
            .optional()?;
        match row {
            Some(columns) => item_from_row(columns),
            None => Err(StoreError::NotFound(format!("calendar item {}", item_id))),
        }
    }

    /// Items of a user, filtered by status (all statuses when `statuses` is empty).
    pub fn list_items(
        &self,
        user_id: &str,
        statuses: &[ItemStatus],
    ) -> Result<Vec<CalendarItem>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calendar_items WHERE user_id = ?1 ORDER BY start_time, created_at",
            ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], read_item)?;
        let mut items = Vec::new();
        for row in rows {
            let item = item_from_row(row?)?;
            if statuses.is_empty() || statuses.contains(&item.status) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn find_item_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<CalendarItem>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM calendar_items WHERE user_id = ?1 AND external_id = ?2
                     ORDER BY updated_at DESC LIMIT 1",
                    ITEM_COLUMNS
                ),
                params![user_id, external_id],
                read_item,
            )
            .optional()?;
        row.map(item_from_row).transpose()
    }

    /// Move an item from `from` to `to`, optionally recording an external id.
    ///
    /// The update only applies while the row still has status `from`; returns
    /// `false` when another writer moved it first.
    pub fn transition_item(
        &self,
        item_id: &Uuid,
        from: ItemStatus,
        to: ItemStatus,
        external_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE calendar_items
             SET status = ?1, external_id = COALESCE(?2, external_id), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                to.as_str(),
                external_id,
                format_datetime(Utc::now()),
                item_id.to_string(),
                from.as_str()
            ],
        )?;
        Ok(updated > 0)
    }

    /// Refresh the schedule of a mirrored item from its external copy.
    pub fn update_item_schedule(
        &self,
        item_id: &Uuid,
        title: &str,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE calendar_items SET title = ?1, start_time = ?2, end_time = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                title,
                format_datetime(start_time),
                end_time.map(format_datetime),
                format_datetime(Utc::now()),
                item_id.to_string()
            ],
        )?;
        Ok(())
    }
}
