//! External calendar access: the client trait the core consumes and the
//! Google Calendar implementation of it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::google_auth::GoogleAuth;
use crate::store::CalendarItem;

pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";
const DEFAULT_EVENT_DURATION_MINUTES: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar auth error: {0}")]
    Auth(String),
    #[error("calendar request failed: {0}")]
    Request(String),
    #[error("calendar api error: HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("calendar response parse error: {0}")]
    Parse(String),
}

/// Event fields written to the external calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EventPayload {
    /// An item without an end time lasts one hour.
    pub fn from_item(item: &CalendarItem) -> Self {
        Self {
            title: item.title.clone(),
            description: item.description.clone(),
            location: item.location.clone(),
            start: item.start_time,
            end: item
                .end_time
                .unwrap_or(item.start_time + Duration::minutes(DEFAULT_EVENT_DURATION_MINUTES)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// An event as read back from the external calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEvent {
    pub id: String,
    pub title: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: ExternalEventStatus,
    pub updated: Option<DateTime<Utc>>,
}

/// Per-user handle on an external calendar.
pub trait ExternalCalendarClient: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Create an event and return its external id.
    fn create_item(&self, payload: &EventPayload) -> Result<String, CalendarError>;

    fn update_item(&self, external_id: &str, payload: &EventPayload) -> Result<(), CalendarError>;

    /// Deleting an event that no longer exists succeeds.
    fn delete_item(&self, external_id: &str) -> Result<(), CalendarError>;

    /// Events changed since `since`, cancelled ones included, at most `max`.
    fn list_changed_items(
        &self,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ExternalEvent>, CalendarError>;
}

/// Google Calendar v3 client for the user's primary calendar.
#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    auth: GoogleAuth,
    base_url: String,
    calendar_id: String,
    http: reqwest::blocking::Client,
}

impl GoogleCalendarClient {
    pub fn new(auth: GoogleAuth, base_url: impl Into<String>) -> Self {
        Self {
            auth,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            calendar_id: "primary".to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, external_id: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(external_id))
    }

    fn bearer(&self) -> Result<String, CalendarError> {
        let token = self
            .auth
            .get_access_token()
            .map_err(|e| CalendarError::Auth(e.to_string()))?;
        Ok(format!("Bearer {}", token))
    }

    fn check(
        response: reqwest::blocking::Response,
        action: &str,
    ) -> Result<reqwest::blocking::Response, CalendarError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        error!("Google Calendar {} failed: {} - {}", action, status, body);
        Err(CalendarError::Api { status, body })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventBody<'a> {
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    start: GoogleEventTime,
    end: GoogleEventTime,
}

impl<'a> GoogleEventBody<'a> {
    fn from_payload(payload: &'a EventPayload) -> Self {
        Self {
            summary: &payload.title,
            description: payload.description.as_deref(),
            location: payload.location.as_deref(),
            start: GoogleEventTime::at(payload.start),
            end: GoogleEventTime::at(payload.end),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GoogleEventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

impl GoogleEventTime {
    fn at(value: DateTime<Utc>) -> Self {
        Self {
            date_time: Some(value),
            time_zone: Some("UTC".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleEventResource {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    start: Option<GoogleEventTime>,
    #[serde(default)]
    end: Option<GoogleEventTime>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

impl From<GoogleEventResource> for ExternalEvent {
    fn from(resource: GoogleEventResource) -> Self {
        let status = match resource.status.as_deref() {
            Some("cancelled") => ExternalEventStatus::Cancelled,
            Some("tentative") => ExternalEventStatus::Tentative,
            _ => ExternalEventStatus::Confirmed,
        };
        ExternalEvent {
            id: resource.id,
            title: resource.summary,
            start: resource.start.and_then(|time| time.date_time),
            end: resource.end.and_then(|time| time.date_time),
            status,
            updated: resource.updated,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleEventList {
    #[serde(default)]
    items: Vec<GoogleEventResource>,
}

impl ExternalCalendarClient for GoogleCalendarClient {
    fn is_authenticated(&self) -> bool {
        self.auth.get_access_token().is_ok()
    }

    fn create_item(&self, payload: &EventPayload) -> Result<String, CalendarError> {
        let response = self
            .http
            .post(self.events_url())
            .header("Authorization", self.bearer()?)
            .json(&GoogleEventBody::from_payload(payload))
            .send()
            .map_err(|e| CalendarError::Request(e.to_string()))?;
        let created: GoogleEventResource = Self::check(response, "create")?
            .json()
            .map_err(|e| CalendarError::Parse(e.to_string()))?;
        Ok(created.id)
    }

    fn update_item(&self, external_id: &str, payload: &EventPayload) -> Result<(), CalendarError> {
        let response = self
            .http
            .patch(self.event_url(external_id))
            .header("Authorization", self.bearer()?)
            .json(&GoogleEventBody::from_payload(payload))
            .send()
            .map_err(|e| CalendarError::Request(e.to_string()))?;
        Self::check(response, "update")?;
        Ok(())
    }

    fn delete_item(&self, external_id: &str) -> Result<(), CalendarError> {
        let response = self
            .http
            .delete(self.event_url(external_id))
            .header("Authorization", self.bearer()?)
            .send()
            .map_err(|e| CalendarError::Request(e.to_string()))?;
        // 404/410: already gone
        if matches!(response.status().as_u16(), 404 | 410) {
            return Ok(());
        }
        Self::check(response, "delete")?;
        Ok(())
    }

    fn list_changed_items(
        &self,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ExternalEvent>, CalendarError> {
        let max_results = max.clamp(1, 2500).to_string();
        let updated_min = since.to_rfc3339();
        let response = self
            .http
            .get(self.events_url())
            .header("Authorization", self.bearer()?)
            .query(&[
                ("updatedMin", updated_min.as_str()),
                ("showDeleted", "true"),
                ("singleEvents", "true"),
                ("orderBy", "updated"),
                ("maxResults", max_results.as_str()),
            ])
            .send()
            .map_err(|e| CalendarError::Request(e.to_string()))?;
        let list: GoogleEventList = Self::check(response, "list")?
            .json()
            .map_err(|e| CalendarError::Parse(e.to_string()))?;
        Ok(list.items.into_iter().map(ExternalEvent::from).collect())
    }
}
