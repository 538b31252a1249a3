//! Mailbox access used by the email poller.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{error, warn};

use crate::google_auth::GoogleAuth;

pub const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";

const LIST_PAGE_SIZE: &str = "500";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail auth error: {0}")]
    Auth(String),
    #[error("mail request failed: {0}")]
    Request(String),
    #[error("mail api error: HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("mail response parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Plain-text rendering handed to the analyzer.
    pub fn analysis_text(&self) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nDate: {}\n\n{}",
            self.from.as_deref().unwrap_or(""),
            self.to.as_deref().unwrap_or(""),
            self.subject.as_deref().unwrap_or(""),
            self.received_at.to_rfc3339(),
            self.body
        )
    }
}

/// Which messages to list.
#[derive(Debug, Clone, PartialEq)]
pub struct MailQuery {
    pub since: DateTime<Utc>,
    pub max_items: usize,
    /// Restrict to messages delivered to this address.
    pub address: Option<String>,
}

pub trait MailClient: Send + Sync {
    /// Messages received after `query.since`, oldest first, at most `query.max_items`.
    fn list_messages(&self, query: &MailQuery) -> Result<Vec<EmailMessage>, MailError>;
}

/// Gmail REST client for the authenticated user's mailbox.
#[derive(Debug, Clone)]
pub struct GmailClient {
    auth: GoogleAuth,
    base_url: String,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResource {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<MessageHeader>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

impl MessageResource {
    fn header(&self, name: &str) -> Option<String> {
        self.payload.as_ref().and_then(|payload| {
            payload
                .headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.clone())
        })
    }

    fn into_email(self) -> EmailMessage {
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);
        EmailMessage {
            from: self.header("From"),
            to: self.header("To"),
            subject: self.header("Subject"),
            body: self.snippet.clone().unwrap_or_default(),
            message_id: self.id,
            thread_id: self.thread_id,
            received_at,
        }
    }
}

impl GmailClient {
    pub fn new(auth: GoogleAuth, base_url: impl Into<String>) -> Self {
        Self {
            auth,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn bearer(&self) -> Result<String, MailError> {
        let token = self
            .auth
            .get_access_token()
            .map_err(|e| MailError::Auth(e.to_string()))?;
        Ok(format!("Bearer {}", token))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, MailError> {
        let response = self
            .http
            .get(url)
            .header("Authorization", self.bearer()?)
            .query(query)
            .send()
            .map_err(|e| MailError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            error!("Gmail request {} failed: {} - {}", url, status, body);
            return Err(MailError::Api { status, body });
        }
        response.json().map_err(|e| MailError::Parse(e.to_string()))
    }
}

impl GmailClient {
    /// Every message id matching `search`, newest first as Gmail returns them.
    fn list_ids(&self, search: &str) -> Result<Vec<String>, MailError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", search), ("maxResults", LIST_PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: MessageListResponse = self.get_json(&url, &params)?;
            ids.extend(page.messages.into_iter().map(|message| message.id));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(ids)
    }
}

impl MailClient for GmailClient {
    fn list_messages(&self, query: &MailQuery) -> Result<Vec<EmailMessage>, MailError> {
        let mut search = format!("after:{}", query.since.timestamp());
        if let Some(address) = &query.address {
            search.push_str(&format!(" to:{}", address));
        }
        let mut ids = self.list_ids(&search)?;
        // Keep the oldest ones so the caller's cursor never skips past a backlog.
        ids.reverse();
        ids.truncate(query.max_items);

        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            let url = format!(
                "{}/users/me/messages/{}",
                self.base_url,
                urlencoding::encode(&id)
            );
            match self.get_json::<MessageResource>(
                &url,
                &[
                    ("format", "metadata"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "To"),
                    ("metadataHeaders", "Subject"),
                ],
            ) {
                Ok(resource) => emails.push(resource.into_email()),
                Err(MailError::Api { status: 404, .. }) => {
                    warn!("Gmail message {} disappeared before fetch", id);
                }
                Err(err) => return Err(err),
            }
        }
        emails.sort_by_key(|email| email.received_at);
        Ok(emails)
    }
}
