//! Language-model analysis of chat messages and emails.
//!
//! The core only depends on [`MessageAnalyzer`]; the HTTP analyzer forwards
//! requests to an external analysis service.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::inbound::ChatMessage;
use crate::store::{CalendarItem, ItemDraft};

/// A calendar item suggested by the analyzer.
pub type Proposal = ItemDraft;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer not configured")]
    NotConfigured,
    #[error("analyzer request failed: {0}")]
    Request(String),
    #[error("analyzer returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("analyzer response parse error: {0}")]
    Parse(String),
}

pub trait MessageAnalyzer: Send + Sync {
    fn is_configured(&self) -> bool;

    /// `history` is oldest first and does not contain `new_message`.
    fn analyze_message(
        &self,
        history: &[ChatMessage],
        new_message: &ChatMessage,
        existing_items: &[CalendarItem],
    ) -> Result<Option<Proposal>, AnalyzerError>;

    fn analyze_email(&self, email_content: &str) -> Result<Option<Proposal>, AnalyzerError>;
}

/// The two analysis capabilities. Either may be absent.
#[derive(Clone, Default)]
pub struct Analyzers {
    pub primary: Option<Arc<dyn MessageAnalyzer>>,
    pub fallback: Option<Arc<dyn MessageAnalyzer>>,
}

impl Analyzers {
    pub fn new(
        primary: Option<Arc<dyn MessageAnalyzer>>,
        fallback: Option<Arc<dyn MessageAnalyzer>>,
    ) -> Self {
        Self { primary, fallback }
    }

    pub fn none() -> Self {
        Self::default()
    }

    fn configured(&self) -> impl Iterator<Item = &Arc<dyn MessageAnalyzer>> {
        self.primary
            .iter()
            .chain(self.fallback.iter())
            .filter(|analyzer| analyzer.is_configured())
    }

    pub fn is_configured(&self) -> bool {
        self.configured().next().is_some()
    }

    /// Run `call` against the primary analyzer, then the fallback if the
    /// primary fails. The last error is returned when every analyzer fails.
    fn run<F>(&self, call: F) -> Result<Option<Proposal>, AnalyzerError>
    where
        F: Fn(&dyn MessageAnalyzer) -> Result<Option<Proposal>, AnalyzerError>,
    {
        let mut last_error = AnalyzerError::NotConfigured;
        for analyzer in self.configured() {
            match call(analyzer.as_ref()) {
                Ok(proposal) => return Ok(proposal),
                Err(err) => {
                    warn!("analyzer failed, trying next: {}", err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    pub fn analyze_message(
        &self,
        history: &[ChatMessage],
        new_message: &ChatMessage,
        existing_items: &[CalendarItem],
    ) -> Result<Option<Proposal>, AnalyzerError> {
        self.run(|analyzer| analyzer.analyze_message(history, new_message, existing_items))
    }

    pub fn analyze_email(&self, email_content: &str) -> Result<Option<Proposal>, AnalyzerError> {
        self.run(|analyzer| analyzer.analyze_email(email_content))
    }
}

impl std::fmt::Debug for Analyzers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzers")
            .field("primary", &self.primary.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ExistingItemSummary<'a> {
    id: String,
    title: &'a str,
    status: &'a str,
    action_type: &'a str,
    start_time: String,
    external_id: Option<&'a str>,
}

impl<'a> From<&'a CalendarItem> for ExistingItemSummary<'a> {
    fn from(item: &'a CalendarItem) -> Self {
        Self {
            id: item.id.to_string(),
            title: &item.title,
            status: item.status.as_str(),
            action_type: item.action_type.as_str(),
            start_time: item.start_time.to_rfc3339(),
            external_id: item.effective_external_id(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AnalysisRequest<'a> {
    Chat {
        history: &'a [ChatMessage],
        message: &'a ChatMessage,
        existing_items: Vec<ExistingItemSummary<'a>>,
    },
    Email {
        content: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    proposal: Option<Proposal>,
}

/// Analyzer backed by an HTTP endpoint that accepts an [`AnalysisRequest`]
/// and answers with `{"proposal": ... | null}`.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    endpoint: Option<String>,
    api_key: Option<String>,
    http: reqwest::blocking::Client,
}

impl HttpAnalyzer {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let endpoint = endpoint
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self {
            endpoint,
            api_key,
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Read the endpoint from `url_var`; the analyzer is disabled when unset.
    pub fn from_env(url_var: &str) -> Self {
        Self::new(
            std::env::var(url_var).ok(),
            std::env::var("ANALYZER_API_KEY").ok(),
        )
    }

    fn post(&self, request: &AnalysisRequest<'_>) -> Result<Option<Proposal>, AnalyzerError> {
        let endpoint = self.endpoint.as_deref().ok_or(AnalyzerError::NotConfigured)?;
        let mut builder = self.http.post(endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }
        let response = builder
            .send()
            .map_err(|e| AnalyzerError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(AnalyzerError::Api { status, body });
        }
        let parsed: AnalysisResponse = response
            .json()
            .map_err(|e| AnalyzerError::Parse(e.to_string()))?;
        debug!(
            "analyzer returned {}",
            if parsed.proposal.is_some() { "a proposal" } else { "nothing" }
        );
        Ok(parsed.proposal)
    }
}

impl MessageAnalyzer for HttpAnalyzer {
    fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    fn analyze_message(
        &self,
        history: &[ChatMessage],
        new_message: &ChatMessage,
        existing_items: &[CalendarItem],
    ) -> Result<Option<Proposal>, AnalyzerError> {
        self.post(&AnalysisRequest::Chat {
            history,
            message: new_message,
            existing_items: existing_items.iter().map(ExistingItemSummary::from).collect(),
        })
    }

    fn analyze_email(&self, email_content: &str) -> Result<Option<Proposal>, AnalyzerError> {
        self.post(&AnalysisRequest::Email {
            content: email_content,
        })
    }
}
