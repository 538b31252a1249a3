//! The analysis entry point shared by live traffic, pollers and backfill.

use tracing::{debug, info};

use crate::analyzer::{AnalyzerError, Analyzers};
use crate::inbound::{ChatMessage, InboundMessage};
use crate::mail_client::EmailMessage;
use crate::store::{
    AssistantStore, CalendarItem, ChannelRecord, ItemSource, ItemStatus, StoreError,
};

/// Items the analyzer sees as already known to the user.
const OPEN_STATUSES: [ItemStatus; 3] = [
    ItemStatus::Pending,
    ItemStatus::Confirmed,
    ItemStatus::Synced,
];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Already ingested earlier; not analyzed again.
    Duplicate,
    /// Channel unknown or disabled.
    Ignored,
    /// Stored, but no analyzer is configured.
    NotAnalyzed,
    NoProposal,
    Proposed(CalendarItem),
}

#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    store: AssistantStore,
    analyzers: Analyzers,
    history_limit: usize,
}

impl AnalysisPipeline {
    pub fn new(store: AssistantStore, analyzers: Analyzers, history_limit: usize) -> Self {
        Self {
            store,
            analyzers,
            history_limit,
        }
    }

    pub fn analyzers(&self) -> &Analyzers {
        &self.analyzers
    }

    pub fn store(&self) -> &AssistantStore {
        &self.store
    }

    /// Resolve the channel of a live message and process it.
    pub fn process_inbound(&self, inbound: &InboundMessage) -> Result<PipelineOutcome, PipelineError> {
        let channel = self.store.find_channel(
            &inbound.user_id,
            &inbound.platform,
            &inbound.external_channel_id,
        )?;
        match channel {
            Some(channel) if channel.enabled => self.process_chat_message(&channel, &inbound.message),
            _ => {
                debug!(
                    "ignoring message for unknown or disabled {} channel {} of user {}",
                    inbound.platform, inbound.external_channel_id, inbound.user_id
                );
                Ok(PipelineOutcome::Ignored)
            }
        }
    }

    /// Store a chat message and analyze it against the channel's recent history.
    /// A message is analyzed until one analysis succeeds, then never again.
    pub fn process_chat_message(
        &self,
        channel: &ChannelRecord,
        message: &ChatMessage,
    ) -> Result<PipelineOutcome, PipelineError> {
        let inserted = self.store.insert_chat_message(&channel.id, message)?;
        if !inserted
            && self
                .store
                .is_chat_message_analyzed(&channel.id, &message.external_message_id)?
        {
            return Ok(PipelineOutcome::Duplicate);
        }
        if !self.analyzers.is_configured() {
            return Ok(PipelineOutcome::NotAnalyzed);
        }

        let history: Vec<ChatMessage> = self
            .store
            .recent_channel_messages(&channel.id, self.history_limit + 1)?
            .into_iter()
            .filter(|earlier| earlier.external_message_id != message.external_message_id)
            .collect();
        let existing = self.store.list_items(&channel.user_id, &OPEN_STATUSES)?;

        // A failed analysis leaves the message unmarked so a redelivery retries it.
        let proposal = self.analyzers.analyze_message(&history, message, &existing)?;
        if !self
            .store
            .mark_chat_message_analyzed(&channel.id, &message.external_message_id)?
        {
            return Ok(PipelineOutcome::Duplicate);
        }
        match proposal {
            Some(proposal) => {
                let item = self.store.insert_item(
                    &channel.user_id,
                    &proposal,
                    ItemStatus::Pending,
                    ItemSource::Chat,
                    Some(&channel.id),
                )?;
                info!(
                    "proposed {} '{}' from {} channel {} for user {}",
                    item.action_type, item.title, channel.platform, channel.id, channel.user_id
                );
                Ok(PipelineOutcome::Proposed(item))
            }
            None => Ok(PipelineOutcome::NoProposal),
        }
    }

    /// Analyze an email once. A failed analysis leaves the email unmarked so
    /// the next poll retries it.
    pub fn process_email(
        &self,
        user_id: &str,
        email: &EmailMessage,
    ) -> Result<PipelineOutcome, PipelineError> {
        if self.store.is_email_processed(user_id, &email.message_id)? {
            return Ok(PipelineOutcome::Duplicate);
        }
        if !self.analyzers.is_configured() {
            return Ok(PipelineOutcome::NotAnalyzed);
        }

        let proposal = self.analyzers.analyze_email(&email.analysis_text())?;
        if !self.store.mark_email_processed(user_id, &email.message_id)? {
            return Ok(PipelineOutcome::Duplicate);
        }
        match proposal {
            Some(proposal) => {
                let item = self.store.insert_item(
                    user_id,
                    &proposal,
                    ItemStatus::Pending,
                    ItemSource::Email,
                    Some(&email.message_id),
                )?;
                info!(
                    "proposed {} '{}' from email {} for user {}",
                    item.action_type, item.title, email.message_id, user_id
                );
                Ok(PipelineOutcome::Proposed(item))
            }
            None => Ok(PipelineOutcome::NoProposal),
        }
    }
}
