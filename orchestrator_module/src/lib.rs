pub mod analyzer;
pub mod backfill;
pub mod calendar_client;
pub mod clients;
pub mod config;
pub mod confirmation;
pub mod connector;
pub mod credential_vault;
pub mod google_auth;
pub mod inbound;
pub mod mail_client;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod scopes;
pub mod store;
pub mod workers;

pub use analyzer::{AnalyzerError, Analyzers, HttpAnalyzer, MessageAnalyzer, Proposal};
pub use backfill::{BackfillCoordinator, BackfillError, BackfillHandle, BackfillReport};
pub use calendar_client::{
    CalendarError, EventPayload, ExternalCalendarClient, ExternalEvent, ExternalEventStatus,
    GoogleCalendarClient,
};
pub use clients::{ClientError, GoogleClientFactory, IntegrationClients};
pub use config::OrchestratorConfig;
pub use confirmation::{ConfirmationService, Transition, TransitionError};
pub use connector::{ChatSource, ConnectorError, ConnectorManager, ConnectorRegistry, ListenerHandle};
pub use credential_vault::{CredentialVault, SqliteCredentialVault, TokenMaterial, VaultError};
pub use inbound::{inbound_queue, ChatMessage, InboundMessage, InboundSender};
pub use mail_client::{EmailMessage, GmailClient, MailClient, MailError, MailQuery};
pub use orchestrator::{OrchestratorDeps, WorkerCounts, WorkerOrchestrator};
pub use pipeline::{AnalysisPipeline, PipelineError, PipelineOutcome};
pub use scopes::{ScopeSet, CALENDAR_SCOPE, GMAIL_SCOPE};
pub use store::{
    ActionType, AssistantStore, BackfillStatus, CalendarItem, ChannelRecord, EmailSourceRecord,
    ItemDraft, ItemKind, ItemSource, ItemStatus, StoreError,
};
