use super::*;
use crate::analyzer::{AnalyzerError, MessageAnalyzer, Proposal};
use crate::calendar_client::{CalendarError, EventPayload, ExternalCalendarClient, ExternalEvent};
use crate::clients::ClientError;
use crate::connector::ConnectorError;
use crate::credential_vault::{SqliteCredentialVault, TokenMaterial};
use crate::inbound::{inbound_queue, ChatMessage, InboundSender};
use crate::mail_client::{EmailMessage, MailClient, MailError, MailQuery};
use crate::scopes::ScopeSet;
use crate::store::{CalendarItem, ChannelRecord};
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tempfile::TempDir;

struct StubAnalyzer {
    configured: bool,
}

impl MessageAnalyzer for StubAnalyzer {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn analyze_message(
        &self,
        _history: &[ChatMessage],
        _new_message: &ChatMessage,
        _existing_items: &[CalendarItem],
    ) -> Result<Option<Proposal>, AnalyzerError> {
        Ok(None)
    }

    fn analyze_email(&self, _email_content: &str) -> Result<Option<Proposal>, AnalyzerError> {
        Ok(None)
    }
}

struct EmptyMail;

impl MailClient for EmptyMail {
    fn list_messages(&self, _query: &MailQuery) -> Result<Vec<EmailMessage>, MailError> {
        Ok(Vec::new())
    }
}

struct EmptyCalendar;

impl ExternalCalendarClient for EmptyCalendar {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn create_item(&self, _payload: &EventPayload) -> Result<String, CalendarError> {
        Ok("evt".to_string())
    }

    fn update_item(&self, _external_id: &str, _payload: &EventPayload) -> Result<(), CalendarError> {
        Ok(())
    }

    fn delete_item(&self, _external_id: &str) -> Result<(), CalendarError> {
        Ok(())
    }

    fn list_changed_items(
        &self,
        _since: DateTime<Utc>,
        _max: usize,
    ) -> Result<Vec<ExternalEvent>, CalendarError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CountingClients {
    mail_builds: AtomicUsize,
    calendar_builds: AtomicUsize,
}

impl IntegrationClients for CountingClients {
    fn mail_client(&self, _user_id: &str) -> Result<Arc<dyn MailClient>, ClientError> {
        self.mail_builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EmptyMail))
    }

    fn calendar_client(
        &self,
        _user_id: &str,
    ) -> Result<Arc<dyn ExternalCalendarClient>, ClientError> {
        self.calendar_builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EmptyCalendar))
    }
}

#[derive(Default)]
struct RecordingConnectors {
    cleanups: Mutex<Vec<String>>,
}

impl ConnectorManager for RecordingConnectors {
    fn cleanup_user(&self, user_id: &str) {
        self.cleanups.lock().unwrap().push(user_id.to_string());
    }

    fn fetch_channel_history(
        &self,
        _user_id: &str,
        _channel: &ChannelRecord,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ConnectorError> {
        Ok(Vec::new())
    }
}

struct Fixture {
    _temp: TempDir,
    vault: Arc<SqliteCredentialVault>,
    clients: Arc<CountingClients>,
    connectors: Arc<RecordingConnectors>,
    _sender: Option<InboundSender>,
    orchestrator: WorkerOrchestrator,
}

impl Fixture {
    fn new(analyzer_configured: bool, with_queue: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let store = AssistantStore::new(temp.path().join("assistant.db")).unwrap();
        let vault = Arc::new(SqliteCredentialVault::new(temp.path().join("vault.db")).unwrap());
        let clients = Arc::new(CountingClients::default());
        let connectors = Arc::new(RecordingConnectors::default());
        let (sender, inbound) = if with_queue {
            let (sender, receiver) = inbound_queue(8);
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        let orchestrator = WorkerOrchestrator::new(OrchestratorDeps {
            config: OrchestratorConfig {
                gmail_poll_interval: Duration::from_secs(1),
                gcal_poll_interval: Duration::from_secs(1),
                ..OrchestratorConfig::default()
            },
            store,
            vault: vault.clone(),
            clients: clients.clone(),
            connectors: connectors.clone(),
            analyzers: Analyzers::new(
                Some(Arc::new(StubAnalyzer {
                    configured: analyzer_configured,
                })),
                None,
            ),
            inbound,
        });
        Self {
            _temp: temp,
            vault,
            clients,
            connectors,
            _sender: sender,
            orchestrator,
        }
    }

    fn grant(&self, user_id: &str, scopes: &[&str]) {
        self.vault
            .grant_scopes(
                user_id,
                &TokenMaterial {
                    access_token: Some("access".to_string()),
                    refresh_token: Some("refresh".to_string()),
                    expires_at: None,
                },
                &scopes.iter().copied().collect::<ScopeSet>(),
            )
            .unwrap();
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

#[test]
fn global_processor_starts_once() {
    let fixture = Fixture::new(true, true);
    assert!(fixture.orchestrator.start_global_processor());
    assert!(fixture.orchestrator.start_global_processor());
    assert!(fixture.orchestrator.worker_counts().processor_running);

    fixture.orchestrator.stop_global_processor();
    assert!(!fixture.orchestrator.worker_counts().processor_running);
    fixture.orchestrator.stop_global_processor();
}

#[test]
fn processor_needs_analyzer_and_queue() {
    let unconfigured = Fixture::new(false, true);
    assert!(!unconfigured.orchestrator.start_global_processor());
    assert!(!unconfigured.orchestrator.worker_counts().processor_running);

    let queueless = Fixture::new(true, false);
    assert!(!queueless.orchestrator.start_global_processor());
}

#[test]
fn start_is_idempotent_per_user() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE, CALENDAR_SCOPE]);

    fixture.orchestrator.start_services_for_user("u1");
    fixture.orchestrator.start_services_for_user("u1");

    assert!(fixture.orchestrator.is_running_for_user("u1"));
    assert_eq!(
        fixture.orchestrator.worker_counts(),
        WorkerCounts {
            email_pollers: 1,
            calendar_pollers: 1,
            processor_running: false,
        }
    );
    assert_eq!(fixture.clients.mail_builds.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.clients.calendar_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn new_scope_fills_in_missing_poller_only() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE]);
    fixture.orchestrator.start_services_for_user("u1");
    let email_before = fixture.orchestrator.email_poller("u1").unwrap();
    assert!(fixture.orchestrator.calendar_poller("u1").is_none());

    fixture.grant("u1", &[CALENDAR_SCOPE]);
    fixture.orchestrator.start_services_for_user("u1");

    let email_after = fixture.orchestrator.email_poller("u1").unwrap();
    assert!(Arc::ptr_eq(&email_before, &email_after));
    assert!(fixture.orchestrator.calendar_poller("u1").is_some());
    assert!(fixture.connectors.cleanups.lock().unwrap().is_empty());
}

#[test]
fn user_without_scopes_gets_no_workers() {
    let fixture = Fixture::new(true, true);
    fixture.orchestrator.start_services_for_user("nobody");
    assert!(!fixture.orchestrator.is_running_for_user("nobody"));
    assert_eq!(fixture.clients.mail_builds.load(Ordering::SeqCst), 0);
}

#[test]
fn stopping_unknown_user_is_safe() {
    let fixture = Fixture::new(true, true);
    fixture.orchestrator.stop_services_for_user("ghost");
    assert!(!fixture.orchestrator.stop_gmail_worker_for_user("ghost"));
    assert!(!fixture.orchestrator.stop_gcal_worker_for_user("ghost"));
    assert_eq!(
        fixture.connectors.cleanups.lock().unwrap().as_slice(),
        ["ghost".to_string()]
    );
}

#[test]
fn stop_removes_tenant_and_allows_restart() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE]);
    fixture.orchestrator.start_services_for_user("u1");

    fixture.orchestrator.stop_services_for_user("u1");
    assert!(!fixture.orchestrator.is_running_for_user("u1"));
    assert_eq!(fixture.orchestrator.worker_counts().email_pollers, 0);

    fixture.orchestrator.start_services_for_user("u1");
    assert!(fixture.orchestrator.is_running_for_user("u1"));
    assert_eq!(fixture.clients.mail_builds.load(Ordering::SeqCst), 2);
}

#[test]
fn revocation_stops_matching_worker() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE, CALENDAR_SCOPE]);
    fixture.orchestrator.start_services_for_user("u1");

    fixture
        .orchestrator
        .handle_scope_revocation("u1", CALENDAR_SCOPE)
        .unwrap();
    assert!(fixture.orchestrator.calendar_poller("u1").is_none());
    assert!(fixture.orchestrator.email_poller("u1").is_some());
    assert!(!fixture.vault.has_scope("u1", CALENDAR_SCOPE).unwrap());

    fixture
        .orchestrator
        .handle_scope_revocation("u1", GMAIL_SCOPE)
        .unwrap();
    assert!(!fixture.orchestrator.is_running_for_user("u1"));
}

#[test]
fn eligible_scan_runs_once() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE]);
    fixture.grant("u2", &[CALENDAR_SCOPE]);
    fixture
        .orchestrator
        .store()
        .set_chat_session("u3", "discord", true)
        .unwrap();

    assert_eq!(fixture.orchestrator.start_services_for_eligible_users(), 3);
    assert_eq!(fixture.orchestrator.start_services_for_eligible_users(), 0);

    assert!(fixture.orchestrator.is_running_for_user("u1"));
    assert!(fixture.orchestrator.is_running_for_user("u2"));
    // A chat session alone grants no polling scope.
    assert!(!fixture.orchestrator.is_running_for_user("u3"));
}

#[test]
fn email_backfill_without_worker_fails() {
    let fixture = Fixture::new(true, true);
    let source = fixture
        .orchestrator
        .store()
        .attach_email_source("u1", "Team@Example.com")
        .unwrap();
    let report = fixture.orchestrator.backfill_email_source(
        "u1",
        &source,
        chrono::Duration::days(7),
        10,
    );
    assert_eq!(report.status, crate::store::BackfillStatus::Failed);
    assert_eq!(
        report.error.as_deref(),
        Some("no email worker running for user u1")
    );
}

#[test]
fn shutdown_clears_everything() {
    let fixture = Fixture::new(true, true);
    fixture.grant("u1", &[GMAIL_SCOPE, CALENDAR_SCOPE]);
    fixture.grant("u2", &[GMAIL_SCOPE]);
    fixture.orchestrator.start_global_processor();
    fixture.orchestrator.start_services_for_user("u1");
    fixture.orchestrator.start_services_for_user("u2");

    fixture.orchestrator.shutdown();

    assert_eq!(fixture.orchestrator.worker_counts(), WorkerCounts::default());
    let mut cleaned = fixture.connectors.cleanups.lock().unwrap().clone();
    cleaned.sort();
    assert_eq!(cleaned, vec!["u1".to_string(), "u2".to_string()]);
}
