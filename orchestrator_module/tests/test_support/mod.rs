#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use orchestrator_module::{
    inbound_queue, Analyzers, AnalyzerError, AssistantStore, CalendarError, CalendarItem,
    ChatMessage, ChatSource, ClientError, ConnectorError, ConnectorRegistry, CredentialVault,
    EmailMessage, EventPayload, ExternalCalendarClient, ExternalEvent, InboundSender,
    IntegrationClients, ItemDraft, ListenerHandle, MailClient, MailError, MailQuery,
    MessageAnalyzer, OrchestratorConfig, OrchestratorDeps, Proposal, ScopeSet,
    SqliteCredentialVault, TokenMaterial, WorkerOrchestrator,
};

/// Analyzer that counts calls and proposes an event for messages mentioning "meet".
pub struct CountingAnalyzer {
    pub configured: bool,
    pub chat_calls: AtomicUsize,
    pub email_calls: AtomicUsize,
}

impl CountingAnalyzer {
    pub fn new(configured: bool) -> Self {
        Self {
            configured,
            chat_calls: AtomicUsize::new(0),
            email_calls: AtomicUsize::new(0),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst) + self.email_calls.load(Ordering::SeqCst)
    }
}

fn proposal_for(text: &str, at: DateTime<Utc>) -> Option<Proposal> {
    if !text.contains("meet") {
        return None;
    }
    Some(ItemDraft {
        kind: Default::default(),
        action_type: orchestrator_module::ActionType::Create,
        title: text.chars().take(40).collect(),
        description: None,
        location: None,
        start_time: at + ChronoDuration::days(1),
        end_time: None,
        target_external_id: None,
    })
}

impl MessageAnalyzer for CountingAnalyzer {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn analyze_message(
        &self,
        _history: &[ChatMessage],
        new_message: &ChatMessage,
        _existing_items: &[CalendarItem],
    ) -> Result<Option<Proposal>, AnalyzerError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(proposal_for(&new_message.content, new_message.sent_at))
    }

    fn analyze_email(&self, email_content: &str) -> Result<Option<Proposal>, AnalyzerError> {
        self.email_calls.fetch_add(1, Ordering::SeqCst);
        Ok(proposal_for(email_content, Utc::now()))
    }
}

/// Mailbox that delivers one brand-new email on every poll.
#[derive(Default)]
pub struct FakeMail {
    pub polls: AtomicUsize,
    pub backlog: Mutex<Vec<EmailMessage>>,
}

impl MailClient for FakeMail {
    fn list_messages(&self, query: &MailQuery) -> Result<Vec<EmailMessage>, MailError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if query.address.is_some() {
            return Ok(self.backlog.lock().unwrap().clone());
        }
        Ok(vec![EmailMessage {
            message_id: format!("live-{}", poll),
            thread_id: None,
            from: Some("friend@example.com".to_string()),
            to: Some("me@example.com".to_string()),
            subject: Some("hello".to_string()),
            body: "just checking in".to_string(),
            received_at: Utc::now(),
        }])
    }
}

#[derive(Default)]
pub struct FakeCalendar {
    pub calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl ExternalCalendarClient for FakeCalendar {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn create_item(&self, _payload: &EventPayload) -> Result<String, CalendarError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("evt-{}", call + 1))
    }

    fn update_item(&self, _external_id: &str, _payload: &EventPayload) -> Result<(), CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_item(&self, _external_id: &str) -> Result<(), CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_changed_items(
        &self,
        _since: DateTime<Utc>,
        _max: usize,
    ) -> Result<Vec<ExternalEvent>, CalendarError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

pub struct FakeClients {
    pub mail: Arc<FakeMail>,
    pub calendar: Arc<FakeCalendar>,
}

impl IntegrationClients for FakeClients {
    fn mail_client(&self, _user_id: &str) -> Result<Arc<dyn MailClient>, ClientError> {
        Ok(self.mail.clone())
    }

    fn calendar_client(
        &self,
        _user_id: &str,
    ) -> Result<Arc<dyn ExternalCalendarClient>, ClientError> {
        Ok(self.calendar.clone())
    }
}

struct FakeListener(Arc<AtomicUsize>);

impl ListenerHandle for FakeListener {
    fn stop(self: Box<Self>) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Chat platform with scripted history.
#[derive(Default)]
pub struct FakeChatSource {
    pub history: Mutex<Vec<ChatMessage>>,
    pub fail_fetch: AtomicBool,
    pub fetches: AtomicUsize,
    pub fetch_delay: Mutex<Option<Duration>>,
    pub active_listeners: Arc<AtomicUsize>,
}

impl ChatSource for FakeChatSource {
    fn platform(&self) -> &str {
        "discord"
    }

    fn fetch_history(
        &self,
        _user_id: &str,
        _external_channel_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ConnectorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ConnectorError::Request("gateway timeout".to_string()));
        }
        Ok(self.history.lock().unwrap().clone())
    }

    fn listen(
        &self,
        _user_id: &str,
        _external_channel_id: &str,
        _sender: InboundSender,
    ) -> Result<Box<dyn ListenerHandle>, ConnectorError> {
        self.active_listeners.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeListener(self.active_listeners.clone())))
    }
}

pub fn chat_message(id: &str, content: &str, hours_ago: i64) -> ChatMessage {
    ChatMessage {
        external_message_id: id.to_string(),
        author: "sam".to_string(),
        content: content.to_string(),
        sent_at: Utc::now() - ChronoDuration::hours(hours_ago),
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub store: AssistantStore,
    pub vault: Arc<SqliteCredentialVault>,
    pub analyzer: Arc<CountingAnalyzer>,
    pub mail: Arc<FakeMail>,
    pub calendar: Arc<FakeCalendar>,
    pub chat: Arc<FakeChatSource>,
    pub registry: Arc<ConnectorRegistry>,
    pub sender: InboundSender,
    pub orchestrator: Arc<WorkerOrchestrator>,
}

impl Harness {
    pub fn new(analyzer_configured: bool) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let store = AssistantStore::new(temp.path().join("assistant.db")).expect("store");
        let vault = Arc::new(SqliteCredentialVault::new(temp.path().join("vault.db")).expect("vault"));
        let analyzer = Arc::new(CountingAnalyzer::new(analyzer_configured));
        let mail = Arc::new(FakeMail::default());
        let calendar = Arc::new(FakeCalendar::default());
        let chat = Arc::new(FakeChatSource::default());
        let (sender, receiver) = inbound_queue(64);
        let registry = Arc::new(ConnectorRegistry::new(sender.clone()).with_source(chat.clone()));

        let config = OrchestratorConfig {
            gmail_poll_interval: Duration::from_secs(1),
            gcal_poll_interval: Duration::from_secs(1),
            db_path: temp.path().join("assistant.db"),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Arc::new(WorkerOrchestrator::new(OrchestratorDeps {
            config,
            store: store.clone(),
            vault: vault.clone(),
            clients: Arc::new(FakeClients {
                mail: mail.clone(),
                calendar: calendar.clone(),
            }),
            connectors: registry.clone(),
            analyzers: Analyzers::new(Some(analyzer.clone()), None),
            inbound: Some(receiver),
        }));

        Self {
            temp,
            store,
            vault,
            analyzer,
            mail,
            calendar,
            chat,
            registry,
            sender,
            orchestrator,
        }
    }

    pub fn grant(&self, user_id: &str, scopes: &[&str]) {
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
            .expect("grant scopes");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
