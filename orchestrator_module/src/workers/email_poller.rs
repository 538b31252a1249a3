use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backfill::BackfillReport;
use crate::mail_client::{MailClient, MailQuery};
use crate::pipeline::{AnalysisPipeline, PipelineOutcome};
use crate::store::EmailSourceRecord;

use super::{WorkerError, WorkerHandle};

/// Polls one user's mailbox and feeds new mail through the analysis pipeline.
pub struct EmailPoller {
    user_id: String,
    client: Arc<dyn MailClient>,
    pipeline: AnalysisPipeline,
    max_items: usize,
    cursor: Mutex<DateTime<Utc>>,
    polls: AtomicU64,
}

impl EmailPoller {
    /// Only mail received after construction is polled; older mail arrives
    /// through backfill.
    pub fn new(
        user_id: impl Into<String>,
        client: Arc<dyn MailClient>,
        pipeline: AnalysisPipeline,
        max_items: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            client,
            pipeline,
            max_items: max_items.max(1),
            cursor: Mutex::new(Utc::now()),
            polls: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Number of completed mailbox fetches.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Fetch and analyze mail newer than the cursor. Returns the number of
    /// emails that produced a proposal.
    pub fn poll_once(&self) -> Result<usize, WorkerError> {
        if !self.pipeline.analyzers().is_configured() {
            debug!("no analyzer configured; skipping mail poll for user {}", self.user_id);
            return Ok(0);
        }

        let since = *self.cursor.lock().unwrap_or_else(|poison| poison.into_inner());
        let emails = self.client.list_messages(&MailQuery {
            since,
            max_items: self.max_items,
            address: None,
        })?;
        self.polls.fetch_add(1, Ordering::SeqCst);

        let mut proposals = 0;
        for email in emails {
            let outcome = self.pipeline.process_email(&self.user_id, &email)?;
            if matches!(outcome, PipelineOutcome::Proposed(_)) {
                proposals += 1;
            }
            // Advance only past emails handled successfully.
            let mut cursor = self.cursor.lock().unwrap_or_else(|poison| poison.into_inner());
            if email.received_at > *cursor {
                *cursor = email.received_at;
            }
        }
        Ok(proposals)
    }

    /// Replay mail delivered to `source` within the trailing `window`.
    pub fn backfill(
        &self,
        source: &EmailSourceRecord,
        window: ChronoDuration,
        max_items: usize,
    ) -> BackfillReport {
        if !self.pipeline.analyzers().is_configured() {
            return BackfillReport::skipped();
        }

        let query = MailQuery {
            since: Utc::now() - window,
            max_items,
            address: Some(source.address.clone()),
        };
        let emails = match self.client.list_messages(&query) {
            Ok(emails) => emails,
            Err(err) => {
                warn!(
                    "email backfill fetch failed for source {} of user {}: {}",
                    source.id, self.user_id, err
                );
                return BackfillReport::failed(0, err.to_string());
            }
        };

        let mut processed = 0;
        for email in emails {
            match self.pipeline.process_email(&self.user_id, &email) {
                Ok(PipelineOutcome::Duplicate) => {}
                Ok(_) => processed += 1,
                Err(err) => {
                    error!(
                        "email backfill failed on {} for user {}: {}",
                        email.message_id, self.user_id, err
                    );
                    return BackfillReport::failed(processed, err.to_string());
                }
            }
        }
        info!(
            "email backfill of {} for user {} analyzed {} emails",
            source.address, self.user_id, processed
        );
        BackfillReport::completed(processed)
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Result<WorkerHandle, WorkerError> {
        let poller = Arc::clone(self);
        WorkerHandle::spawn(
            format!("email-poller-{}", self.user_id),
            interval,
            move || match poller.poll_once() {
                Ok(count) if count > 0 => {
                    info!("mail poll for user {} proposed {} items", poller.user_id, count)
                }
                Ok(_) => {}
                Err(err) => error!("mail poll error for user {}: {}", poller.user_id, err),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzerError, Analyzers, MessageAnalyzer, Proposal};
    use crate::inbound::ChatMessage;
    use crate::mail_client::{EmailMessage, MailError};
    use crate::store::{AssistantStore, BackfillStatus, CalendarItem};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct StaticMail {
        emails: Vec<EmailMessage>,
        queries: Mutex<Vec<MailQuery>>,
        fail: bool,
    }

    impl MailClient for StaticMail {
        fn list_messages(&self, query: &MailQuery) -> Result<Vec<EmailMessage>, MailError> {
            self.queries.lock().unwrap().push(query.clone());
            if self.fail {
                return Err(MailError::Request("connection reset".to_string()));
            }
            Ok(self.emails.clone())
        }
    }

    #[derive(Default)]
    struct CountingAnalyzer {
        calls: AtomicUsize,
    }

    impl MessageAnalyzer for CountingAnalyzer {
        fn is_configured(&self) -> bool {
            true
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn email(id: &str, minutes_ago: i64) -> EmailMessage {
        EmailMessage {
            message_id: id.to_string(),
            thread_id: None,
            from: Some("carol@example.com".to_string()),
            to: Some("me@example.com".to_string()),
            subject: Some("Sync".to_string()),
            body: "can we talk thursday?".to_string(),
            received_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    fn poller(
        temp: &TempDir,
        mail: StaticMail,
        analyzers: Analyzers,
    ) -> (AssistantStore, Arc<StaticMail>, EmailPoller) {
        let store = AssistantStore::new(temp.path().join("assistant.db")).expect("store");
        let mail = Arc::new(mail);
        let pipeline = AnalysisPipeline::new(store.clone(), analyzers, 20);
        let poller = EmailPoller::new("user-1", mail.clone(), pipeline, 10);
        (store, mail, poller)
    }

    #[test]
    fn poll_skips_without_analyzer() {
        let temp = TempDir::new().expect("tempdir");
        let (_store, mail, poller) = poller(
            &temp,
            StaticMail {
                emails: vec![email("e1", 1)],
                queries: Mutex::new(Vec::new()),
                fail: false,
            },
            Analyzers::none(),
        );
        assert_eq!(poller.poll_once().unwrap(), 0);
        assert!(mail.queries.lock().unwrap().is_empty());
    }

    #[test]
    fn backfill_counts_new_emails_and_is_idempotent() {
        let temp = TempDir::new().expect("tempdir");
        let analyzer = Arc::new(CountingAnalyzer::default());
        let (store, mail, poller) = poller(
            &temp,
            StaticMail {
                emails: vec![email("e1", 60), email("e2", 30)],
                queries: Mutex::new(Vec::new()),
                fail: false,
            },
            Analyzers::new(Some(analyzer.clone()), None),
        );
        let source = store.attach_email_source("user-1", "Me@Example.com").unwrap();

        let first = poller.backfill(&source, ChronoDuration::days(10), 200);
        assert_eq!(first.status, BackfillStatus::Completed);
        assert_eq!(first.processed, 2);
        let second = poller.backfill(&source, ChronoDuration::days(10), 200);
        assert_eq!(second.processed, 0);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);

        let queries = mail.queries.lock().unwrap();
        assert_eq!(queries[0].address.as_deref(), Some("me@example.com"));
        assert_eq!(queries[0].max_items, 200);
    }

    #[test]
    fn backfill_fetch_failure_is_reported() {
        let temp = TempDir::new().expect("tempdir");
        let (store, _mail, poller) = poller(
            &temp,
            StaticMail {
                emails: Vec::new(),
                queries: Mutex::new(Vec::new()),
                fail: true,
            },
            Analyzers::new(Some(Arc::new(CountingAnalyzer::default())), None),
        );
        let source = store.attach_email_source("user-1", "me@example.com").unwrap();
        let report = poller.backfill(&source, ChronoDuration::days(10), 200);
        assert_eq!(report.status, BackfillStatus::Failed);
        assert!(report.error.unwrap_or_default().contains("connection reset"));
    }
}
