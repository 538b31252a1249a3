use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::calendar_client::{ExternalCalendarClient, ExternalEventStatus};
use crate::confirmation::ConfirmationService;
use crate::store::AssistantStore;

use super::{WorkerError, WorkerHandle};

/// Changes applied by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub dismissed: usize,
    pub rescheduled: usize,
}

/// Pulls external calendar changes and reconciles mirrored items.
pub struct CalendarPoller {
    user_id: String,
    client: Arc<dyn ExternalCalendarClient>,
    store: AssistantStore,
    confirmations: ConfirmationService,
    max_items: usize,
    cursor: Mutex<DateTime<Utc>>,
    polls: AtomicU64,
}

impl CalendarPoller {
    pub fn new(
        user_id: impl Into<String>,
        client: Arc<dyn ExternalCalendarClient>,
        store: AssistantStore,
        confirmations: ConfirmationService,
        max_items: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            client,
            store,
            confirmations,
            max_items: max_items.max(1),
            cursor: Mutex::new(Utc::now()),
            polls: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn poll_once(&self) -> Result<ReconcileStats, WorkerError> {
        let since = *self.cursor.lock().unwrap_or_else(|poison| poison.into_inner());
        let events = self.client.list_changed_items(since, self.max_items)?;
        self.polls.fetch_add(1, Ordering::SeqCst);

        let mut stats = ReconcileStats::default();
        let mut newest = since;
        for event in events {
            if let Some(updated) = event.updated {
                newest = newest.max(updated);
            }
            let Some(item) = self.store.find_item_by_external_id(&self.user_id, &event.id)? else {
                continue;
            };
            if item.status.is_terminal() {
                continue;
            }

            if event.status == ExternalEventStatus::Cancelled {
                match self.confirmations.dismiss_from_external(&item.id) {
                    Ok(_) => {
                        info!(
                            "dismissed item {} of user {}: external event {} was cancelled",
                            item.id, self.user_id, event.id
                        );
                        stats.dismissed += 1;
                    }
                    Err(err) => warn!("could not dismiss item {}: {}", item.id, err),
                }
                continue;
            }

            let Some(start) = event.start else {
                continue;
            };
            let title = event.title.as_deref().unwrap_or(&item.title);
            if start != item.start_time || event.end != item.end_time || title != item.title {
                self.store
                    .update_item_schedule(&item.id, title, start, event.end)?;
                stats.rescheduled += 1;
            }
        }

        *self.cursor.lock().unwrap_or_else(|poison| poison.into_inner()) = newest;
        Ok(stats)
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Result<WorkerHandle, WorkerError> {
        let poller = Arc::clone(self);
        WorkerHandle::spawn(
            format!("calendar-poller-{}", self.user_id),
            interval,
            move || match poller.poll_once() {
                Ok(stats) if stats != ReconcileStats::default() => info!(
                    "calendar reconcile for user {}: {} dismissed, {} rescheduled",
                    poller.user_id, stats.dismissed, stats.rescheduled
                ),
                Ok(_) => {}
                Err(err) => error!("calendar poll error for user {}: {}", poller.user_id, err),
            },
        )
    }
}
