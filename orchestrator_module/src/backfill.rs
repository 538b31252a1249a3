//! Historical backfill of newly attached or re-enabled sources.
//!
//! Each run happens on its own detached thread and records its outcome in
//! the source's backfill columns. A panic inside a run is caught and
//! recorded as `failed`. At most one run per source is active at a time
//! across clones of a coordinator.

use chrono::Utc;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::orchestrator::WorkerOrchestrator;
use crate::pipeline::PipelineOutcome;
use crate::store::{BackfillStatus, ChannelRecord, EmailSourceRecord, StoreError};

/// Result of one backfill pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub status: BackfillStatus,
    /// Items fed to analysis in this pass.
    pub processed: u32,
    pub error: Option<String>,
}

impl BackfillReport {
    pub fn skipped() -> Self {
        Self {
            status: BackfillStatus::Skipped,
            processed: 0,
            error: None,
        }
    }

    pub fn completed(processed: u32) -> Self {
        Self {
            status: BackfillStatus::Completed,
            processed,
            error: None,
        }
    }

    pub fn failed(processed: u32, error: impl Into<String>) -> Self {
        Self {
            status: BackfillStatus::Failed,
            processed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn backfill thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("backfill already running for {0}")]
    AlreadyRunning(String),
}

/// Join handle of a detached backfill run. Dropping it detaches the run.
#[derive(Debug)]
pub struct BackfillHandle {
    join: JoinHandle<BackfillReport>,
}

impl BackfillHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run and return the report it persisted.
    pub fn join(self) -> BackfillReport {
        self.join
            .join()
            .unwrap_or_else(|panic| BackfillReport::failed(0, panic_message(panic.as_ref())))
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Claim on a source key, released when the run's thread finishes.
struct RunSlot {
    in_flight: InFlight,
    key: String,
}

impl RunSlot {
    fn claim(in_flight: &InFlight, key: String) -> Result<Self, BackfillError> {
        let mut active = in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if !active.insert(key.clone()) {
            return Err(BackfillError::AlreadyRunning(key));
        }
        Ok(Self {
            in_flight: Arc::clone(in_flight),
            key,
        })
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&self.key);
    }
}

#[derive(Clone)]
pub struct BackfillCoordinator {
    orchestrator: Arc<WorkerOrchestrator>,
    in_flight: InFlight,
}

impl BackfillCoordinator {
    pub fn new(orchestrator: Arc<WorkerOrchestrator>) -> Self {
        Self {
            orchestrator,
            in_flight: InFlight::default(),
        }
    }

    /// Whether a run for the channel is still active.
    pub fn is_channel_backfill_running(&self, channel_id: &str) -> bool {
        self.is_running(&channel_key(channel_id))
    }

    pub fn is_email_source_backfill_running(&self, source_id: &str) -> bool {
        self.is_running(&email_source_key(source_id))
    }

    fn is_running(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .contains(key)
    }

    /// Attach (or re-enable) a chat channel and backfill it.
    pub fn channel_attached(
        &self,
        user_id: &str,
        platform: &str,
        external_channel_id: &str,
        name: Option<&str>,
    ) -> Result<(ChannelRecord, BackfillHandle), BackfillError> {
        let channel = self.orchestrator.store().attach_channel(
            user_id,
            platform,
            external_channel_id,
            name,
        )?;
        let handle = self.start_channel_backfill(user_id, &channel.id)?;
        Ok((channel, handle))
    }

    /// Re-enable a disabled channel. History ingested earlier is kept and a
    /// fresh pass only adds messages not yet stored.
    pub fn channel_reenabled(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<BackfillHandle, BackfillError> {
        self.orchestrator
            .store()
            .set_channel_enabled(channel_id, true)?;
        self.start_channel_backfill(user_id, channel_id)
    }

    /// Attach (or re-enable) an email source and backfill it.
    pub fn email_source_attached(
        &self,
        user_id: &str,
        address: &str,
    ) -> Result<(EmailSourceRecord, BackfillHandle), BackfillError> {
        let source = self
            .orchestrator
            .store()
            .attach_email_source(user_id, address)?;
        let handle = self.start_email_source_backfill(user_id, &source.id)?;
        Ok((source, handle))
    }

    /// Fails with `AlreadyRunning` while an earlier run for the channel is active.
    pub fn start_channel_backfill(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<BackfillHandle, BackfillError> {
        let slot = RunSlot::claim(&self.in_flight, channel_key(channel_id))?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let user_id = user_id.to_string();
        let channel_id = channel_id.to_string();
        let join = thread::Builder::new()
            .name(format!("channel-backfill-{}", channel_id))
            .spawn(move || {
                let _slot = slot;
                let report = guarded(|| run_channel_backfill(&orchestrator, &user_id, &channel_id));
                if let Err(err) = orchestrator.store().set_channel_backfill_status(
                    &channel_id,
                    report.status,
                    report.processed,
                    report.error.as_deref(),
                ) {
                    error!("failed to record backfill status for channel {}: {}", channel_id, err);
                }
                log_report("channel", &channel_id, &user_id, &report);
                report
            })?;
        Ok(BackfillHandle { join })
    }

    pub fn start_email_source_backfill(
        &self,
        user_id: &str,
        source_id: &str,
    ) -> Result<BackfillHandle, BackfillError> {
        let slot = RunSlot::claim(&self.in_flight, email_source_key(source_id))?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let user_id = user_id.to_string();
        let source_id = source_id.to_string();
        let join = thread::Builder::new()
            .name(format!("email-backfill-{}", source_id))
            .spawn(move || {
                let _slot = slot;
                let report =
                    guarded(|| run_email_source_backfill(&orchestrator, &user_id, &source_id));
                if let Err(err) = orchestrator.store().set_email_source_backfill_status(
                    &source_id,
                    report.status,
                    report.processed,
                    report.error.as_deref(),
                ) {
                    error!("failed to record backfill status for source {}: {}", source_id, err);
                }
                log_report("email source", &source_id, &user_id, &report);
                report
            })?;
        Ok(BackfillHandle { join })
    }
}

fn channel_key(channel_id: &str) -> String {
    format!("channel {}", channel_id)
}

fn email_source_key(source_id: &str) -> String {
    format!("email source {}", source_id)
}

fn run_channel_backfill(
    orchestrator: &WorkerOrchestrator,
    user_id: &str,
    channel_id: &str,
) -> Result<BackfillReport, StoreError> {
    let store = orchestrator.store();
    let pipeline = orchestrator.pipeline();
    if !pipeline.analyzers().is_configured() {
        return Ok(BackfillReport::skipped());
    }

    let channel = store.get_channel(channel_id)?;
    if channel.user_id != user_id {
        return Ok(BackfillReport::failed(
            0,
            format!("channel {} does not belong to user {}", channel_id, user_id),
        ));
    }
    if !channel.enabled {
        return Ok(BackfillReport::skipped());
    }
    store.set_channel_backfill_status(channel_id, BackfillStatus::InProgress, 0, None)?;

    let since = Utc::now() - orchestrator.config().backfill_window();
    let mut messages = match orchestrator
        .connectors()
        .fetch_channel_history(user_id, &channel, since)
    {
        Ok(messages) => messages,
        Err(err) => return Ok(BackfillReport::failed(0, err.to_string())),
    };
    messages.retain(|message| message.sent_at >= since);
    messages.sort_by_key(|message| message.sent_at);

    let mut processed = 0;
    for message in &messages {
        match pipeline.process_chat_message(&channel, message) {
            Ok(PipelineOutcome::Duplicate) => {}
            Ok(_) => processed += 1,
            Err(err) => return Ok(BackfillReport::failed(processed, err.to_string())),
        }
    }
    Ok(BackfillReport::completed(processed))
}

fn run_email_source_backfill(
    orchestrator: &WorkerOrchestrator,
    user_id: &str,
    source_id: &str,
) -> Result<BackfillReport, StoreError> {
    let store = orchestrator.store();
    if !orchestrator.pipeline().analyzers().is_configured() {
        return Ok(BackfillReport::skipped());
    }

    let source = store.get_email_source(source_id)?;
    if source.user_id != user_id {
        return Ok(BackfillReport::failed(
            0,
            format!("email source {} does not belong to user {}", source_id, user_id),
        ));
    }
    if !source.enabled {
        return Ok(BackfillReport::skipped());
    }
    store.set_email_source_backfill_status(source_id, BackfillStatus::InProgress, 0, None)?;

    orchestrator.start_services_for_user(user_id);
    let config = orchestrator.config();
    Ok(orchestrator.backfill_email_source(
        user_id,
        &source,
        config.backfill_window(),
        config.backfill_email_max_items,
    ))
}

/// Run a backfill body, turning store errors and panics into a failed report.
fn guarded<F>(run: F) -> BackfillReport
where
    F: FnOnce() -> Result<BackfillReport, StoreError>,
{
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => BackfillReport::failed(0, err.to_string()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("backfill panicked: {}", message);
            BackfillReport::failed(0, format!("panic: {}", message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_report(kind: &str, id: &str, user_id: &str, report: &BackfillReport) {
    match report.status {
        BackfillStatus::Failed => warn!(
            "{} {} backfill for user {} failed after {} items: {}",
            kind,
            id,
            user_id,
            report.processed,
            report.error.as_deref().unwrap_or("unknown error")
        ),
        status => info!(
            "{} {} backfill for user {} {} ({} items)",
            kind, id, user_id, status, report.processed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_are_recorded_as_failed() {
        let report = guarded(|| panic!("connector exploded"));
        assert_eq!(report.status, BackfillStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("panic: connector exploded"));
    }

    #[test]
    fn run_slot_is_exclusive_until_dropped() {
        let in_flight = InFlight::default();
        let slot = RunSlot::claim(&in_flight, channel_key("c1")).expect("first claim");
        assert!(matches!(
            RunSlot::claim(&in_flight, channel_key("c1")),
            Err(BackfillError::AlreadyRunning(_))
        ));
        assert!(RunSlot::claim(&in_flight, email_source_key("c1")).is_ok());

        drop(slot);
        assert!(RunSlot::claim(&in_flight, channel_key("c1")).is_ok());
    }

    #[test]
    fn store_errors_are_recorded_as_failed() {
        let report = guarded(|| Err(StoreError::NotFound("channel c1".to_string())));
        assert_eq!(report.status, BackfillStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("channel c1 not found"));
    }
}
