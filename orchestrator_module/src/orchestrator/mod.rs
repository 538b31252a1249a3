//! Worker orchestrator: the single owner of every per-user poller and of the
//! global processor.
//!
//! All registry mutations happen under one lock. Pollers are built (scope
//! check, client construction) before the lock is taken, the slot is
//! re-checked and filled under it, and threads are joined only after their
//! handles left the registry and the lock was released.

mod state;

use crossbeam_channel::Receiver;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::analyzer::Analyzers;
use crate::backfill::BackfillReport;
use crate::clients::IntegrationClients;
use crate::confirmation::ConfirmationService;
use crate::config::OrchestratorConfig;
use crate::connector::ConnectorManager;
use crate::credential_vault::{CredentialVault, VaultError};
use crate::inbound::InboundMessage;
use crate::pipeline::AnalysisPipeline;
use crate::processor::GlobalProcessor;
use crate::scopes::{CALENDAR_SCOPE, GMAIL_SCOPE, WORKER_SCOPES};
use crate::store::{AssistantStore, EmailSourceRecord};
use crate::workers::{CalendarPoller, EmailPoller};

use state::{CalendarWorker, EmailWorker, OrchestratorState, TenantWorkerSet};

/// Snapshot of the live workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub email_pollers: usize,
    pub calendar_pollers: usize,
    pub processor_running: bool,
}

/// Collaborators the orchestrator is built from.
pub struct OrchestratorDeps {
    pub config: OrchestratorConfig,
    pub store: AssistantStore,
    pub vault: Arc<dyn CredentialVault>,
    pub clients: Arc<dyn IntegrationClients>,
    pub connectors: Arc<dyn ConnectorManager>,
    pub analyzers: Analyzers,
    /// Receiving side of the shared inbound queue, if live traffic exists.
    pub inbound: Option<Receiver<InboundMessage>>,
}

pub struct WorkerOrchestrator {
    config: OrchestratorConfig,
    store: AssistantStore,
    vault: Arc<dyn CredentialVault>,
    clients: Arc<dyn IntegrationClients>,
    connectors: Arc<dyn ConnectorManager>,
    pipeline: AnalysisPipeline,
    confirmations: ConfirmationService,
    inbound: Option<Receiver<InboundMessage>>,
    state: Mutex<OrchestratorState>,
    eligible_scan_done: AtomicBool,
}

impl WorkerOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let pipeline = AnalysisPipeline::new(
            deps.store.clone(),
            deps.analyzers,
            deps.config.analysis_history_limit,
        );
        let confirmations = ConfirmationService::new(deps.store.clone(), deps.clients.clone());
        Self {
            config: deps.config,
            store: deps.store,
            vault: deps.vault,
            clients: deps.clients,
            connectors: deps.connectors,
            pipeline,
            confirmations,
            inbound: deps.inbound,
            state: Mutex::new(OrchestratorState::default()),
            eligible_scan_done: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &AssistantStore {
        &self.store
    }

    pub fn pipeline(&self) -> &AnalysisPipeline {
        &self.pipeline
    }

    pub fn confirmations(&self) -> &ConfirmationService {
        &self.confirmations
    }

    pub fn connectors(&self) -> &Arc<dyn ConnectorManager> {
        &self.connectors
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Start the shared processor once. Returns whether a processor is running.
    pub fn start_global_processor(&self) -> bool {
        let Some(receiver) = self.inbound.as_ref() else {
            debug!("no inbound queue; global processor not started");
            return false;
        };
        if !self.pipeline.analyzers().is_configured() {
            debug!("no analyzer configured; global processor not started");
            return false;
        }

        let mut state = self.lock();
        if state.processor.is_some() {
            return true;
        }
        match GlobalProcessor::spawn(receiver.clone(), self.pipeline.clone()) {
            Ok(processor) => {
                state.processor = Some(processor);
                info!("global processor started");
                true
            }
            Err(err) => {
                error!("failed to start global processor: {}", err);
                false
            }
        }
    }

    pub fn stop_global_processor(&self) {
        let processor = self.lock().processor.take();
        if let Some(processor) = processor {
            processor.stop();
            info!("global processor stopped");
        }
    }

    /// Start the pollers the user's granted scopes allow.
    ///
    /// Running pollers are left untouched; only missing ones are added.
    pub fn start_services_for_user(&self, user_id: &str) {
        let (need_email, need_calendar) = {
            let state = self.lock();
            match state.tenants.get(user_id) {
                Some(set) if set.running => (set.email.is_none(), set.calendar.is_none()),
                _ => (true, true),
            }
        };
        if !need_email && !need_calendar {
            debug!("services already running for user {}", user_id);
            return;
        }

        let email = if need_email {
            self.build_email_poller(user_id)
        } else {
            None
        };
        let calendar = if need_calendar {
            self.build_calendar_poller(user_id)
        } else {
            None
        };
        if email.is_none() && calendar.is_none() {
            debug!("no new workers to start for user {}", user_id);
            return;
        }

        let mut state = self.lock();
        let set = state
            .tenants
            .entry(user_id.to_string())
            .or_insert_with(TenantWorkerSet::default);

        if let Some(poller) = email {
            if set.email.is_none() {
                match poller.spawn(self.config.gmail_interval()) {
                    Ok(handle) => {
                        set.email = Some(EmailWorker { poller, handle });
                        info!("started email poller for user {}", user_id);
                    }
                    Err(err) => error!("failed to start email poller for user {}: {}", user_id, err),
                }
            }
        }
        if let Some(poller) = calendar {
            if set.calendar.is_none() {
                match poller.spawn(self.config.gcal_interval()) {
                    Ok(handle) => {
                        set.calendar = Some(CalendarWorker { poller, handle });
                        info!("started calendar poller for user {}", user_id);
                    }
                    Err(err) => {
                        error!("failed to start calendar poller for user {}: {}", user_id, err)
                    }
                }
            }
        }

        if set.is_empty() {
            state.tenants.remove(user_id);
        } else {
            set.running = true;
        }
    }

    fn scope_granted(&self, user_id: &str, scope: &str) -> bool {
        match self.vault.has_scope(user_id, scope) {
            Ok(granted) => granted,
            Err(err) => {
                warn!("scope check for user {} failed: {}", user_id, err);
                false
            }
        }
    }

    fn build_email_poller(&self, user_id: &str) -> Option<Arc<EmailPoller>> {
        if !self.scope_granted(user_id, GMAIL_SCOPE) {
            return None;
        }
        match self.clients.mail_client(user_id) {
            Ok(client) => Some(Arc::new(EmailPoller::new(
                user_id,
                client,
                self.pipeline.clone(),
                self.config.max_items_per_poll(),
            ))),
            Err(err) => {
                error!("failed to build mail client for user {}: {}", user_id, err);
                None
            }
        }
    }

    fn build_calendar_poller(&self, user_id: &str) -> Option<Arc<CalendarPoller>> {
        if !self.scope_granted(user_id, CALENDAR_SCOPE) {
            return None;
        }
        match self.clients.calendar_client(user_id) {
            Ok(client) => Some(Arc::new(CalendarPoller::new(
                user_id,
                client,
                self.store.clone(),
                self.confirmations.clone(),
                self.config.max_items_per_poll(),
            ))),
            Err(err) => {
                error!("failed to build calendar client for user {}: {}", user_id, err);
                None
            }
        }
    }

    /// Stop every worker of the user and release their chat listeners.
    pub fn stop_services_for_user(&self, user_id: &str) {
        let removed = self.lock().tenants.remove(user_id);
        self.connectors.cleanup_user(user_id);
        if let Some(set) = removed {
            set.stop();
            info!("stopped services for user {}", user_id);
        }
    }

    /// Returns whether an email poller was stopped.
    pub fn stop_gmail_worker_for_user(&self, user_id: &str) -> bool {
        let worker = {
            let mut state = self.lock();
            let Some(set) = state.tenants.get_mut(user_id) else {
                return false;
            };
            let worker = set.email.take();
            if set.is_empty() {
                state.tenants.remove(user_id);
            }
            worker
        };
        match worker {
            Some(worker) => {
                worker.handle.stop();
                info!("stopped email poller for user {}", user_id);
                true
            }
            None => false,
        }
    }

    /// Returns whether a calendar poller was stopped.
    pub fn stop_gcal_worker_for_user(&self, user_id: &str) -> bool {
        let worker = {
            let mut state = self.lock();
            let Some(set) = state.tenants.get_mut(user_id) else {
                return false;
            };
            let worker = set.calendar.take();
            if set.is_empty() {
                state.tenants.remove(user_id);
            }
            worker
        };
        match worker {
            Some(worker) => {
                worker.handle.stop();
                info!("stopped calendar poller for user {}", user_id);
                true
            }
            None => false,
        }
    }

    pub fn is_running_for_user(&self, user_id: &str) -> bool {
        self.lock()
            .tenants
            .get(user_id)
            .map(|set| set.running)
            .unwrap_or(false)
    }

    /// Restore workers after a restart. Runs once; later calls do nothing.
    /// Returns the number of users started.
    pub fn start_services_for_eligible_users(&self) -> usize {
        if self.eligible_scan_done.swap(true, Ordering::SeqCst) {
            info!("eligible-user scan already ran; skipping");
            return 0;
        }

        let mut users = BTreeSet::new();
        match self.store.users_with_active_chat_session() {
            Ok(found) => users.extend(found),
            Err(err) => error!("failed to list users with chat sessions: {}", err),
        }
        match self.vault.users_with_any_scope(WORKER_SCOPES) {
            Ok(found) => users.extend(found),
            Err(err) => error!("failed to list users with granted scopes: {}", err),
        }

        for user_id in &users {
            self.start_services_for_user(user_id);
        }
        info!("eligible-user scan started services for {} users", users.len());
        users.len()
    }

    /// Revoke a scope and stop the worker that depended on it.
    pub fn handle_scope_revocation(&self, user_id: &str, scope: &str) -> Result<(), VaultError> {
        self.vault.revoke_scope(user_id, scope)?;
        match scope {
            GMAIL_SCOPE => {
                self.stop_gmail_worker_for_user(user_id);
            }
            CALENDAR_SCOPE => {
                self.stop_gcal_worker_for_user(user_id);
            }
            other => debug!("revoked scope {} for user {} has no worker", other, user_id),
        }
        Ok(())
    }

    /// Run an email-source backfill on the user's email poller.
    pub fn backfill_email_source(
        &self,
        user_id: &str,
        source: &EmailSourceRecord,
        window: chrono::Duration,
        max_items: usize,
    ) -> BackfillReport {
        let poller = self
            .lock()
            .tenants
            .get(user_id)
            .and_then(|set| set.email.as_ref())
            .map(|worker| Arc::clone(&worker.poller));
        match poller {
            Some(poller) => poller.backfill(source, window, max_items),
            None => BackfillReport::failed(
                0,
                format!("no email worker running for user {}", user_id),
            ),
        }
    }

    /// The running email poller of a user.
    pub fn email_poller(&self, user_id: &str) -> Option<Arc<EmailPoller>> {
        self.lock()
            .tenants
            .get(user_id)
            .and_then(|set| set.email.as_ref())
            .map(|worker| Arc::clone(&worker.poller))
    }

    /// The running calendar poller of a user.
    pub fn calendar_poller(&self, user_id: &str) -> Option<Arc<CalendarPoller>> {
        self.lock()
            .tenants
            .get(user_id)
            .and_then(|set| set.calendar.as_ref())
            .map(|worker| Arc::clone(&worker.poller))
    }

    pub fn worker_counts(&self) -> WorkerCounts {
        let state = self.lock();
        WorkerCounts {
            email_pollers: state.tenants.values().filter(|set| set.email.is_some()).count(),
            calendar_pollers: state
                .tenants
                .values()
                .filter(|set| set.calendar.is_some())
                .count(),
            processor_running: state.processor.is_some(),
        }
    }

    /// Stop every tenant and the processor.
    pub fn shutdown(&self) {
        let (tenants, processor) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.tenants),
                state.processor.take(),
            )
        };
        for (user_id, set) in tenants {
            self.connectors.cleanup_user(&user_id);
            set.stop();
        }
        if let Some(processor) = processor {
            processor.stop();
        }
        info!("orchestrator shut down");
    }
}

#[cfg(test)]
mod tests;
