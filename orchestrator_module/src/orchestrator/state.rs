use std::collections::HashMap;
use std::sync::Arc;

use crate::processor::GlobalProcessor;
use crate::workers::{CalendarPoller, EmailPoller, WorkerHandle};

pub(super) struct EmailWorker {
    pub(super) poller: Arc<EmailPoller>,
    pub(super) handle: WorkerHandle,
}

pub(super) struct CalendarWorker {
    pub(super) poller: Arc<CalendarPoller>,
    pub(super) handle: WorkerHandle,
}

/// Background workers of one user.
#[derive(Default)]
pub(super) struct TenantWorkerSet {
    pub(super) email: Option<EmailWorker>,
    pub(super) calendar: Option<CalendarWorker>,
    pub(super) running: bool,
}

impl TenantWorkerSet {
    pub(super) fn is_empty(&self) -> bool {
        self.email.is_none() && self.calendar.is_none()
    }

    /// Join both sub-workers. Call without holding the orchestrator lock.
    pub(super) fn stop(mut self) {
        if let Some(worker) = self.email.take() {
            worker.handle.stop();
        }
        if let Some(worker) = self.calendar.take() {
            worker.handle.stop();
        }
    }
}

/// Everything guarded by the orchestrator's lock.
#[derive(Default)]
pub(super) struct OrchestratorState {
    pub(super) tenants: HashMap<String, TenantWorkerSet>,
    pub(super) processor: Option<GlobalProcessor>,
}
