//! Per-user background pollers and the thread handle that owns each of them.

mod calendar_poller;
mod email_poller;

pub use calendar_poller::{CalendarPoller, ReconcileStats};
pub use email_poller::EmailPoller;

use crossbeam_channel::{after, bounded, select, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::calendar_client::CalendarError;
use crate::confirmation::TransitionError;
use crate::mail_client::MailError;
use crate::pipeline::PipelineError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("mail error: {0}")]
    Mail(#[from] MailError),
    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),
}

/// A background thread running `tick` every interval until stopped.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the loop. The first tick runs immediately.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self, WorkerError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = name.clone();
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            info!("{} started with {}s interval", thread_name, interval.as_secs());
            loop {
                tick();
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(after(interval)) -> _ => {}
                }
            }
            info!("{} stopped", thread_name);
        })?;
        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Signal the loop and wait for it to exit. A tick in progress finishes first.
    pub fn stop(mut self) {
        self.signal();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("{} panicked", self.name);
            }
        }
        debug!("{} joined", self.name);
    }

    fn signal(&mut self) {
        // Dropping the sender also wakes the loop.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.signal();
    }
}
