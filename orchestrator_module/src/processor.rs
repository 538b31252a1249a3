//! The process-wide consumer of the shared inbound queue.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::inbound::InboundMessage;
use crate::pipeline::AnalysisPipeline;
use crate::workers::WorkerError;

/// Single consumer of live chat traffic for every tenant.
#[derive(Debug)]
pub struct GlobalProcessor {
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
}

impl GlobalProcessor {
    pub fn spawn(
        receiver: Receiver<InboundMessage>,
        pipeline: AnalysisPipeline,
    ) -> Result<Self, WorkerError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let processed = Arc::new(AtomicU64::new(0));
        let counter = processed.clone();

        let join = thread::Builder::new()
            .name("global-processor".to_string())
            .spawn(move || {
                info!("global processor started");
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(receiver) -> inbound => {
                            let Ok(inbound) = inbound else {
                                info!("inbound queue closed");
                                break;
                            };
                            match pipeline.process_inbound(&inbound) {
                                Ok(outcome) => debug!(
                                    "processed message {} for user {}: {:?}",
                                    inbound.message.external_message_id, inbound.user_id, outcome
                                ),
                                Err(err) => error!(
                                    "failed to process message {} for user {}: {}",
                                    inbound.message.external_message_id, inbound.user_id, err
                                ),
                            }
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                info!("global processor stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            join: Some(join),
            processed,
        })
    }

    /// Messages taken off the queue so far, failures included.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Stop consuming and wait for the thread. A message being analyzed
    /// finishes first; queued messages stay queued.
    pub fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("global processor panicked");
            }
        }
    }
}

impl Drop for GlobalProcessor {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
    }
}
