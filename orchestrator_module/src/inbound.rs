//! Live chat traffic and the shared inbound queue every listener feeds.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One chat message, as fetched from history or received live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub external_message_id: String,
    pub author: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// A live message pushed by a connector listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub platform: String,
    pub external_channel_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum InboundQueueError {
    #[error("inbound queue is full")]
    Full,
    #[error("inbound queue is closed")]
    Closed,
}

/// Producer side of the shared queue; cloned into every listener.
#[derive(Debug, Clone)]
pub struct InboundSender {
    sender: Sender<InboundMessage>,
}

impl InboundSender {
    /// Enqueue without blocking the listener; a full queue drops the message.
    pub fn push(&self, message: InboundMessage) -> Result<(), InboundQueueError> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                warn!(
                    "inbound queue full; dropping message {} for user {}",
                    message.message.external_message_id, message.user_id
                );
                Err(InboundQueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(InboundQueueError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Create the shared queue. The receiver must have exactly one owner: the
/// orchestrator hands it to the global processor.
pub fn inbound_queue(capacity: usize) -> (InboundSender, Receiver<InboundMessage>) {
    let (sender, receiver) = bounded(capacity.max(1));
    (InboundSender { sender }, receiver)
}
