//! Chat-platform connectors: live listeners feeding the inbound queue and
//! history fetches used by backfill.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::inbound::{ChatMessage, InboundSender};
use crate::store::ChannelRecord;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("no connector registered for platform {0}")]
    UnknownPlatform(String),
    #[error("connector request failed: {0}")]
    Request(String),
    #[error("connector not authorized for user {0}")]
    Unauthorized(String),
}

/// A running live listener. Stopping consumes the handle.
pub trait ListenerHandle: Send {
    fn stop(self: Box<Self>);
}

/// One chat platform (Discord, Slack, Telegram...).
pub trait ChatSource: Send + Sync {
    fn platform(&self) -> &str;

    /// Messages posted in the channel since `since`, in any order.
    fn fetch_history(
        &self,
        user_id: &str,
        external_channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ConnectorError>;

    /// Start pushing live messages of the channel into `sender`.
    fn listen(
        &self,
        user_id: &str,
        external_channel_id: &str,
        sender: InboundSender,
    ) -> Result<Box<dyn ListenerHandle>, ConnectorError>;
}

/// What the orchestrator and the backfill coordinator need from connectors.
pub trait ConnectorManager: Send + Sync {
    /// Release every per-user listener. Safe for users without listeners.
    fn cleanup_user(&self, user_id: &str);

    fn fetch_channel_history(
        &self,
        user_id: &str,
        channel: &ChannelRecord,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ConnectorError>;
}

/// Platform registry plus the live listener handles of every user.
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn ChatSource>>,
    sender: InboundSender,
    listeners: Mutex<HashMap<String, Vec<(String, Box<dyn ListenerHandle>)>>>,
}

impl ConnectorRegistry {
    pub fn new(sender: InboundSender) -> Self {
        Self {
            sources: HashMap::new(),
            sender,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ChatSource>) -> Self {
        self.sources.insert(source.platform().to_string(), source);
        self
    }

    fn source(&self, platform: &str) -> Result<&Arc<dyn ChatSource>, ConnectorError> {
        self.sources
            .get(platform)
            .ok_or_else(|| ConnectorError::UnknownPlatform(platform.to_string()))
    }

    /// Start a live listener for a channel unless one is already running.
    pub fn attach_listener(&self, channel: &ChannelRecord) -> Result<bool, ConnectorError> {
        let key = format!("{}:{}", channel.platform, channel.external_channel_id);
        {
            let listeners = self.listeners.lock().unwrap_or_else(|poison| poison.into_inner());
            let exists = listeners
                .get(&channel.user_id)
                .map(|handles| handles.iter().any(|(existing, _)| existing == &key))
                .unwrap_or(false);
            if exists {
                return Ok(false);
            }
        }

        let handle = self.source(&channel.platform)?.listen(
            &channel.user_id,
            &channel.external_channel_id,
            self.sender.clone(),
        )?;

        let mut listeners = self.listeners.lock().unwrap_or_else(|poison| poison.into_inner());
        let handles = listeners.entry(channel.user_id.clone()).or_default();
        if handles.iter().any(|(existing, _)| existing == &key) {
            // Lost a race with a concurrent attach; keep the first listener.
            drop(listeners);
            handle.stop();
            return Ok(false);
        }
        handles.push((key, handle));
        info!(
            "listening on {} channel {} for user {}",
            channel.platform, channel.external_channel_id, channel.user_id
        );
        Ok(true)
    }

    /// Stop the listener of one channel, e.g. after it was disabled.
    pub fn detach_listener(&self, channel: &ChannelRecord) -> bool {
        let key = format!("{}:{}", channel.platform, channel.external_channel_id);
        let removed = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|poison| poison.into_inner());
            let Some(handles) = listeners.get_mut(&channel.user_id) else {
                return false;
            };
            let removed = handles
                .iter()
                .position(|(existing, _)| existing == &key)
                .map(|idx| handles.remove(idx).1);
            if handles.is_empty() {
                listeners.remove(&channel.user_id);
            }
            removed
        };
        match removed {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, user_id: &str) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|poison| poison.into_inner());
        listeners.get(user_id).map(Vec::len).unwrap_or(0)
    }
}

impl ConnectorManager for ConnectorRegistry {
    fn cleanup_user(&self, user_id: &str) {
        let handles = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|poison| poison.into_inner());
            listeners.remove(user_id).unwrap_or_default()
        };
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        for (_, handle) in handles {
            handle.stop();
        }
        info!("stopped {} chat listeners for user {}", count, user_id);
    }

    fn fetch_channel_history(
        &self,
        user_id: &str,
        channel: &ChannelRecord,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ConnectorError> {
        let source = self.source(&channel.platform)?;
        let messages = source.fetch_history(user_id, &channel.external_channel_id, since)?;
        if messages.is_empty() {
            warn!(
                "no history on {} channel {} for user {}",
                channel.platform, channel.external_channel_id, user_id
            );
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::inbound_queue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle(Arc<AtomicUsize>);

    impl ListenerHandle for CountingHandle {
        fn stop(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubSource {
        stopped: Arc<AtomicUsize>,
    }

    impl ChatSource for StubSource {
        fn platform(&self) -> &str {
            "discord"
        }

        fn fetch_history(
            &self,
            _user_id: &str,
            _external_channel_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<ChatMessage>, ConnectorError> {
            Ok(Vec::new())
        }

        fn listen(
            &self,
            _user_id: &str,
            _external_channel_id: &str,
            _sender: InboundSender,
        ) -> Result<Box<dyn ListenerHandle>, ConnectorError> {
            Ok(Box::new(CountingHandle(self.stopped.clone())))
        }
    }

    fn channel(platform: &str, external: &str) -> ChannelRecord {
        ChannelRecord {
            id: format!("id-{}", external),
            user_id: "user-1".to_string(),
            platform: platform.to_string(),
            external_channel_id: external.to_string(),
            name: None,
            enabled: true,
            backfill_status: None,
            backfill_started_at: None,
            backfill_finished_at: None,
            backfill_error: None,
            backfill_processed: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn attach_is_idempotent_and_cleanup_stops_listeners() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let (sender, _receiver) = inbound_queue(8);
        let registry = ConnectorRegistry::new(sender).with_source(Arc::new(StubSource {
            stopped: stopped.clone(),
        }));

        assert!(registry.attach_listener(&channel("discord", "c1")).unwrap());
        assert!(!registry.attach_listener(&channel("discord", "c1")).unwrap());
        assert!(registry.attach_listener(&channel("discord", "c2")).unwrap());
        assert_eq!(registry.listener_count("user-1"), 2);

        registry.cleanup_user("user-1");
        assert_eq!(registry.listener_count("user-1"), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);

        registry.cleanup_user("user-1");
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_platform_is_an_error() {
        let (sender, _receiver) = inbound_queue(8);
        let registry = ConnectorRegistry::new(sender);
        let err = registry
            .fetch_channel_history("user-1", &channel("slack", "c1"), Utc::now())
            .expect_err("no slack source");
        assert!(matches!(err, ConnectorError::UnknownPlatform(_)));
    }

    #[test]
    fn detach_stops_single_listener() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let (sender, _receiver) = inbound_queue(8);
        let registry = ConnectorRegistry::new(sender).with_source(Arc::new(StubSource {
            stopped: stopped.clone(),
        }));
        registry.attach_listener(&channel("discord", "c1")).unwrap();
        assert!(registry.detach_listener(&channel("discord", "c1")));
        assert!(!registry.detach_listener(&channel("discord", "c1")));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
