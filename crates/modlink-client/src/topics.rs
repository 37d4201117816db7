//! Topic subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use modlink_core::{ChannelError, ErrorSink, RemoteError};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

/// Handler invoked with each payload published on a topic.
pub type TopicHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), RemoteError>> + Send + Sync>;

/// Identifies one subscription so it can be removed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handlers per topic, in subscription order.
#[derive(Default)]
pub struct Topics {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, TopicHandler)>>>,
}

impl Topics {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `topic`.
    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.handlers
            .write()
            .entry(topic.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove one handler, or every handler of `topic` when `id` is `None`.
    pub fn unsubscribe(&self, topic: &str, id: Option<SubscriptionId>) -> bool {
        let mut handlers = self.handlers.write();
        let Some(id) = id else {
            return handlers.remove(topic).is_some();
        };
        let Some(list) = handlers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = handlers.remove(topic);
        }
        removed
    }

    /// Snapshot of the handlers of `topic`.
    pub fn handlers(&self, topic: &str) -> Vec<TopicHandler> {
        self.handlers
            .read()
            .get(topic)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl fmt::Debug for Topics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topics").field("topics", &self.topics()).finish()
    }
}

/// Run every handler with `payload`, in order. Handler failures go to the
/// sink and do not stop the remaining handlers.
pub async fn deliver(handlers: Vec<TopicHandler>, topic: &str, payload: Value, sink: &ErrorSink) {
    debug!(topic, handlers = handlers.len(), "delivering publication");
    for handler in handlers {
        if let Err(err) = handler(payload.clone()).await {
            sink.report(&ChannelError::Remote(err));
        }
    }
}
