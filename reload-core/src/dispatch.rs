//! Message dispatcher: typed subscription bus for locally delivered messages.
//!
//! Built once at start-up, filled with subscriptions, then shared behind an `Arc`. Every
//! published message reaches every handler subscribed to its content type; there is no
//! deduplication here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{ContentType, Message};

/// Receives messages published for the content types it subscribed to. Called synchronously
/// from the forwarding worker, so it must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

/// Forwards messages into a channel owned by a service task.
impl MessageHandler for mpsc::UnboundedSender<Message> {
    fn handle(&self, message: &Message) {
        if self.send(message.clone()).is_err() {
            debug!(content_type = %message.content_type(), "subscriber channel closed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: u64,
    pub delivered: u64,
    pub dead: u64,
}

#[derive(Default)]
pub struct Dispatcher {
    subscribers: HashMap<ContentType, Vec<Arc<dyn MessageHandler>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dead: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages of `content_type`.
    pub fn subscribe<H>(&mut self, content_type: ContentType, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_shared(content_type, Arc::new(handler));
    }

    /// Register one handler instance for several content types.
    pub fn subscribe_shared(
        &mut self,
        content_type: ContentType,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.subscribers.entry(content_type).or_default().push(handler);
    }

    pub fn subscriber_count(&self, content_type: ContentType) -> usize {
        self.subscribers.get(&content_type).map_or(0, Vec::len)
    }

    /// Hand `message` to every subscriber of its content type. Returns how many handlers saw
    /// it; zero means the message was dead and has been logged.
    pub fn publish(&self, message: &Message) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let content_type = message.content_type();
        let Some(handlers) = self.subscribers.get(&content_type).filter(|h| !h.is_empty()) else {
            self.dead.fetch_add(1, Ordering::Relaxed);
            debug!(
                %content_type,
                transaction_id = message.transaction_id(),
                "no subscriber for message"
            );
            return 0;
        };
        for handler in handlers {
            handler.handle(message);
        }
        self.delivered.fetch_add(handlers.len() as u64, Ordering::Relaxed);
        trace!(%content_type, handlers = handlers.len(), "published");
        handlers.len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.subscribers.keys().map(|c| c.0).collect();
        types.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("content_types", &types)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::config::OverlayConfig;
    use crate::message::{Content, PingRequest};

    fn ping() -> Message {
        Message::request(
            &OverlayConfig::default(),
            vec![],
            Content::PingRequest(PingRequest::default()),
        )
    }

    #[test]
    fn every_subscriber_sees_the_message() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        for _ in 0..3 {
            let hits = hits.clone();
            dispatcher.subscribe(ContentType::PING_REQ, move |_: &Message| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(dispatcher.subscriber_count(ContentType::PING_REQ), 3);
        assert_eq!(dispatcher.publish(&ping()), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn no_dedup_at_this_layer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        let counter = hits.clone();
        dispatcher.subscribe(ContentType::PING_REQ, move |_: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let msg = ping();
        dispatcher.publish(&msg);
        dispatcher.publish(&msg);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dead_message_is_counted_not_failed() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe(ContentType::STORE_REQ, |_: &Message| {});
        assert_eq!(dispatcher.publish(&ping()), 0);
        let stats = dispatcher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_a_copy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe(ContentType::PING_REQ, tx);
        let msg = ping();
        dispatcher.publish(&msg);
        assert_eq!(rx.recv().await, Some(msg));
    }
}
