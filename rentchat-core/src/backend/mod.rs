//! Messaging backend contract and its implementations.

mod memory;
mod ws;

pub use memory::InMemoryBackend;
pub use ws::WsBackend;

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;

use crate::error::BackendError;
use crate::models::{Conversation, Message, NewConversation, OutgoingMessage};

/// Something pushed through a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Message(Message),
    TransportError(String),
}

pub type MessageHandler = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Remote side of the chat: history, sending, live updates and conversation bookkeeping.
pub trait MessagingBackend: Send + Sync {
    fn fetch_messages(
        &self,
        conversation_id: String,
    ) -> BoxFuture<'_, Result<Vec<Message>, BackendError>>;

    /// Persist a message. The returned copy carries the server id and timestamp.
    fn send_message(&self, message: OutgoingMessage)
        -> BoxFuture<'_, Result<Message, BackendError>>;

    fn subscribe(
        &self,
        conversation_id: String,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<Subscription, BackendError>>;

    fn fetch_conversations(
        &self,
        user_id: String,
    ) -> BoxFuture<'_, Result<Vec<Conversation>, BackendError>>;

    /// Returns the existing conversation unchanged if it is already open.
    fn start_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, Result<Conversation, BackendError>>;

    fn mark_read(
        &self,
        conversation_id: String,
        user_id: String,
    ) -> BoxFuture<'_, Result<(), BackendError>>;
}

type Teardown = Box<dyn FnOnce() + Send>;

/// A live listener registration. Dropping it unsubscribes.
pub struct Subscription {
    conversation_id: String,
    teardown: Mutex<Option<Teardown>>,
}

impl Subscription {
    pub fn new(conversation_id: impl Into<String>, teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Remove the listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unsubscribe_runs_teardown_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new("conv1", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        {
            let _sub = Subscription::new("conv1", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
