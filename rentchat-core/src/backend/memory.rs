use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{MessageHandler, MessagingBackend, Subscription, SubscriptionEvent};
use crate::error::BackendError;
use crate::models::{Conversation, Message, NewConversation, OutgoingMessage};
use crate::utils::compose_conversation_id;

/// Maximum stored messages per conversation; the oldest are dropped beyond it
const MAX_HISTORY_PER_CONVERSATION: usize = 1000;

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    history: HashMap<String, Vec<Message>>,
    /// conversation_id -> (subscription id, handler)
    subscribers: HashMap<String, Vec<(u64, MessageHandler)>>,
}

/// Backend that keeps everything in process memory.
///
/// Confirmed messages are pushed synchronously to every subscriber of the
/// conversation, the sender's own subscriptions included. Sends and fetches can
/// be made to fail. Sends, and fetches or subscribes of one conversation, can
/// be held in flight until released.
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
    next_message_id: AtomicU64,
    next_subscription_id: AtomicU64,
    fail_sends: AtomicBool,
    fail_fetches: AtomicBool,
    hold: watch::Sender<bool>,
    send_attempts: AtomicUsize,
    fetch_gate: Gate,
    subscribe_gate: Gate,
    fetch_attempts: AtomicUsize,
    subscribe_attempts: AtomicUsize,
}

/// Conversations whose requests are parked until released.
struct Gate(watch::Sender<HashSet<String>>);

impl Gate {
    fn new() -> Self {
        let (tx, _) = watch::channel(HashSet::new());
        Self(tx)
    }

    fn hold(&self, conversation_id: &str) {
        self.0.send_modify(|held| {
            held.insert(conversation_id.to_string());
        });
    }

    fn release(&self, conversation_id: &str) {
        self.0.send_modify(|held| {
            held.remove(conversation_id);
        });
    }

    async fn pass(&self, conversation_id: &str) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|held| !held.contains(conversation_id)).await;
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_message_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            fail_sends: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            hold,
            send_attempts: AtomicUsize::new(0),
            fetch_gate: Gate::new(),
            subscribe_gate: Gate::new(),
            fetch_attempts: AtomicUsize::new(0),
            subscribe_attempts: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number the next confirmed message `srv-<id>`.
    pub fn set_next_message_id(&self, id: u64) {
        self.next_message_id.store(id, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Park every send until `release_sends` is called.
    pub fn hold_sends(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_sends(&self) {
        self.hold.send_replace(false);
    }

    /// How many sends have reached the backend, including held and failed ones.
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Park history fetches of `conversation_id` until `release_fetches`.
    pub fn hold_fetches(&self, conversation_id: &str) {
        self.fetch_gate.hold(conversation_id);
    }

    pub fn release_fetches(&self, conversation_id: &str) {
        self.fetch_gate.release(conversation_id);
    }

    /// Park subscribes to `conversation_id` until `release_subscribes`.
    pub fn hold_subscribes(&self, conversation_id: &str) {
        self.subscribe_gate.hold(conversation_id);
    }

    pub fn release_subscribes(&self, conversation_id: &str) {
        self.subscribe_gate.release(conversation_id);
    }

    pub fn fetch_attempts(&self) -> usize {
        self.fetch_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(conversation_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn history(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .history
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock().conversations.get(conversation_id).cloned()
    }

    /// Store a message written elsewhere (another participant or device) and push it.
    pub fn deliver(&self, message: Message) {
        self.store_and_publish(message);
    }

    /// Report a transport failure to every subscriber of `conversation_id`.
    pub fn break_subscriptions(&self, conversation_id: &str, reason: &str) {
        let handlers = self.handlers_for(conversation_id);
        for handler in handlers {
            handler(SubscriptionEvent::TransportError(reason.to_string()));
        }
    }

    fn handlers_for(&self, conversation_id: &str) -> Vec<MessageHandler> {
        self.lock()
            .subscribers
            .get(conversation_id)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn store_and_publish(&self, message: Message) {
        {
            let mut inner = self.lock();
            let history = inner
                .history
                .entry(message.conversation_id.clone())
                .or_default();
            if history.len() >= MAX_HISTORY_PER_CONVERSATION {
                history.remove(0);
            }
            history.push(message.clone());

            if let Some(conversation) = inner.conversations.get_mut(&message.conversation_id) {
                conversation.record_message(&message);
            }
        }

        // Handlers run without the lock held
        for handler in self.handlers_for(&message.conversation_id) {
            handler(SubscriptionEvent::Message(message.clone()));
        }
    }

    async fn wait_until_released(&self) {
        let mut rx = self.hold.subscribe();
        // Sender lives as long as self, so this only errors on teardown
        let _ = rx.wait_for(|held| !*held).await;
    }
}

impl MessagingBackend for InMemoryBackend {
    fn fetch_messages(
        &self,
        conversation_id: String,
    ) -> BoxFuture<'_, Result<Vec<Message>, BackendError>> {
        Box::pin(async move {
            self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
            self.fetch_gate.pass(&conversation_id).await;
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("fetch failed".to_string()));
            }
            Ok(self.history(&conversation_id))
        })
    }

    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<Message, BackendError>> {
        Box::pin(async move {
            self.send_attempts.fetch_add(1, Ordering::SeqCst);
            self.wait_until_released().await;

            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(BackendError::Rejected("send rejected".to_string()));
            }

            let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
            let confirmed = Message {
                id: format!("srv-{}", id),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                created_at: Utc::now(),
                read: false,
            };
            debug!(id = %confirmed.id, conversation_id = %confirmed.conversation_id, "Stored message");
            self.store_and_publish(confirmed.clone());
            Ok(confirmed)
        })
    }

    fn subscribe(
        &self,
        conversation_id: String,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<Subscription, BackendError>> {
        Box::pin(async move {
            self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
            self.subscribe_gate.pass(&conversation_id).await;
            let sub_id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
            self.lock()
                .subscribers
                .entry(conversation_id.clone())
                .or_default()
                .push((sub_id, handler));

            let inner = Arc::downgrade(&self.inner);
            let key = conversation_id.clone();
            Ok(Subscription::new(conversation_id, move || {
                if let Some(inner) = inner.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(subs) = inner.subscribers.get_mut(&key) {
                        subs.retain(|(id, _)| *id != sub_id);
                        if subs.is_empty() {
                            inner.subscribers.remove(&key);
                        }
                    }
                }
            }))
        })
    }

    fn fetch_conversations(
        &self,
        user_id: String,
    ) -> BoxFuture<'_, Result<Vec<Conversation>, BackendError>> {
        Box::pin(async move {
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("fetch failed".to_string()));
            }
            let mut conversations: Vec<Conversation> = self
                .lock()
                .conversations
                .values()
                .filter(|c| c.is_participant(&user_id))
                .cloned()
                .collect();
            // Most recent activity first, never-used conversations last
            conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
            Ok(conversations)
        })
    }

    fn start_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, Result<Conversation, BackendError>> {
        Box::pin(async move {
            let id = compose_conversation_id(
                &request.listing_id,
                &request.tenant_id,
                &request.landlord_id,
            )
            .map_err(|e| BackendError::Rejected(e.to_string()))?;

            let mut inner = self.lock();
            let conversation = inner.conversations.entry(id.clone()).or_insert_with(|| {
                info!(conversation_id = %id, "Created conversation");
                Conversation::new(
                    &id,
                    &request.listing_id,
                    &request.tenant_id,
                    &request.landlord_id,
                    &request.subject,
                )
            });
            Ok(conversation.clone())
        })
    }

    fn mark_read(
        &self,
        conversation_id: String,
        user_id: String,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(conversation) = inner.conversations.get_mut(&conversation_id) {
                conversation.mark_read(&user_id);
            }
            if let Some(history) = inner.history.get_mut(&conversation_id) {
                for message in history.iter_mut().filter(|m| m.sender_id != user_id) {
                    message.read = true;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn outgoing(conversation_id: &str, sender_id: &str, content: &str) -> OutgoingMessage {
        OutgoingMessage {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
        }
    }

    fn recorder() -> (MessageHandler, Arc<StdMutex<Vec<SubscriptionEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let handler: MessageHandler = Arc::new(move |event: SubscriptionEvent| {
            sink.lock().unwrap().push(event)
        });
        (handler, events)
    }

    #[tokio::test]
    async fn test_send_assigns_server_ids() {
        let backend = InMemoryBackend::new();
        backend.set_next_message_id(42);

        let first = backend.send_message(outgoing("conv1", "user1", "Hello")).await.unwrap();
        let second = backend.send_message(outgoing("conv1", "user2", "Hi")).await.unwrap();

        assert_eq!(first.id, "srv-42");
        assert_eq!(second.id, "srv-43");
        assert_eq!(backend.history("conv1").len(), 2);
    }

    #[tokio::test]
    async fn test_send_pushes_to_subscribers() {
        let backend = InMemoryBackend::new();
        let (handler, events) = recorder();
        let _sub = backend.subscribe("conv1".to_string(), handler).await.unwrap();

        let sent = backend.send_message(outgoing("conv1", "user1", "Hello")).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), &[SubscriptionEvent::Message(sent)]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let backend = InMemoryBackend::new();
        let (handler, events) = recorder();
        let sub = backend.subscribe("conv1".to_string(), handler).await.unwrap();
        assert_eq!(backend.subscriber_count("conv1"), 1);

        sub.unsubscribe();
        assert_eq!(backend.subscriber_count("conv1"), 0);

        backend.send_message(outgoing("conv1", "user1", "Hello")).await.unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_can_be_injected() {
        let backend = InMemoryBackend::new();
        backend.fail_sends(true);
        let err = backend.send_message(outgoing("conv1", "user1", "Hello")).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert!(backend.history("conv1").is_empty());

        backend.fail_fetches(true);
        assert!(backend.fetch_messages("conv1".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_held_fetch_waits_for_release() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.hold_fetches("conv1");

        let task = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.fetch_messages("conv1".to_string()).await })
        };
        while backend.fetch_attempts() == 0 {
            tokio::task::yield_now().await;
        }

        // Other conversations are not held
        assert!(backend.fetch_messages("conv2".to_string()).await.is_ok());
        assert!(!task.is_finished());

        backend.release_fetches("conv1");
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_start_conversation_is_idempotent() {
        let backend = InMemoryBackend::new();
        let request = NewConversation {
            listing_id: "listing1".to_string(),
            tenant_id: "tenant1".to_string(),
            landlord_id: "landlord1".to_string(),
            subject: "Kilimani Apartment".to_string(),
        };

        let first = backend.start_conversation(request.clone()).await.unwrap();
        backend
            .send_message(outgoing(&first.id, "tenant1", "Is it available?"))
            .await
            .unwrap();
        let again = backend.start_conversation(request).await.unwrap();

        assert_eq!(first.id, "listing1:tenant1:landlord1");
        assert_eq!(again.last_message.as_deref(), Some("Is it available?"));
        assert_eq!(again.unread_for("landlord1"), 1);
    }

    #[tokio::test]
    async fn test_conversations_filtered_by_participant() {
        let backend = InMemoryBackend::new();
        for (listing, tenant) in [("l1", "t1"), ("l2", "t2")] {
            backend
                .start_conversation(NewConversation {
                    listing_id: listing.to_string(),
                    tenant_id: tenant.to_string(),
                    landlord_id: "ll".to_string(),
                    subject: "Room".to_string(),
                })
                .await
                .unwrap();
        }

        assert_eq!(backend.fetch_conversations("t1".to_string()).await.unwrap().len(), 1);
        assert_eq!(backend.fetch_conversations("ll".to_string()).await.unwrap().len(), 2);
        assert!(backend.fetch_conversations("x".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_clears_counter() {
        let backend = InMemoryBackend::new();
        let conv = backend
            .start_conversation(NewConversation {
                listing_id: "l1".to_string(),
                tenant_id: "t1".to_string(),
                landlord_id: "ll1".to_string(),
                subject: "Room".to_string(),
            })
            .await
            .unwrap();
        backend.send_message(outgoing(&conv.id, "t1", "Hi")).await.unwrap();
        assert_eq!(backend.conversation(&conv.id).unwrap().unread_for("ll1"), 1);

        backend.mark_read(conv.id.clone(), "ll1".to_string()).await.unwrap();
        assert_eq!(backend.conversation(&conv.id).unwrap().unread_for("ll1"), 0);
        assert!(backend.history(&conv.id)[0].read);
    }
}
