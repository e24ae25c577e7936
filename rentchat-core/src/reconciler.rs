use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{MessageHandler, MessagingBackend, Subscription, SubscriptionEvent};
use crate::error::ChatError;
use crate::models::Message;
use crate::store::SharedStore;

type AppendListener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Decides which pushed messages enter the store.
#[derive(Clone)]
struct Merge {
    store: SharedStore,
    local_user_id: String,
    listener: Option<AppendListener>,
}

impl Merge {
    fn accept(&self, message: Message) -> bool {
        // The local user's own messages arrive through the send path.
        // This also drops messages the same user sent from another device.
        if message.sender_id == self.local_user_id {
            debug!(id = %message.id, "Discarding pushed copy of own message");
            return false;
        }

        let appended = self.store.with(|store| {
            if store.conversation_id() != Some(message.conversation_id.as_str()) {
                return false;
            }
            if store.contains(&message.id) {
                return false;
            }
            store.append(message.clone());
            true
        });

        if !appended {
            debug!(id = %message.id, conversation_id = %message.conversation_id, "Ignoring message for another conversation or already present");
            return false;
        }
        if let Some(listener) = &self.listener {
            listener(&message);
        }
        true
    }

    fn handle(&self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Message(message) => {
                self.accept(message);
            }
            SubscriptionEvent::TransportError(reason) => {
                warn!(user_id = %self.local_user_id, %reason, "Subscription transport error");
            }
        }
    }
}

#[derive(Default)]
struct Active {
    /// Bumped by every attach and detach.
    generation: u64,
    subscription: Option<Subscription>,
}

/// Keeps exactly one live subscription, for the open conversation, and merges
/// what it delivers into the store.
pub struct SubscriptionReconciler<B: MessagingBackend + ?Sized> {
    backend: Arc<B>,
    merge: Merge,
    active: Mutex<Active>,
}

impl<B: MessagingBackend + ?Sized> SubscriptionReconciler<B> {
    pub fn new(backend: Arc<B>, store: SharedStore, local_user_id: &str) -> Self {
        Self {
            backend,
            merge: Merge {
                store,
                local_user_id: local_user_id.to_string(),
                listener: None,
            },
            active: Mutex::new(Active::default()),
        }
    }

    /// Called with every message the reconciler appends.
    pub fn on_appended(mut self, listener: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.merge.listener = Some(Arc::new(listener));
        self
    }

    fn active_lock(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_user_id(&self) -> &str {
        &self.merge.local_user_id
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.active_lock()
            .subscription
            .as_ref()
            .map(|s| s.conversation_id().to_string())
    }

    /// Merge one pushed message. Returns whether it was appended.
    pub fn on_external_message(&self, message: Message) -> bool {
        self.merge.accept(message)
    }

    /// Subscribe to `conversation_id`, tearing down any previous subscription first.
    ///
    /// If another attach or a detach happens while the subscribe is in flight,
    /// the new subscription is dropped and `ChatError::Superseded` is returned.
    pub async fn attach(&self, conversation_id: &str) -> Result<(), ChatError> {
        let generation = self.teardown();

        let merge = self.merge.clone();
        let handler: MessageHandler = Arc::new(move |event: SubscriptionEvent| merge.handle(event));
        let subscription = self
            .backend
            .subscribe(conversation_id.to_string(), handler)
            .await
            .map_err(|e| {
                warn!(conversation_id, error = %e, "Failed to subscribe");
                ChatError::Subscribe {
                    conversation_id: conversation_id.to_string(),
                    source: e,
                }
            })?;

        {
            let mut active = self.active_lock();
            if active.generation == generation {
                active.subscription = Some(subscription);
                drop(active);
                info!(conversation_id, "Subscribed to new messages");
                return Ok(());
            }
        }
        subscription.unsubscribe();
        debug!(conversation_id, "Dropping subscription overtaken by a newer attach");
        Err(ChatError::Superseded {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Drop the live subscription, if any. Idempotent.
    pub fn detach(&self) {
        self.teardown();
    }

    /// Take and unsubscribe the live subscription. Returns the new generation.
    fn teardown(&self) -> u64 {
        let (generation, previous) = {
            let mut active = self.active_lock();
            active.generation += 1;
            (active.generation, active.subscription.take())
        };
        if let Some(subscription) = previous {
            subscription.unsubscribe();
            info!(conversation_id = %subscription.conversation_id(), "Unsubscribed");
        }
        generation
    }
}

impl<B: MessagingBackend + ?Sized> Drop for SubscriptionReconciler<B> {
    fn drop(&mut self) {
        self.detach();
    }
}
