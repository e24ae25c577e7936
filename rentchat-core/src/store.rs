use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::backend::MessagingBackend;
use crate::error::ChatError;
use crate::models::Message;

/// Ordered messages of the open conversation. Order is insertion order.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversation_id: Option<String>,
    messages: Vec<Message>,
    generation: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Bumped by every `reset` and `clear`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Replace everything with a freshly fetched history.
    pub fn reset(&mut self, conversation_id: &str, messages: Vec<Message>) {
        self.conversation_id = Some(conversation_id.to_string());
        self.messages = messages;
        self.generation += 1;
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swap the message with `old_id` for `message` in place.
    /// Returns false when `old_id` is gone (e.g. the store was reloaded meanwhile).
    pub fn replace(&mut self, old_id: &str, message: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == old_id) {
            Some(slot) => {
                *slot = message;
                true
            }
            None => {
                debug!(old_id, "replace target not found, ignoring");
                false
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        before != self.messages.len()
    }

    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
        self.generation += 1;
    }
}

/// Cloneable handle to the store shared by the coordinator and the reconciler.
/// Each call is one short critical section; the lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<Mutex<MessageStore>>);

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MessageStore> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut MessageStore) -> R) -> R {
        f(&mut self.lock())
    }

    /// Fetch the full history of `conversation_id` and replace the contents.
    /// On failure the store is left empty rather than stale.
    ///
    /// The result is applied only if the store was not reset or cleared while
    /// the fetch was in flight; otherwise it is discarded and
    /// `ChatError::Superseded` is returned.
    pub async fn load<B: MessagingBackend + ?Sized>(
        &self,
        backend: &B,
        conversation_id: &str,
    ) -> Result<usize, ChatError> {
        let started = self.lock().generation();
        let result = backend.fetch_messages(conversation_id.to_string()).await;

        let mut store = self.lock();
        if store.generation() != started || store.conversation_id() != Some(conversation_id) {
            debug!(conversation_id, "Discarding stale history load");
            return Err(ChatError::Superseded {
                conversation_id: conversation_id.to_string(),
            });
        }
        match result {
            Ok(messages) => {
                let count = messages.len();
                store.reset(conversation_id, messages);
                debug!(conversation_id, count, "Loaded messages");
                Ok(count)
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "Failed to load messages");
                store.reset(conversation_id, Vec::new());
                Err(ChatError::Fetch {
                    conversation_id: conversation_id.to_string(),
                    source: e,
                })
            }
        }
    }

    pub fn append(&self, message: Message) {
        self.lock().append(message);
    }

    pub fn replace(&self, old_id: &str, message: Message) -> bool {
        self.lock().replace(old_id, message)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages().to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id().map(String::from)
    }
}
