use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::backend::MessagingBackend;
use crate::coordinator::{SendCoordinator, SendOutcome};
use crate::error::ChatError;
use crate::models::input::{StartConversationInput, ValidateExt};
use crate::models::{Conversation, Message, NewConversation};
use crate::reconciler::SubscriptionReconciler;
use crate::search::ConversationIndex;
use crate::store::SharedStore;

type ConversationList = Arc<Mutex<Vec<Conversation>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `message` to the matching entry of the local conversation list.
fn record(conversations: &ConversationList, message: &Message, viewer: &str) {
    let mut conversations = lock(conversations);
    if let Some(conversation) = conversations
        .iter_mut()
        .find(|c| c.id == message.conversation_id)
    {
        conversation.record_message(message);
        // The viewer has this conversation open
        conversation.mark_read(viewer);
    }
}

/// One user's view of the chat: their conversations and the one open conversation.
pub struct ChatSession<B: MessagingBackend + ?Sized> {
    user_id: String,
    backend: Arc<B>,
    store: SharedStore,
    coordinator: SendCoordinator<B>,
    reconciler: SubscriptionReconciler<B>,
    conversations: ConversationList,
    active: Mutex<Option<String>>,
}

impl<B: MessagingBackend + ?Sized> ChatSession<B> {
    pub fn new(backend: Arc<B>, user_id: &str) -> Self {
        let store = SharedStore::new();
        let conversations: ConversationList = Arc::new(Mutex::new(Vec::new()));

        let sent_list = conversations.clone();
        let sender = user_id.to_string();
        let coordinator = SendCoordinator::new(backend.clone(), store.clone())
            .on_confirmed(move |m| record(&sent_list, m, &sender));

        let received_list = conversations.clone();
        let viewer = user_id.to_string();
        let reconciler = SubscriptionReconciler::new(backend.clone(), store.clone(), user_id)
            .on_appended(move |m| record(&received_list, m, &viewer));

        Self {
            user_id: user_id.to_string(),
            backend,
            store,
            coordinator,
            reconciler,
            conversations,
            active: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn active_conversation(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.conversations).clone()
    }

    pub fn is_sending(&self) -> bool {
        self.coordinator.is_sending()
    }

    /// Reload the user's conversation list from the backend.
    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let fetched = self
            .backend
            .fetch_conversations(self.user_id.clone())
            .await?;
        info!(user_id = %self.user_id, count = fetched.len(), "Loaded conversations");
        *lock(&self.conversations) = fetched.clone();
        Ok(fetched)
    }

    /// Open (or reopen) a conversation about `listing_id` with its landlord, as the tenant.
    pub async fn start_conversation(
        &self,
        listing_id: &str,
        landlord_id: &str,
        subject: &str,
    ) -> Result<Conversation, ChatError> {
        let input = StartConversationInput {
            listing_id: listing_id.to_string(),
            tenant_id: self.user_id.clone(),
            landlord_id: landlord_id.to_string(),
            subject: subject.to_string(),
        };
        input.validate_input().map_err(ChatError::Validation)?;

        let conversation = self
            .backend
            .start_conversation(NewConversation {
                listing_id: input.listing_id,
                tenant_id: input.tenant_id,
                landlord_id: input.landlord_id,
                subject: input.subject,
            })
            .await?;

        let mut conversations = lock(&self.conversations);
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation.clone(),
            None => conversations.insert(0, conversation.clone()),
        }
        Ok(conversation)
    }

    /// Switch to `conversation_id`: drop the old subscription, subscribe to the
    /// new conversation, load its history and mark it read.
    ///
    /// A failed load leaves the message list empty and is returned as
    /// [`ChatError::Fetch`]; the subscription stays live so the caller can retry.
    /// An open overtaken by a later `open` or `close` returns
    /// [`ChatError::Superseded`] and leaves the newer state alone.
    pub async fn open(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.reconciler.detach();
        self.store.with(|s| s.reset(conversation_id, Vec::new()));
        *lock(&self.active) = Some(conversation_id.to_string());

        self.reconciler.attach(conversation_id).await?;
        self.store.load(&*self.backend, conversation_id).await?;

        if let Err(e) = self
            .backend
            .mark_read(conversation_id.to_string(), self.user_id.clone())
            .await
        {
            warn!(conversation_id, error = %e, "Failed to mark conversation read");
        }
        if let Some(conversation) = lock(&self.conversations)
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.mark_read(&self.user_id);
        }

        info!(user_id = %self.user_id, conversation_id, "Opened conversation");
        Ok(())
    }

    /// Send `content` to the open conversation.
    pub async fn send(&self, content: &str) -> SendOutcome {
        let Some(conversation_id) = self.active_conversation() else {
            return SendOutcome::Invalid(ChatError::NoActiveConversation.to_string());
        };
        self.coordinator
            .send(&conversation_id, &self.user_id, content)
            .await
    }

    /// Merge a message that arrived outside the subscription (e.g. a push notification).
    pub fn receive(&self, message: Message) -> bool {
        self.reconciler.on_external_message(message)
    }

    /// Close the open conversation. Safe to call when nothing is open.
    pub fn close(&self) {
        self.reconciler.detach();
        self.store.clear();
        *lock(&self.active) = None;
    }

    /// Fuzzy-filter the local conversation list.
    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let conversations = lock(&self.conversations);
        ConversationIndex::new(&conversations)
            .search(query)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn test_send_without_open_conversation() {
        let session = ChatSession::new(Arc::new(InMemoryBackend::new()), "tenant1");
        let outcome = session.send("Hello").await;
        assert!(matches!(outcome, SendOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn test_start_conversation_adds_to_list() {
        let session = ChatSession::new(Arc::new(InMemoryBackend::new()), "tenant1");

        let conv = session
            .start_conversation("listing9", "landlord1", "Kilimani Apartment")
            .await
            .unwrap();
        session
            .start_conversation("listing9", "landlord1", "Kilimani Apartment")
            .await
            .unwrap();

        assert_eq!(conv.id, "listing9:tenant1:landlord1");
        assert_eq!(session.conversations().len(), 1);
    }

    #[tokio::test]
    async fn test_start_conversation_validates() {
        let session = ChatSession::new(Arc::new(InMemoryBackend::new()), "tenant1");
        let err = session
            .start_conversation("listing9", "landlord1", "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = ChatSession::new(Arc::new(InMemoryBackend::new()), "tenant1");
        session.open("conv1").await.unwrap();
        assert_eq!(session.active_conversation().as_deref(), Some("conv1"));

        session.close();
        session.close();
        assert!(session.active_conversation().is_none());
        assert!(session.messages().is_empty());
    }
}
