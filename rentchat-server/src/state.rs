use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use rentchat_core::models::{Conversation, Message};
use rentchat_core::utils::compose_conversation_id;
use rentchat_core::WsMessage;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Maximum stored messages per conversation to prevent unbounded memory growth
pub const MAX_HISTORY_PER_CONVERSATION: usize = 1000;

/// Outgoing frame channel of one connection
pub type ClientSender = mpsc::UnboundedSender<String>;

/// Server state: conversations, their history and live subscriptions
pub struct ServerState {
    conversations: DashMap<String, Conversation>,
    history: DashMap<String, Vec<Message>>,
    /// conversation_id -> (connection id, channel)
    subscribers: DashMap<String, Vec<(u64, ClientSender)>>,
    next_message_id: AtomicU64,
    next_connection_id: AtomicU64,
    access_token: Option<String>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
            history: DashMap::new(),
            subscribers: DashMap::new(),
            next_message_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            access_token: None,
        }
    }

    /// Require `token` in every `connect` frame. Empty tokens disable the check.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create the conversation for (listing, tenant, landlord), or return the existing one
    pub fn start_conversation(
        &self,
        listing_id: &str,
        tenant_id: &str,
        landlord_id: &str,
        subject: &str,
    ) -> Result<Conversation, String> {
        let id = compose_conversation_id(listing_id, tenant_id, landlord_id)
            .map_err(|e| e.to_string())?;
        let conversation = self
            .conversations
            .entry(id.clone())
            .or_insert_with(|| {
                info!(conversation_id = %id, "Created conversation");
                Conversation::new(&id, listing_id, tenant_id, landlord_id, subject)
            })
            .value()
            .clone();
        Ok(conversation)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.value().clone())
    }

    /// Conversations `user_id` takes part in, most recently active first
    pub fn conversations_for(&self, user_id: &str) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_participant(user_id))
            .map(|c| c.value().clone())
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        conversations
    }

    /// Check that `user_id` may read and write `conversation_id`
    pub fn authorize(&self, conversation_id: &str, user_id: &str) -> Result<(), String> {
        match self.conversations.get(conversation_id) {
            None => Err(format!("unknown conversation {}", conversation_id)),
            Some(c) if !c.is_participant(user_id) => {
                Err(format!("not a participant in {}", conversation_id))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn subscribe(&self, conversation_id: &str, connection_id: u64, tx: ClientSender) {
        let mut entry = self
            .subscribers
            .entry(conversation_id.to_string())
            .or_default();
        // Resubscribing from the same connection is a no-op
        if !entry.iter().any(|(id, _)| *id == connection_id) {
            entry.push((connection_id, tx));
        }
    }

    pub fn unsubscribe(&self, conversation_id: &str, connection_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(conversation_id) {
            entry.retain(|(id, _)| *id != connection_id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers
                    .remove_if(conversation_id, |_, subs| subs.is_empty());
            }
        }
    }

    /// Drop every subscription held by a closed connection
    pub fn remove_connection(&self, connection_id: u64) {
        for mut entry in self.subscribers.iter_mut() {
            entry.retain(|(id, tx)| *id != connection_id && !tx.is_closed());
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers
            .get(conversation_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Persist a message with a server id and timestamp. Does not publish it.
    pub fn store_message(&self, conversation_id: &str, sender_id: &str, content: &str) -> Message {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: format!("srv-{}", id),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        };

        {
            let mut history = self
                .history
                .entry(conversation_id.to_string())
                .or_default();
            // Enforce history limit - drop oldest if at capacity
            if history.len() >= MAX_HISTORY_PER_CONVERSATION {
                history.remove(0);
                debug!(conversation_id, "History limit reached, dropped oldest message");
            }
            history.push(message.clone());
        }

        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            conversation.record_message(&message);
        }
        message
    }

    /// Push `message` to every connection subscribed to its conversation.
    /// Returns how many connections it reached.
    pub fn publish(&self, message: &Message) -> usize {
        let frame = WsMessage::NewMessage {
            message: message.clone(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!(id = %message.id, error = %e, "Failed to serialize message");
                return 0;
            }
        };

        let channels: Vec<ClientSender> = self
            .subscribers
            .get(&message.conversation_id)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();

        channels
            .iter()
            .filter(|tx| tx.send(json.clone()).is_ok())
            .count()
    }

    pub fn history(&self, conversation_id: &str) -> Vec<Message> {
        self.history
            .get(conversation_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Reset `user_id`'s unread counter and flag the other participant's messages as read
    pub fn mark_read(&self, conversation_id: &str, user_id: &str) {
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            conversation.mark_read(user_id);
        }
        if let Some(mut history) = self.history.get_mut(conversation_id) {
            for message in history.iter_mut().filter(|m| m.sender_id != user_id) {
                message.read = true;
            }
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
