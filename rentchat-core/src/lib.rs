//! Rentchat client core
//!
//! Optimistic message sending, live-update reconciliation and conversation
//! search for the rental marketplace chat. The relay server reuses the
//! models and the wire protocol defined here.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod protocol;
pub mod reconciler;
pub mod search;
pub mod session;
pub mod store;
pub mod utils;

pub use backend::{InMemoryBackend, MessageHandler, MessagingBackend, Subscription, SubscriptionEvent, WsBackend};
pub use config::ClientConfig;
pub use coordinator::{SendCoordinator, SendFailure, SendOutcome, SendState};
pub use error::{BackendError, ChatError};
pub use models::{Conversation, Message, NewConversation, OutgoingMessage};
pub use protocol::WsMessage;
pub use reconciler::SubscriptionReconciler;
pub use search::{filter_conversations, ConversationIndex};
pub use session::ChatSession;
pub use store::{MessageStore, SharedStore};
