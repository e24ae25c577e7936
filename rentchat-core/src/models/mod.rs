mod conversation;
pub mod input;
mod message;

pub use conversation::{Conversation, NewConversation};
pub use message::{Message, OutgoingMessage, PENDING_ID_PREFIX};
