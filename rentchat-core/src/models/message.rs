use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix reserved for locally generated ids of unconfirmed messages.
/// The backend never issues ids starting with it.
pub const PENDING_ID_PREFIX: &str = "pending-";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// Build an optimistic message that has not been acknowledged yet.
    pub fn pending(conversation_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            id: format!("{}{}", PENDING_ID_PREFIX, uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.starts_with(PENDING_ID_PREFIX)
    }
}

/// Payload handed to the backend when sending.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_message_is_marked() {
        let msg = Message::pending("conv1", "user1", "Hello");
        assert!(msg.is_pending());
        assert!(msg.id.starts_with(PENDING_ID_PREFIX));
        assert!(!msg.read);
        assert_eq!(msg.conversation_id, "conv1");
        assert_eq!(msg.sender_id, "user1");
    }

    #[test]
    fn test_pending_ids_are_unique() {
        let a = Message::pending("conv1", "user1", "Hello");
        let b = Message::pending("conv1", "user1", "Hello");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_server_id_is_not_pending() {
        let mut msg = Message::pending("conv1", "user1", "Hello");
        msg.id = "srv-42".to_string();
        assert!(!msg.is_pending());
    }

    #[test]
    fn test_timestamp_serializes_as_iso8601() {
        let mut msg = Message::pending("conv1", "user1", "Hello");
        msg.created_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"created_at\":\"2024-05-01T10:00:00Z\""));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
