use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub listing_id: String,
    pub tenant_id: String,
    pub landlord_id: String,
    pub title: String,
    pub last_message: Option<String>,
    pub last_message_sender: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// user_id -> unread count. Missing entries mean zero.
    #[serde(default)]
    pub unread: HashMap<String, u32>,
}

impl Conversation {
    pub fn new(id: &str, listing_id: &str, tenant_id: &str, landlord_id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            listing_id: listing_id.to_string(),
            tenant_id: tenant_id.to_string(),
            landlord_id: landlord_id.to_string(),
            title: title.to_string(),
            last_message: None,
            last_message_sender: None,
            last_message_at: None,
            unread: HashMap::new(),
        }
    }

    pub fn participants(&self) -> [&str; 2] {
        [self.tenant_id.as_str(), self.landlord_id.as_str()]
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.tenant_id == user_id || self.landlord_id == user_id
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    /// Update the preview fields and bump unread for everyone but the sender.
    pub fn record_message(&mut self, message: &Message) {
        self.last_message = Some(message.content.clone());
        self.last_message_sender = Some(message.sender_id.clone());
        self.last_message_at = Some(message.created_at);

        let recipients: Vec<String> = self
            .participants()
            .iter()
            .filter(|p| **p != message.sender_id.as_str())
            .map(|p| p.to_string())
            .collect();
        for user_id in recipients {
            *self.unread.entry(user_id).or_insert(0) += 1;
        }
    }

    pub fn mark_read(&mut self, user_id: &str) {
        self.unread.remove(user_id);
    }
}

/// Request to open a conversation about a listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewConversation {
    pub listing_id: String,
    pub tenant_id: String,
    pub landlord_id: String,
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sender: &str, content: &str) -> Message {
        let mut m = Message::pending("l1:t1:ll1", sender, content);
        m.id = "srv-1".to_string();
        m
    }

    #[test]
    fn test_record_message_updates_preview() {
        let mut conv = Conversation::new("l1:t1:ll1", "l1", "t1", "ll1", "Kilimani Apartment");
        let m = msg("t1", "Is it available?");
        conv.record_message(&m);

        assert_eq!(conv.last_message.as_deref(), Some("Is it available?"));
        assert_eq!(conv.last_message_sender.as_deref(), Some("t1"));
        assert_eq!(conv.last_message_at, Some(m.created_at));
    }

    #[test]
    fn test_unread_counts_only_other_participant() {
        let mut conv = Conversation::new("l1:t1:ll1", "l1", "t1", "ll1", "Kilimani Apartment");
        conv.record_message(&msg("t1", "one"));
        conv.record_message(&msg("t1", "two"));

        assert_eq!(conv.unread_for("ll1"), 2);
        assert_eq!(conv.unread_for("t1"), 0);
        assert!(!conv.unread.contains_key("t1"));
    }

    #[test]
    fn test_mark_read_resets_counter() {
        let mut conv = Conversation::new("l1:t1:ll1", "l1", "t1", "ll1", "Kilimani Apartment");
        conv.record_message(&msg("ll1", "Yes"));
        assert_eq!(conv.unread_for("t1"), 1);

        conv.mark_read("t1");
        assert_eq!(conv.unread_for("t1"), 0);

        // Marking an absent counter is harmless
        conv.mark_read("someone");
        assert_eq!(conv.unread_for("someone"), 0);
    }

    #[test]
    fn test_missing_unread_map_deserializes_empty() {
        let json = r#"{
            "id": "l1:t1:ll1",
            "listing_id": "l1",
            "tenant_id": "t1",
            "landlord_id": "ll1",
            "title": "Studio",
            "last_message": null,
            "last_message_sender": null,
            "last_message_at": null
        }"#;
        let conv: Conversation = serde_json::from_str(json).unwrap();
        assert!(conv.unread.is_empty());
        assert!(conv.is_participant("t1"));
        assert!(conv.is_participant("ll1"));
        assert!(!conv.is_participant("x"));
    }
}
