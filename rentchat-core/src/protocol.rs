use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message};

/// WebSocket frames (shared between server and client)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "connect")]
    Connect {
        user_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "subscribe")]
    Subscribe {
        request_id: String,
        conversation_id: String,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { conversation_id: String },
    #[serde(rename = "fetch_messages")]
    FetchMessages {
        request_id: String,
        conversation_id: String,
    },
    #[serde(rename = "message_history")]
    MessageHistory {
        request_id: String,
        conversation_id: String,
        messages: Vec<Message>,
    },
    #[serde(rename = "send_message")]
    SendMessage {
        request_id: String,
        conversation_id: String,
        sender_id: String,
        content: String,
    },
    #[serde(rename = "message_ack")]
    MessageAck { request_id: String, message: Message },
    #[serde(rename = "new_message")]
    NewMessage { message: Message },
    #[serde(rename = "fetch_conversations")]
    FetchConversations { request_id: String },
    #[serde(rename = "conversations")]
    Conversations {
        request_id: String,
        conversations: Vec<Conversation>,
    },
    #[serde(rename = "start_conversation")]
    StartConversation {
        request_id: String,
        listing_id: String,
        landlord_id: String,
        subject: String,
    },
    #[serde(rename = "conversation")]
    ConversationInfo {
        request_id: String,
        conversation: Conversation,
    },
    #[serde(rename = "mark_read")]
    MarkRead {
        request_id: String,
        conversation_id: String,
    },
    #[serde(rename = "ack")]
    Ack { request_id: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        request_id: Option<String>,
        message: String,
    },
}

impl WsMessage {
    /// Correlation id of a server response, if this frame answers a request.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            WsMessage::MessageHistory { request_id, .. }
            | WsMessage::MessageAck { request_id, .. }
            | WsMessage::Conversations { request_id, .. }
            | WsMessage::ConversationInfo { request_id, .. }
            | WsMessage::Ack { request_id } => Some(request_id),
            WsMessage::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_message_serialization() {
        let msg = WsMessage::Connect {
            user_id: "user123".to_string(),
            token: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connect\""));
        assert!(json.contains("\"user_id\":\"user123\""));

        let parsed: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_connect_without_token_field() {
        let json = r#"{"type":"connect","user_id":"abc-123"}"#;
        let msg: WsMessage = serde_json::from_str(json).unwrap();
        if let WsMessage::Connect { user_id, token } = msg {
            assert_eq!(user_id, "abc-123");
            assert!(token.is_none());
        } else {
            panic!("Expected Connect");
        }
    }

    #[test]
    fn test_send_message_wire_format() {
        let json = r#"{"type":"send_message","request_id":"7","conversation_id":"l1:t1:ll1","sender_id":"t1","content":"Is it available?"}"#;
        let msg: WsMessage = serde_json::from_str(json).unwrap();
        if let WsMessage::SendMessage {
            request_id,
            conversation_id,
            content,
            ..
        } = msg
        {
            assert_eq!(request_id, "7");
            assert_eq!(conversation_id, "l1:t1:ll1");
            assert_eq!(content, "Is it available?");
        } else {
            panic!("Expected SendMessage");
        }
    }

    #[test]
    fn test_conversation_info_uses_conversation_tag() {
        let msg = WsMessage::ConversationInfo {
            request_id: "1".to_string(),
            conversation: Conversation::new("l1:t1:ll1", "l1", "t1", "ll1", "Studio"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"conversation\""));
    }

    #[test]
    fn test_response_ids() {
        let ack = WsMessage::Ack {
            request_id: "5".to_string(),
        };
        assert_eq!(ack.response_id(), Some("5"));

        let err = WsMessage::Error {
            request_id: None,
            message: "bad".to_string(),
        };
        assert_eq!(err.response_id(), None);

        let json = r#"{"type":"error","message":"bad"}"#;
        let parsed: WsMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, err);

        let push = WsMessage::Unsubscribe {
            conversation_id: "c".to_string(),
        };
        assert_eq!(push.response_id(), None);
    }
}
