//! Input DTOs with garde validation.
//!
//! These structs validate caller data before anything touches the store or the backend.

use garde::Validate;
use serde::Deserialize;

/// Validation constants
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_CONVERSATION_ID_LENGTH: usize = 256;
pub const MAX_MESSAGE_LENGTH: usize = 10000;
pub const MAX_SUBJECT_LENGTH: usize = 200;

/// Whitespace-only text counts as empty
fn validate_not_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be blank"));
    }
    Ok(())
}

/// Id parts are joined with ':' so they may not contain it
fn validate_id_part(value: &str, _ctx: &()) -> garde::Result {
    if value.contains(':') {
        return Err(garde::Error::new("must not contain ':'"));
    }
    Ok(())
}

/// Input for sending a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_CONVERSATION_ID_LENGTH))]
    pub conversation_id: String,
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub sender_id: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_LENGTH), custom(validate_not_blank))]
    pub content: String,
}

/// Input for opening a conversation about a listing
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct StartConversationInput {
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH), custom(validate_id_part))]
    pub listing_id: String,
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH), custom(validate_id_part))]
    pub tenant_id: String,
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH), custom(validate_id_part))]
    pub landlord_id: String,
    #[garde(length(min = 1, max = MAX_SUBJECT_LENGTH), custom(validate_not_blank))]
    pub subject: String,
}

/// Helper trait to convert garde validation errors to String
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), String>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), String> {
        self.validate().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_input(content: &str) -> SendMessageInput {
        SendMessageInput {
            conversation_id: "conv1".to_string(),
            sender_id: "user1".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_valid_send_input() {
        assert!(send_input("Hello").validate_input().is_ok());
    }

    #[test]
    fn test_empty_and_blank_content_rejected() {
        assert!(send_input("").validate_input().is_err());
        assert!(send_input("   \n\t").validate_input().is_err());
    }

    #[test]
    fn test_oversized_content_rejected() {
        let long = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(send_input(&long).validate_input().is_err());
        let max = "a".repeat(MAX_MESSAGE_LENGTH);
        assert!(send_input(&max).validate_input().is_ok());
    }

    #[test]
    fn test_missing_sender_rejected() {
        let input = SendMessageInput {
            conversation_id: "conv1".to_string(),
            sender_id: String::new(),
            content: "Hello".to_string(),
        };
        assert!(input.validate_input().is_err());
    }

    #[test]
    fn test_start_conversation_rejects_separator() {
        let input = StartConversationInput {
            listing_id: "listing:1".to_string(),
            tenant_id: "t1".to_string(),
            landlord_id: "ll1".to_string(),
            subject: "Masaki Studio".to_string(),
        };
        let err = input.validate_input().unwrap_err();
        assert!(err.contains("listing_id"));
    }

    #[test]
    fn test_start_conversation_valid() {
        let input = StartConversationInput {
            listing_id: "listing1".to_string(),
            tenant_id: "t1".to_string(),
            landlord_id: "ll1".to_string(),
            subject: "Masaki Studio".to_string(),
        };
        assert!(input.validate_input().is_ok());
    }
}
