use crate::error::ChatError;

const SEPARATOR: char = ':';

/// Build the composite conversation id for a tenant asking about a listing.
/// Both sides derive the same id regardless of who opens the conversation.
pub fn compose_conversation_id(
    listing_id: &str,
    tenant_id: &str,
    landlord_id: &str,
) -> Result<String, ChatError> {
    for part in [listing_id, tenant_id, landlord_id] {
        if part.is_empty() || part.contains(SEPARATOR) {
            return Err(ChatError::InvalidConversationId(format!(
                "invalid id component {:?}",
                part
            )));
        }
    }
    Ok(format!(
        "{}{sep}{}{sep}{}",
        listing_id,
        tenant_id,
        landlord_id,
        sep = SEPARATOR
    ))
}
