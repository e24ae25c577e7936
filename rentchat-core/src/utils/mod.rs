mod helpers;

pub use helpers::compose_conversation_id;
