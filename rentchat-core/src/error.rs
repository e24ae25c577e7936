use thiserror::Error;

/// Failures reported by a messaging backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("not connected to server")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to load messages for {conversation_id}: {source}")]
    Fetch {
        conversation_id: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to send message: {0}")]
    Send(#[source] BackendError),
    #[error("failed to subscribe to {conversation_id}: {source}")]
    Subscribe {
        conversation_id: String,
        #[source]
        source: BackendError,
    },
    #[error("backend request failed: {0}")]
    Backend(#[from] BackendError),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("no conversation is open")]
    NoActiveConversation,
    #[error("opening {conversation_id} was superseded by a newer open")]
    Superseded { conversation_id: String },
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),
}
