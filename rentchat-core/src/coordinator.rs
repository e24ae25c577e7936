//! Optimistic sending.
//!
//! A send appends a pending message to the store straight away, then asks the
//! backend to persist it. The pending entry is swapped in place for the
//! confirmed copy on success and removed on failure. Only one send may be in
//! flight per coordinator; a second call while one is pending does nothing.
//!
//! Dropping a send future before it settles (a caller timeout, a cancelled
//! task) retracts the pending entry and returns the coordinator to idle. The
//! backend may still persist the message; it then shows up on the next load.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::MessagingBackend;
use crate::error::ChatError;
use crate::models::input::{SendMessageInput, ValidateExt};
use crate::models::{Message, OutgoingMessage};
use crate::store::SharedStore;

/// Lifecycle of the most recent send.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SendState {
    #[default]
    Idle,
    Pending { local_id: String, content: String },
    Confirmed(Message),
}

impl SendState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SendState::Pending { .. })
    }
}

/// Why a send was retracted. Carries the content so the caller can resubmit it.
#[derive(Debug)]
pub struct SendFailure {
    pub local_id: String,
    pub content: String,
    pub error: ChatError,
}

#[derive(Debug)]
pub enum SendOutcome {
    Confirmed(Message),
    /// Another send was still in flight; nothing happened.
    Ignored,
    Failed(SendFailure),
    /// Rejected before reaching the store.
    Invalid(String),
}

impl SendOutcome {
    pub fn confirmed(&self) -> Option<&Message> {
        match self {
            SendOutcome::Confirmed(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, SendOutcome::Ignored)
    }
}

type ConfirmHook = Box<dyn Fn(&Message) + Send + Sync>;

/// Retracts a pending send whose future is dropped before it settles.
struct InFlight<'a> {
    store: &'a SharedStore,
    state: &'a Mutex<SendState>,
    local_id: String,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.store.remove(&self.local_id);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*state, SendState::Pending { local_id, .. } if *local_id == self.local_id) {
            *state = SendState::Idle;
        }
        warn!(local_id = %self.local_id, "Send abandoned before settling, retracted message");
    }
}

pub struct SendCoordinator<B: MessagingBackend + ?Sized> {
    backend: Arc<B>,
    store: SharedStore,
    state: Mutex<SendState>,
    on_confirmed: Option<ConfirmHook>,
}

impl<B: MessagingBackend + ?Sized> SendCoordinator<B> {
    pub fn new(backend: Arc<B>, store: SharedStore) -> Self {
        Self {
            backend,
            store,
            state: Mutex::new(SendState::Idle),
            on_confirmed: None,
        }
    }

    /// Called with every confirmed message, after the store has been updated.
    pub fn on_confirmed(mut self, hook: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_confirmed = Some(Box::new(hook));
        self
    }

    fn state_lock(&self) -> MutexGuard<'_, SendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SendState {
        self.state_lock().clone()
    }

    pub fn is_sending(&self) -> bool {
        self.state_lock().is_pending()
    }

    /// Send `content` to `conversation_id` as `sender_id`.
    pub async fn send(&self, conversation_id: &str, sender_id: &str, content: &str) -> SendOutcome {
        let input = SendMessageInput {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
        };
        if let Err(e) = input.validate_input() {
            debug!(conversation_id, error = %e, "Rejected invalid send");
            return SendOutcome::Invalid(e);
        }

        // Guard check, state change and optimistic append happen in one
        // critical section, before the first await.
        let pending = {
            let mut state = self.state_lock();
            if state.is_pending() {
                info!(conversation_id, "Send already in flight, ignoring duplicate");
                return SendOutcome::Ignored;
            }
            let pending = Message::pending(conversation_id, sender_id, content);
            *state = SendState::Pending {
                local_id: pending.id.clone(),
                content: pending.content.clone(),
            };
            self.store.append(pending.clone());
            pending
        };
        let in_flight = InFlight {
            store: &self.store,
            state: &self.state,
            local_id: pending.id.clone(),
            settled: false,
        };
        debug!(local_id = %pending.id, conversation_id, "Appended pending message");

        let result = self
            .backend
            .send_message(OutgoingMessage {
                conversation_id: input.conversation_id,
                sender_id: input.sender_id,
                content: input.content,
            })
            .await;

        in_flight.settle();
        match result {
            Ok(confirmed) => {
                if !self.store.replace(&pending.id, confirmed.clone()) {
                    debug!(local_id = %pending.id, "Pending message gone before confirmation");
                }
                *self.state_lock() = SendState::Confirmed(confirmed.clone());
                info!(id = %confirmed.id, conversation_id, "Message confirmed");
                if let Some(hook) = &self.on_confirmed {
                    hook(&confirmed);
                }
                SendOutcome::Confirmed(confirmed)
            }
            Err(e) => {
                self.store.remove(&pending.id);
                *self.state_lock() = SendState::Idle;
                warn!(local_id = %pending.id, conversation_id, error = %e, "Send failed, retracted message");
                SendOutcome::Failed(SendFailure {
                    local_id: pending.id,
                    content: pending.content,
                    error: ChatError::Send(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn setup() -> (Arc<InMemoryBackend>, SharedStore, SendCoordinator<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SharedStore::new();
        let coordinator = SendCoordinator::new(backend.clone(), store.clone());
        (backend, store, coordinator)
    }

    #[tokio::test]
    async fn test_confirmed_send_replaces_pending() {
        let (backend, store, coordinator) = setup();
        backend.set_next_message_id(42);

        let outcome = coordinator.send("conv1", "user1", "Hello").await;

        let confirmed = outcome.confirmed().expect("confirmed");
        assert_eq!(confirmed.id, "srv-42");
        let messages = store.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "srv-42");
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[0].sender_id, "user1");
        assert!(matches!(coordinator.state(), SendState::Confirmed(_)));
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let (backend, store, coordinator) = setup();
        backend.fail_sends(true);

        let outcome = coordinator.send("conv1", "user1", "Hello").await;

        match outcome {
            SendOutcome::Failed(failure) => {
                assert!(failure.local_id.starts_with(crate::models::PENDING_ID_PREFIX));
                assert_eq!(failure.content, "Hello");
                assert!(matches!(failure.error, ChatError::Send(_)));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert!(store.is_empty());
        assert_eq!(coordinator.state(), SendState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_input_leaves_state_alone() {
        let (backend, store, coordinator) = setup();

        let outcome = coordinator.send("conv1", "user1", "   ").await;

        assert!(matches!(outcome, SendOutcome::Invalid(_)));
        assert!(store.is_empty());
        assert_eq!(coordinator.state(), SendState::Idle);
        assert_eq!(backend.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_hook_runs() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SharedStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let coordinator = SendCoordinator::new(backend, store)
            .on_confirmed(move |m| sink.lock().unwrap().push(m.id.clone()));

        coordinator.send("conv1", "user1", "Hello").await;

        assert_eq!(seen.lock().unwrap().as_slice(), &["srv-1".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_send_retracts_pending_message() {
        let (backend, store, coordinator) = setup();
        backend.hold_sends();

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            coordinator.send("conv1", "user1", "Hello"),
        )
        .await;

        assert!(result.is_err());
        assert!(store.is_empty());
        assert_eq!(coordinator.state(), SendState::Idle);

        backend.release_sends();
        let outcome = coordinator.send("conv1", "user1", "Hello again").await;
        assert!(outcome.confirmed().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_after_reload_is_dropped_quietly() {
        let (backend, store, coordinator) = setup();
        backend.hold_sends();

        let coordinator = Arc::new(coordinator);
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.send("conv1", "user1", "Hello").await })
        };
        while backend.send_attempts() == 0 {
            tokio::task::yield_now().await;
        }

        // Store reloaded while the send is in flight
        store.clear();
        backend.release_sends();

        let outcome = task.await.unwrap();
        assert!(outcome.confirmed().is_some());
        assert!(store.is_empty());
        assert!(!coordinator.is_sending());
    }
}
