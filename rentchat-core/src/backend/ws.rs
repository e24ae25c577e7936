use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};
use tracing::{debug, error, info, warn};

use super::{MessageHandler, MessagingBackend, Subscription, SubscriptionEvent};
use crate::config::ClientConfig;
use crate::error::BackendError;
use crate::models::{Conversation, Message, NewConversation, OutgoingMessage};
use crate::protocol::WsMessage;

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

type PendingRequests = Arc<StdMutex<HashMap<String, oneshot::Sender<WsMessage>>>>;
type Subscribers = Arc<StdMutex<HashMap<String, Vec<(u64, MessageHandler)>>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messaging backend speaking the rentchat protocol to a relay server.
///
/// One connection per instance. Requests are matched to responses by
/// `request_id`; `new_message` pushes are fanned out to local subscriptions.
/// When the connection drops every in-flight request fails and every
/// subscriber receives a transport error. Reconnecting means building a new
/// backend.
pub struct WsBackend {
    user_id: String,
    request_timeout: Duration,
    write_tx: mpsc::UnboundedSender<WriteMessage>,
    pending: PendingRequests,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    next_request_id: AtomicU64,
    next_subscription_id: AtomicU64,
    /// Serializes subscribes so a listener is only handed out once the server acked
    subscribe_lock: AsyncMutex<()>,
    /// Shutdown signal for the connection task
    shutdown_tx: broadcast::Sender<()>,
}

impl WsBackend {
    /// Connect to the relay and authenticate as `user_id`.
    pub async fn connect(config: &ClientConfig, user_id: &str) -> Result<Self, BackendError> {
        info!(url = %config.server_url, user_id, "Connecting to rentchat server");

        let (ws_stream, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let connect_msg = WsMessage::Connect {
            user_id: user_id.to_string(),
            token: config.access_token.clone(),
        };
        let connect_json =
            serde_json::to_string(&connect_msg).map_err(|e| BackendError::Protocol(e.to_string()))?;
        ws_write
            .send(Frame::Text(connect_json.into()))
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        // Wait for auth response
        let response = tokio::time::timeout(config.request_timeout, ws_read.next())
            .await
            .map_err(|_| BackendError::Timeout)?;
        match response {
            Some(Ok(Frame::Text(text))) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::AuthResponse { success: true, message }) => {
                    info!("Authenticated with server: {}", message);
                }
                Ok(WsMessage::AuthResponse { success: false, message }) => {
                    error!("Authentication failed: {}", message);
                    return Err(BackendError::Rejected(message));
                }
                Ok(other) => {
                    return Err(BackendError::Protocol(format!(
                        "unexpected response during auth: {:?}",
                        other
                    )));
                }
                Err(e) => return Err(BackendError::Protocol(e.to_string())),
            },
            Some(Ok(_)) => {
                return Err(BackendError::Protocol("expected a text auth response".to_string()));
            }
            Some(Err(e)) => return Err(BackendError::Transport(e.to_string())),
            None => return Err(BackendError::NotConnected),
        }

        let (write_tx, mut rx) = mpsc::unbounded_channel::<WriteMessage>();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let pending: PendingRequests = Arc::new(StdMutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(StdMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let task_pending = pending.clone();
        let task_subscribers = subscribers.clone();
        let task_connected = connected.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, closing connection gracefully");
                        if let Err(e) = ws_write.send(Frame::Close(None)).await {
                            warn!(error = %e, "Failed to send close frame");
                        }
                        break;
                    }
                    Some(msg) = rx.recv() => {
                        match msg {
                            WriteMessage::Data(data) => {
                                if ws_write.send(Frame::Text(data.into())).await.is_err() {
                                    error!("Failed to send message to server");
                                    break;
                                }
                            }
                            WriteMessage::Close => {
                                info!("Close requested, sending close frame");
                                if let Err(e) = ws_write.send(Frame::Close(None)).await {
                                    warn!(error = %e, "Failed to send close frame");
                                }
                                break;
                            }
                        }
                    }
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(Frame::Text(text))) => {
                                dispatch(&text, &task_pending, &task_subscribers);
                            }
                            Some(Ok(Frame::Close(_))) | None => {
                                info!("Server closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "WebSocket error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            // Cleanup: in-flight requests see their sender dropped
            task_connected.store(false, Ordering::SeqCst);
            lock(&task_pending).clear();
            let handlers: Vec<MessageHandler> = lock(&task_subscribers)
                .values()
                .flat_map(|subs| subs.iter().map(|(_, h)| h.clone()))
                .collect();
            for handler in handlers {
                handler(SubscriptionEvent::TransportError("connection closed".to_string()));
            }
            info!("Disconnected from rentchat server");
        });

        Ok(Self {
            user_id: user_id.to_string(),
            request_timeout: config.request_timeout,
            write_tx,
            pending,
            subscribers,
            connected,
            next_request_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            subscribe_lock: AsyncMutex::new(()),
            shutdown_tx,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Local listeners registered for `conversation_id`.
    pub fn local_subscriber_count(&self, conversation_id: &str) -> usize {
        lock(&self.subscribers)
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    /// Gracefully close the connection.
    pub fn disconnect(&self) {
        info!("Initiating graceful disconnect");
        let _ = self.shutdown_tx.send(());
        let _ = self.write_tx.send(WriteMessage::Close);
    }

    /// Send a request frame and wait for the frame answering it.
    async fn request(
        &self,
        build: impl FnOnce(String) -> WsMessage,
    ) -> Result<WsMessage, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst).to_string();
        let json = serde_json::to_string(&build(request_id.clone()))
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        let preview: String = json.chars().take(100).collect();
        debug!(%preview, "Sending request to server");
        if self.write_tx.send(WriteMessage::Data(json)).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(BackendError::NotConnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(WsMessage::Error { message, .. })) => Err(BackendError::Rejected(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BackendError::NotConnected),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                warn!(request_id, "Request timed out");
                Err(BackendError::Timeout)
            }
        }
    }
}

impl Drop for WsBackend {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Route one incoming frame to its waiting request or to the subscribers.
fn dispatch(text: &str, pending: &PendingRequests, subscribers: &Subscribers) {
    let msg = match serde_json::from_str::<WsMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Failed to parse frame from server");
            return;
        }
    };

    if let WsMessage::NewMessage { message } = msg {
        let handlers: Vec<MessageHandler> = lock(subscribers)
            .get(&message.conversation_id)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(SubscriptionEvent::Message(message.clone()));
        }
        return;
    }

    match msg.response_id().map(String::from) {
        Some(request_id) => {
            let waiter = lock(pending).remove(&request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!(request_id, "Response for unknown or expired request"),
            }
        }
        None => match msg {
            WsMessage::Error { message, .. } => warn!("Server error: {}", message),
            other => debug!(?other, "Ignoring unsolicited frame"),
        },
    }
}

fn unexpected(response: WsMessage) -> BackendError {
    BackendError::Protocol(format!("unexpected response: {:?}", response))
}

impl MessagingBackend for WsBackend {
    fn fetch_messages(
        &self,
        conversation_id: String,
    ) -> BoxFuture<'_, Result<Vec<Message>, BackendError>> {
        Box::pin(async move {
            match self
                .request(|request_id| WsMessage::FetchMessages {
                    request_id,
                    conversation_id,
                })
                .await?
            {
                WsMessage::MessageHistory { messages, .. } => Ok(messages),
                other => Err(unexpected(other)),
            }
        })
    }

    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<Message, BackendError>> {
        Box::pin(async move {
            match self
                .request(|request_id| WsMessage::SendMessage {
                    request_id,
                    conversation_id: message.conversation_id,
                    sender_id: message.sender_id,
                    content: message.content,
                })
                .await?
            {
                WsMessage::MessageAck { message, .. } => Ok(message),
                other => Err(unexpected(other)),
            }
        })
    }

    fn subscribe(
        &self,
        conversation_id: String,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<Subscription, BackendError>> {
        Box::pin(async move {
            // Held until the server answers, so a concurrent subscriber to the
            // same conversation never returns before the first one is acked
            let _serial = self.subscribe_lock.lock().await;

            let sub_id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
            let first = {
                let mut subscribers = lock(&self.subscribers);
                let entry = subscribers.entry(conversation_id.clone()).or_default();
                entry.push((sub_id, handler));
                entry.len() == 1
            };

            // The server only needs to hear about the first local listener
            if first {
                let key = conversation_id.clone();
                let result = self
                    .request(|request_id| WsMessage::Subscribe {
                        request_id,
                        conversation_id: key,
                    })
                    .await;
                if let Err(e) = result {
                    remove_subscriber(&self.subscribers, &conversation_id, sub_id);
                    return Err(e);
                }
            }

            let subscribers = Arc::downgrade(&self.subscribers);
            let write_tx = self.write_tx.clone();
            let key = conversation_id.clone();
            Ok(Subscription::new(conversation_id, move || {
                let Some(subscribers) = subscribers.upgrade() else {
                    return;
                };
                if remove_subscriber(&subscribers, &key, sub_id) {
                    let frame = WsMessage::Unsubscribe {
                        conversation_id: key.clone(),
                    };
                    if let Ok(json) = serde_json::to_string(&frame) {
                        let _ = write_tx.send(WriteMessage::Data(json));
                    }
                    debug!(conversation_id = %key, "Unsubscribed");
                }
            }))
        })
    }

    fn fetch_conversations(
        &self,
        _user_id: String,
    ) -> BoxFuture<'_, Result<Vec<Conversation>, BackendError>> {
        // The server answers for the authenticated user
        Box::pin(async move {
            match self
                .request(|request_id| WsMessage::FetchConversations { request_id })
                .await?
            {
                WsMessage::Conversations { conversations, .. } => Ok(conversations),
                other => Err(unexpected(other)),
            }
        })
    }

    fn start_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, Result<Conversation, BackendError>> {
        Box::pin(async move {
            if request.tenant_id != self.user_id {
                return Err(BackendError::Rejected(
                    "conversations are started by the tenant".to_string(),
                ));
            }
            match self
                .request(|request_id| WsMessage::StartConversation {
                    request_id,
                    listing_id: request.listing_id,
                    landlord_id: request.landlord_id,
                    subject: request.subject,
                })
                .await?
            {
                WsMessage::ConversationInfo { conversation, .. } => Ok(conversation),
                other => Err(unexpected(other)),
            }
        })
    }

    fn mark_read(
        &self,
        conversation_id: String,
        _user_id: String,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            match self
                .request(|request_id| WsMessage::MarkRead {
                    request_id,
                    conversation_id,
                })
                .await?
            {
                WsMessage::Ack { .. } => Ok(()),
                other => Err(unexpected(other)),
            }
        })
    }
}

/// Drop one local listener. Returns true when it was the last one for the conversation.
fn remove_subscriber(
    subscribers: &StdMutex<HashMap<String, Vec<(u64, MessageHandler)>>>,
    conversation_id: &str,
    sub_id: u64,
) -> bool {
    let mut subscribers = lock(subscribers);
    let Some(subs) = subscribers.get_mut(conversation_id) else {
        return false;
    };
    subs.retain(|(id, _)| *id != sub_id);
    if subs.is_empty() {
        subscribers.remove(conversation_id);
        true
    } else {
        false
    }
}
