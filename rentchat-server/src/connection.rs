use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rentchat_core::models::input::{SendMessageInput, StartConversationInput, ValidateExt, MAX_USER_ID_LENGTH};
use rentchat_core::WsMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::state::{ClientSender, ServerState};

/// Seconds a new connection has to send its `connect` frame
const AUTH_TIMEOUT_SECS: u64 = 10;

enum Handshake {
    Accepted(String),
    Refused(String),
    Closed,
}

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user_id = match wait_for_connect(&mut ws_receiver, state.access_token()).await {
        Handshake::Accepted(id) => id,
        Handshake::Refused(reason) => {
            let refusal = WsMessage::AuthResponse {
                success: false,
                message: reason,
            };
            if let Ok(json) = serde_json::to_string(&refusal) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
        Handshake::Closed => {
            warn!("Connection closed before authentication");
            return;
        }
    };

    let connection_id = state.next_connection_id();
    info!(user_id = %user_id, connection_id, "User connected");

    // Create channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let auth_response = WsMessage::AuthResponse {
        success: true,
        message: "Connected to server".to_string(),
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!(user_id = %user_id, error = %e, "Failed to send auth response");
                return;
            }
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to serialize auth response");
            return;
        }
    }

    // Forward frames from the channel to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&text, &user_id, connection_id, &tx, &state);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(user_id = %user_id, "Client sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(user_id = %user_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        info!(user_id = %user_id, "WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!(user_id = %user_id, "Send task finished (likely connection lost)");
                break;
            }
        }
    }

    send_task.abort();
    state.remove_connection(connection_id);
    info!(user_id = %user_id, connection_id, "User disconnected");
}

/// Wait for the Connect frame from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    expected_token: Option<&str>,
) -> Handshake {
    let handshake = tokio::time::timeout(std::time::Duration::from_secs(AUTH_TIMEOUT_SECS), async {
        while let Some(result) = receiver.next().await {
            let Ok(Message::Text(text)) = result else {
                continue;
            };
            match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::Connect { user_id, token }) => {
                    return check_credentials(user_id, token, expected_token);
                }
                Ok(other) => debug!(?other, "Ignoring frame before connect"),
                Err(e) => warn!(error = %e, "Failed to parse Connect message"),
            }
        }
        Handshake::Closed
    });

    match handshake.await {
        Ok(result) => result,
        Err(_) => {
            warn!("Authentication timeout");
            Handshake::Closed
        }
    }
}

fn check_credentials(user_id: String, token: Option<String>, expected: Option<&str>) -> Handshake {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LENGTH {
        warn!("Authentication failed: invalid user id");
        return Handshake::Refused("invalid user id".to_string());
    }
    if let Some(expected) = expected {
        match token.as_deref() {
            Some(received) if received == expected => {}
            Some(_) => {
                warn!(user_id = %user_id, "Authentication failed: invalid token");
                return Handshake::Refused("invalid access token".to_string());
            }
            None => {
                warn!(user_id = %user_id, "Authentication failed: no token provided");
                return Handshake::Refused("access token required".to_string());
            }
        }
    }
    Handshake::Accepted(user_id)
}

fn reply(tx: &ClientSender, frame: &WsMessage) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => error!(error = %e, "Failed to serialize response"),
    }
}

fn reply_error(tx: &ClientSender, request_id: Option<String>, message: String) {
    reply(tx, &WsMessage::Error { request_id, message });
}

/// Handle one frame from an authenticated connection.
///
/// Responses go to `tx`; pushes for stored messages go to every subscriber of
/// the conversation, this connection included.
pub fn handle_message(
    text: &str,
    user_id: &str,
    connection_id: u64,
    tx: &ClientSender,
    state: &ServerState,
) {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(user_id, error = %e, "Failed to parse message");
            reply_error(tx, None, format!("malformed frame: {}", e));
            return;
        }
    };

    match msg {
        WsMessage::Subscribe {
            request_id,
            conversation_id,
        } => match state.authorize(&conversation_id, user_id) {
            Ok(()) => {
                state.subscribe(&conversation_id, connection_id, tx.clone());
                debug!(user_id, conversation_id = %conversation_id, "Subscribed");
                reply(tx, &WsMessage::Ack { request_id });
            }
            Err(e) => reply_error(tx, Some(request_id), e),
        },
        WsMessage::Unsubscribe { conversation_id } => {
            state.unsubscribe(&conversation_id, connection_id);
            debug!(user_id, conversation_id = %conversation_id, "Unsubscribed");
        }
        WsMessage::FetchMessages {
            request_id,
            conversation_id,
        } => match state.authorize(&conversation_id, user_id) {
            Ok(()) => {
                let messages = state.history(&conversation_id);
                reply(
                    tx,
                    &WsMessage::MessageHistory {
                        request_id,
                        conversation_id,
                        messages,
                    },
                );
            }
            Err(e) => reply_error(tx, Some(request_id), e),
        },
        WsMessage::SendMessage {
            request_id,
            conversation_id,
            sender_id,
            content,
        } => {
            // Enforce sender identity to prevent spoofing
            if sender_id != user_id {
                warn!(user_id, claimed = %sender_id, "Overriding spoofed sender id");
            }
            let input = SendMessageInput {
                conversation_id,
                sender_id: user_id.to_string(),
                content,
            };
            if let Err(e) = input.validate_input() {
                reply_error(tx, Some(request_id), e);
                return;
            }
            if let Err(e) = state.authorize(&input.conversation_id, user_id) {
                reply_error(tx, Some(request_id), e);
                return;
            }

            let message = state.store_message(&input.conversation_id, user_id, &input.content);
            info!(id = %message.id, conversation_id = %message.conversation_id, "Stored message");
            reply(
                tx,
                &WsMessage::MessageAck {
                    request_id,
                    message: message.clone(),
                },
            );
            state.publish(&message);
        }
        WsMessage::FetchConversations { request_id } => {
            let conversations = state.conversations_for(user_id);
            reply(
                tx,
                &WsMessage::Conversations {
                    request_id,
                    conversations,
                },
            );
        }
        WsMessage::StartConversation {
            request_id,
            listing_id,
            landlord_id,
            subject,
        } => {
            // The authenticated user is always the tenant
            let input = StartConversationInput {
                listing_id,
                tenant_id: user_id.to_string(),
                landlord_id,
                subject,
            };
            if let Err(e) = input.validate_input() {
                reply_error(tx, Some(request_id), e);
                return;
            }
            match state.start_conversation(
                &input.listing_id,
                &input.tenant_id,
                &input.landlord_id,
                &input.subject,
            ) {
                Ok(conversation) => reply(
                    tx,
                    &WsMessage::ConversationInfo {
                        request_id,
                        conversation,
                    },
                ),
                Err(e) => reply_error(tx, Some(request_id), e),
            }
        }
        WsMessage::MarkRead {
            request_id,
            conversation_id,
        } => match state.authorize(&conversation_id, user_id) {
            Ok(()) => {
                state.mark_read(&conversation_id, user_id);
                reply(tx, &WsMessage::Ack { request_id });
            }
            Err(e) => reply_error(tx, Some(request_id), e),
        },
        WsMessage::Connect { .. } => {
            // Already authenticated, ignore
        }
        WsMessage::AuthResponse { .. }
        | WsMessage::MessageHistory { .. }
        | WsMessage::MessageAck { .. }
        | WsMessage::NewMessage { .. }
        | WsMessage::Conversations { .. }
        | WsMessage::ConversationInfo { .. }
        | WsMessage::Ack { .. }
        | WsMessage::Error { .. } => {
            // Server-only frames, ignore from client
            debug!(user_id, "Ignoring server-only frame from client");
        }
    }
}
