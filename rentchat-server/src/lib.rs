//! Rentchat relay server library
//!
//! This module exposes the server components for use in integration tests.

mod config;
mod connection;
mod state;

pub use config::ServerConfig;
pub use connection::handle_connection;
pub use connection::handle_message;
pub use rentchat_core::WsMessage;
pub use state::{ServerState, MAX_HISTORY_PER_CONVERSATION};
