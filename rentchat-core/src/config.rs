use std::time::Duration;

use tracing::info;
use url::Url;

use crate::error::ChatError;

/// Server URL: build-time env, then runtime env, then this default
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:9001";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_url: Url,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Result<Self, ChatError> {
        Ok(Self {
            server_url: parse_ws_url(server_url)?,
            access_token: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }

    /// Read `RENTCHAT_*` variables, honouring a `.env` file if present.
    pub fn from_env() -> Result<Self, ChatError> {
        let _ = dotenvy::dotenv();

        let build_time_url = option_env!("RENTCHAT_SERVER_URL");
        let runtime_url = std::env::var("RENTCHAT_SERVER_URL").ok();

        info!(
            build_time = ?build_time_url,
            runtime = ?runtime_url,
            "WebSocket URL sources"
        );

        let server_url = build_time_url
            .map(String::from)
            .or(runtime_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let access_token = std::env::var("RENTCHAT_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let request_timeout = match std::env::var("RENTCHAT_REQUEST_TIMEOUT_MS") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| {
                ChatError::Validation(format!("RENTCHAT_REQUEST_TIMEOUT_MS: {}", e))
            })?,
            Err(_) => DEFAULT_REQUEST_TIMEOUT_MS,
        };

        let config = Self {
            server_url: parse_ws_url(&server_url)?,
            access_token,
            request_timeout: Duration::from_millis(request_timeout),
        };
        info!(url = %config.server_url, "Using WebSocket server URL");
        Ok(config)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_ws_url(raw: &str) -> Result<Url, ChatError> {
    let url = Url::parse(raw).map_err(|e| ChatError::Validation(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChatError::Validation(format!(
            "unsupported scheme {:?}, expected ws or wss",
            other
        ))),
    }
}
