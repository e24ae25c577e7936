use tracing::info;

pub const DEFAULT_ADDR: &str = "0.0.0.0:9001";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: String,
    pub access_token: Option<String>,
}

impl ServerConfig {
    /// Read `RENTCHAT_SERVER_ADDR` and `RENTCHAT_ACCESS_TOKEN`, honouring a `.env` file.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let addr =
            std::env::var("RENTCHAT_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let access_token = std::env::var("RENTCHAT_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        if access_token.is_none() {
            info!("RENTCHAT_ACCESS_TOKEN not set, accepting any client");
        }
        Self { addr, access_token }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            access_token: None,
        }
    }
}
