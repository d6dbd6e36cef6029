//! OAuth2 client configuration for the supported providers.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use cloudbackup_common::{Error, Result};

/// Google OAuth2 authorization endpoint.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
/// Google OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Full Drive access; backups need to see what they uploaded earlier.
pub const GOOGLE_DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Yandex OAuth authorization endpoint.
pub const YANDEX_AUTH_URL: &str = "https://oauth.yandex.ru/authorize";
/// Yandex OAuth token endpoint.
pub const YANDEX_TOKEN_URL: &str = "https://oauth.yandex.ru/token";

/// Loopback address the consent callback is received on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";

/// OAuth2 settings for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Backend id, also the token cache key (e.g. "google").
    pub backend: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    /// Redirect URI sent to the provider. Yandex uses the one registered
    /// with the application, so it may be omitted.
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Additional authorization URL parameters.
    #[serde(default)]
    pub extra_params: Vec<(String, String)>,
    /// Fixed host:port the loopback listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl AuthConfig {
    /// Google Drive configuration with offline access.
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            backend: "google".to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            redirect_url: Some(format!("http://{}", DEFAULT_LISTEN_ADDR)),
            scopes: vec![GOOGLE_DRIVE_SCOPE.to_string()],
            extra_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
            listen_addr: default_listen_addr(),
        }
    }

    /// Yandex Disk configuration.
    pub fn yandex(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            backend: "yandex".to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: YANDEX_AUTH_URL.to_string(),
            token_url: YANDEX_TOKEN_URL.to_string(),
            redirect_url: None,
            scopes: Vec::new(),
            extra_params: Vec::new(),
            listen_addr: default_listen_addr(),
        }
    }

    /// Override the token endpoint.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Override the loopback address; the redirect URI follows it when set.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        if self.redirect_url.is_some() {
            self.redirect_url = Some(format!("http://{}", self.listen_addr));
        }
        self
    }

    /// Parse the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address {}: {}", self.listen_addr, e)))
    }
}
