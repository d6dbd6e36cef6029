//! Common error types for cloudbackup.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for cloudbackup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The user declined the consent screen.
    #[error("Access denied: {0}")]
    AuthDenied(String),

    /// The token endpoint rejected an authorization code or refresh token.
    #[error("Token exchange failed: {0}")]
    AuthExchangeFailed(String),

    /// The provider answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never produced a response.
    #[error("Network error: {0}")]
    Network(String),

    /// A local path exists and overwriting it was not authorized.
    #[error("Path already exists: {}", .0.display())]
    PathConflict(PathBuf),

    /// The remote object has no raw byte content.
    #[error("File `{0}` isn't downloadable")]
    NotDownloadable(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend does not offer this capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A response parsed but broke the protocol.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build an [`Error::Api`] from a status code and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether this error means the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Api { status: 404, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
