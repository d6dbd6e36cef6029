//! On-disk cache of OAuth credentials.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use cloudbackup_common::Result;

/// Seconds shaved off the expiry so a token is not used as it lapses.
pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 5;

/// OAuth2 credential with expiration tracking.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Absent for providers that only issue access tokens.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-backend credential files under a root directory.
///
/// Each backend gets `<root>/<backend_id>/token.json`. There is no locking:
/// two processes sharing a cache race and the last writer wins.
#[derive(Debug, Clone)]
pub struct TokenStore {
    root: PathBuf,
    skew: Duration,
}

impl TokenStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skew: Duration::seconds(DEFAULT_EXPIRY_SKEW_SECS),
        }
    }

    /// Use a different expiry skew.
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Path of the cache file for a backend.
    pub fn path_for(&self, backend_id: &str) -> PathBuf {
        self.root.join(backend_id).join("token.json")
    }

    /// Load the cached credential.
    ///
    /// Missing, unreadable and corrupt caches all come back as `None`.
    pub async fn load(&self, backend_id: &str) -> Option<Credential> {
        let path = self.path_for(backend_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No token cache at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot read token cache {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!("Ignoring corrupt token cache {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist a credential, creating the backend directory if needed.
    pub async fn save(&self, backend_id: &str, credential: &Credential) -> Result<()> {
        let path = self.path_for(backend_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(credential)?;
        tokio::fs::write(&path, json).await?;
        debug!("Saved token cache {}", path.display());
        Ok(())
    }

    /// Delete the cached credential. A missing cache is not an error.
    pub async fn clear(&self, backend_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(backend_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the credential can be used right now.
    pub fn is_valid(&self, credential: &Credential) -> bool {
        credential.expires_at - self.skew > Utc::now()
    }
}
