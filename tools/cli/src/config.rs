//! Backend selection and client credential loading.

use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use cloudbackup_common::{Error, Result};
use cloudbackup_storage::AuthConfig;

/// Remote store the CLI talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Google Drive.
    Gdrive,
    /// Yandex Disk.
    Yadisk,
    /// Throwaway in-memory store, for dry runs.
    Memory,
}

impl BackendKind {
    /// Directory under the config dir holding credentials and tokens.
    pub fn auth_id(&self) -> Option<&'static str> {
        match self {
            Self::Gdrive => Some("google"),
            Self::Yadisk => Some("yandex"),
            Self::Memory => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gdrive => "gdrive",
            Self::Yadisk => "yadisk",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

/// Google's "installed application" download format.
#[derive(Debug, Deserialize)]
struct InstalledCredentials {
    installed: ClientCredentials,
}

/// `$XDG_CONFIG_HOME/cloudbackup` or the platform equivalent.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("cloudbackup"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
}

/// Path of the client credentials file for an auth id.
pub fn credentials_path(config_dir: &Path, auth_id: &str) -> PathBuf {
    config_dir.join(auth_id).join("credentials.json")
}

/// Build the OAuth configuration for `kind` from its credentials file.
///
/// # Errors
/// - `Config` if the backend has no OAuth or the file is missing
/// - `Serialization` if the file does not have the expected shape
pub fn load_auth_config(kind: BackendKind, config_dir: &Path) -> Result<AuthConfig> {
    let auth_id = kind
        .auth_id()
        .ok_or_else(|| Error::Config(format!("{} storage does not use OAuth", kind)))?;

    let path = credentials_path(config_dir, auth_id);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "credentials file not found for {} (expected {})",
                auth_id,
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    Ok(match kind {
        BackendKind::Gdrive => {
            let creds: InstalledCredentials = serde_json::from_str(&content)?;
            AuthConfig::google(creds.installed.client_id, creds.installed.client_secret)
        }
        _ => {
            let creds: ClientCredentials = serde_json::from_str(&content)?;
            AuthConfig::yandex(creds.client_id, creds.client_secret)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, auth_id: &str, body: &str) {
        let path = credentials_path(dir, auth_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_google_installed_credentials() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "google",
            r#"{"installed": {"client_id": "gid", "client_secret": "gsecret", "project_id": "p"}}"#,
        );

        let config = load_auth_config(BackendKind::Gdrive, dir.path()).unwrap();
        assert_eq!(config.backend, "google");
        assert_eq!(config.client_id, "gid");
        assert_eq!(config.client_secret, "gsecret");
    }

    #[test]
    fn test_yandex_flat_credentials() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "yandex",
            r#"{"client_id": "yid", "client_secret": "ysecret"}"#,
        );

        let config = load_auth_config(BackendKind::Yadisk, dir.path()).unwrap();
        assert_eq!(config.backend, "yandex");
        assert_eq!(config.client_id, "yid");
        assert!(config.redirect_url.is_none());
    }

    #[test]
    fn test_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_auth_config(BackendKind::Yadisk, dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("not found for yandex")));
    }

    #[test]
    fn test_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "google", r#"{"client_id": "x", "client_secret": "y"}"#);
        let err = load_auth_config(BackendKind::Gdrive, dir.path()).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_memory_has_no_oauth() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_auth_config(BackendKind::Memory, dir.path()).is_err());
        assert_eq!(BackendKind::Memory.auth_id(), None);
        assert_eq!(BackendKind::Gdrive.to_string(), "gdrive");
    }
}
