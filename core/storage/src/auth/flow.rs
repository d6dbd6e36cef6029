//! Token lifecycle: cached credential, refresh grant, or interactive consent.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use cloudbackup_common::{Error, Result};

use crate::provider::TokenSource;

use super::callback::{CallbackListener, CallbackOutcome};
use super::config::AuthConfig;
use super::token_store::{Credential, TokenStore};

type OAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Where the flow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Start,
    AwaitConsent,
    AwaitCallback,
    ExchangeCode,
    Issued,
    Denied,
    Failed,
}

/// Shows the authorization URL to the user.
pub trait ConsentPrompt: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens the default browser, printing the URL when that is not possible.
pub struct SystemBrowser;

impl ConsentPrompt for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        if let Err(e) = open::that(url) {
            warn!("Could not launch a browser: {}", e);
            eprintln!("Open this URL in your browser to authorize access:\n\n    {}\n", url);
        }
        Ok(())
    }
}

/// Obtains usable access tokens for one backend.
///
/// Order of preference: the in-memory credential, the on-disk cache, a
/// refresh-token grant, and finally the browser consent flow with a
/// loopback redirect listener.
pub struct AuthenticationFlow {
    config: AuthConfig,
    store: TokenStore,
    client: OAuthClient,
    http: reqwest::Client,
    prompt: Box<dyn ConsentPrompt>,
    cached: tokio::sync::Mutex<Option<Credential>>,
    state: Mutex<FlowState>,
}

impl AuthenticationFlow {
    /// Create a flow for the configured backend.
    ///
    /// # Errors
    /// - `Config` when an endpoint URL does not parse
    pub fn new(config: AuthConfig, store: TokenStore) -> Result<Self> {
        let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_type(AuthType::RequestBody)
            .set_auth_uri(
                AuthUrl::new(config.auth_url.clone())
                    .map_err(|e| Error::Config(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| Error::Config(format!("Invalid token URL: {}", e)))?,
            );

        if let Some(redirect) = &config.redirect_url {
            client = client.set_redirect_uri(
                RedirectUrl::new(redirect.clone())
                    .map_err(|e| Error::Config(format!("Invalid redirect URL: {}", e)))?,
            );
        }

        // Following redirects from the token endpoint is an SSRF hazard.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            store,
            client,
            http,
            prompt: Box::new(SystemBrowser),
            cached: tokio::sync::Mutex::new(None),
            state: Mutex::new(FlowState::Start),
        })
    }

    /// Replace the browser launcher.
    pub fn with_prompt(mut self, prompt: impl ConsentPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn backend_id(&self) -> &str {
        &self.config.backend
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FlowState) {
        debug!("Auth flow for {} -> {:?}", self.config.backend, state);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Return an access token that is valid right now.
    ///
    /// # Errors
    /// - `AuthDenied` if the user declined consent
    /// - `AuthExchangeFailed` if the token endpoint rejected the code
    /// - `Network` if the token endpoint could not be reached
    /// - `Config` if the loopback port cannot be bound
    pub async fn authenticate(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if self.store.is_valid(credential) {
                return Ok(credential.access_token.clone());
            }
        }

        let stored = match cached.take() {
            Some(credential) => Some(credential),
            None => self.store.load(&self.config.backend).await,
        };

        let credential = match stored {
            Some(credential) if self.store.is_valid(&credential) => {
                debug!("Using cached token for {}", self.config.backend);
                self.set_state(FlowState::Issued);
                credential
            }
            Some(Credential {
                refresh_token: Some(refresh_token),
                ..
            }) => match self.refresh(&refresh_token).await {
                Ok(credential) => credential,
                Err(Error::AuthExchangeFailed(reason)) => {
                    warn!("Refresh rejected ({}), asking for consent again", reason);
                    self.consent().await?
                }
                Err(e) => return Err(e),
            },
            _ => self.consent().await?,
        };

        let token = credential.access_token.clone();
        *cached = Some(credential);
        Ok(token)
    }

    /// Forget the credential, in memory and on disk.
    pub async fn logout(&self) -> Result<()> {
        self.cached.lock().await.take();
        self.store.clear(&self.config.backend).await?;
        self.set_state(FlowState::Start);
        info!("Removed stored credentials for {}", self.config.backend);
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        info!("Refreshing access token for {}", self.config.backend);

        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(token_error)?;

        let credential = credential_from(&response, Some(refresh_token));
        self.store.save(&self.config.backend, &credential).await?;
        self.set_state(FlowState::Issued);
        Ok(credential)
    }

    async fn consent(&self) -> Result<Credential> {
        let result = self.run_consent().await;
        match &result {
            Ok(_) => self.set_state(FlowState::Issued),
            Err(Error::AuthDenied(_)) => self.set_state(FlowState::Denied),
            Err(_) => self.set_state(FlowState::Failed),
        }
        result
    }

    async fn run_consent(&self) -> Result<Credential> {
        self.set_state(FlowState::Start);
        // Bind first so a busy port fails before the user is sent anywhere.
        let listener = CallbackListener::bind(self.config.socket_addr()?).await?;

        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        for (name, value) in &self.config.extra_params {
            request = request.add_extra_param(name.as_str(), value.as_str());
        }
        let (auth_url, csrf_token) = request.url();

        self.set_state(FlowState::AwaitConsent);
        info!("Requesting consent for {}", self.config.backend);
        self.prompt.open(auth_url.as_str())?;

        self.set_state(FlowState::AwaitCallback);
        let pending = listener.accept().await?;

        let result = match pending.outcome().clone() {
            CallbackOutcome::Denied { error, description } => {
                Err(Error::AuthDenied(description.unwrap_or(error)))
            }
            CallbackOutcome::Malformed => Err(Error::AuthExchangeFailed(
                "Callback carried neither a code nor an error".to_string(),
            )),
            CallbackOutcome::Code { state, .. }
                if state.as_deref() != Some(csrf_token.secret().as_str()) =>
            {
                Err(Error::AuthExchangeFailed(
                    "Callback state does not match the request".to_string(),
                ))
            }
            CallbackOutcome::Code { code, .. } => {
                self.set_state(FlowState::ExchangeCode);
                self.exchange_code(code).await
            }
        };

        if let Err(e) = pending.respond(result.is_ok()).await {
            warn!("Could not answer the OAuth callback: {}", e);
        }
        result
    }

    async fn exchange_code(&self, code: String) -> Result<Credential> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(&self.http)
            .await
            .map_err(token_error)?;

        let credential = credential_from(&response, None);
        self.store.save(&self.config.backend, &credential).await?;
        info!("Obtained new credentials for {}", self.config.backend);
        Ok(credential)
    }
}

#[async_trait]
impl TokenSource for AuthenticationFlow {
    async fn access_token(&self) -> Result<String> {
        self.authenticate().await
    }
}

/// Build a credential from a token response, keeping the previous refresh
/// token when the server does not rotate it.
fn credential_from(response: &BasicTokenResponse, previous_refresh: Option<&str>) -> Credential {
    let expires_in = response
        .expires_in()
        .unwrap_or_else(|| std::time::Duration::from_secs(DEFAULT_EXPIRES_IN_SECS));
    let expires_at = Utc::now()
        + Duration::from_std(expires_in)
            .unwrap_or_else(|_| Duration::seconds(DEFAULT_EXPIRES_IN_SECS as i64));

    Credential {
        access_token: response.access_token().secret().to_string(),
        refresh_token: response
            .refresh_token()
            .map(|t| t.secret().to_string())
            .or_else(|| previous_refresh.map(str::to_string)),
        expires_at,
    }
}

fn token_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            Error::AuthExchangeFailed(response.to_string())
        }
        RequestTokenError::Request(e) => {
            Error::Network(format!("Token endpoint unreachable: {}", e))
        }
        RequestTokenError::Parse(e, _) => {
            Error::AuthExchangeFailed(format!("Unparseable token response: {}", e))
        }
        RequestTokenError::Other(message) => Error::AuthExchangeFailed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct NoBrowser;

    impl ConsentPrompt for NoBrowser {
        fn open(&self, _url: &str) -> Result<()> {
            panic!("consent must not be requested");
        }
    }

    #[test]
    fn test_new_flow_starts_in_start_state() {
        let dir = TempDir::new().unwrap();
        let flow = AuthenticationFlow::new(
            AuthConfig::google("id", "secret"),
            TokenStore::new(dir.path()),
        )
        .unwrap();
        assert_eq!(flow.state(), FlowState::Start);
        assert_eq!(flow.backend_id(), "google");
    }

    #[test]
    fn test_invalid_token_url() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig::yandex("id", "secret").with_token_url("not a url");
        let result = AuthenticationFlow::new(config, TokenStore::new(dir.path()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_logout_clears_cache() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path());
        let credential = Credential {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
        };
        store.save("yandex", &credential).await.unwrap();

        let flow = AuthenticationFlow::new(AuthConfig::yandex("id", "secret"), store.clone())
            .unwrap()
            .with_prompt(NoBrowser);
        assert_eq!(flow.authenticate().await.unwrap(), "a");

        flow.logout().await.unwrap();
        assert!(store.load("yandex").await.is_none());
    }
}
