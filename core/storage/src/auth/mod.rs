//! OAuth2 authentication for the HTTP backends.
//!
//! - [`TokenStore`]: per-backend credential cache on disk
//! - [`AuthenticationFlow`]: cached token, refresh grant or browser consent
//! - [`CallbackListener`]: single-shot loopback listener for the redirect

pub mod callback;
pub mod config;
pub mod flow;
pub mod token_store;

pub use callback::{parse_callback, CallbackListener, CallbackOutcome, PendingCallback};
pub use config::AuthConfig;
pub use flow::{AuthenticationFlow, ConsentPrompt, FlowState, SystemBrowser};
pub use token_store::{Credential, TokenStore};
