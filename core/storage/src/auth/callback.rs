//! Loopback listener that receives the OAuth2 redirect.
//!
//! The provider redirects the browser to `http://<listen_addr>/?code=...`.
//! Exactly one connection is accepted; its request line is parsed and the
//! connection stays open until the flow writes a short HTML answer.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use cloudbackup_common::{Error, Result};

/// Upper bound on the request head we are willing to buffer.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// What the redirect carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The user granted access.
    Code { code: String, state: Option<String> },
    /// The provider reported an error, usually `access_denied`.
    Denied {
        error: String,
        description: Option<String>,
    },
    /// Neither a code nor an error was present.
    Malformed,
}

/// Parse the request head of the redirect.
///
/// Only the request target of the first line is looked at, so values that
/// end the query string and values followed by `&` parse the same way.
pub fn parse_callback(request_head: &str) -> CallbackOutcome {
    let target = match request_head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
    {
        Some(target) => target,
        None => return CallbackOutcome::Malformed,
    };

    let url = match url::Url::parse(&format!("http://localhost{}", target)) {
        Ok(url) => url,
        Err(_) => return CallbackOutcome::Malformed,
    };

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return CallbackOutcome::Denied { error, description };
    }
    match code {
        Some(code) if !code.is_empty() => CallbackOutcome::Code { code, state },
        _ => CallbackOutcome::Malformed,
    }
}

/// Listener bound to the fixed redirect address.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    /// Bind the redirect address.
    ///
    /// # Errors
    /// - `Config` when the port cannot be bound; the flow cannot continue
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot listen for the OAuth callback on {}: {}", addr, e)))?;
        debug!("Waiting for OAuth callback on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the single redirect connection and parse it.
    pub async fn accept(self) -> Result<PendingCallback> {
        let (mut stream, peer) = self.listener.accept().await?;
        debug!("OAuth callback connection from {}", peer);

        let mut head = Vec::with_capacity(1024);
        let mut buf = [0u8; 1024];
        while head.len() < MAX_REQUEST_HEAD {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let outcome = parse_callback(&String::from_utf8_lossy(&head));
        Ok(PendingCallback { stream, outcome })
    }
}

/// A parsed redirect whose connection is still open.
pub struct PendingCallback {
    stream: TcpStream,
    outcome: CallbackOutcome,
}

impl PendingCallback {
    pub fn outcome(&self) -> &CallbackOutcome {
        &self.outcome
    }

    /// Write the HTML answer and close the connection.
    pub async fn respond(mut self, success: bool) -> Result<()> {
        let body = if success { SUCCESS_HTML } else { FAILURE_HTML };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>cloudbackup</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 50px;">
    <h1>Authorization complete</h1>
    <p>You can close this window and return to the terminal.</p>
</body>
</html>"#;

const FAILURE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>cloudbackup</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 50px;">
    <h1>Authorization failed</h1>
    <p>Please close this window and try again.</p>
</body>
</html>"#;
