//! Response checking shared by the HTTP backends.

use futures::StreamExt;
use reqwest::{Response, StatusCode};

use cloudbackup_common::{Error, Result};

use crate::provider::ByteStream;

/// Pulls a human-readable message out of a provider error body.
pub(crate) type MessageExtractor = fn(&serde_json::Value) -> Option<String>;

/// Wrap a transport failure.
pub(crate) fn network(context: &str, err: reqwest::Error) -> Error {
    Error::Network(format!("{}: {}", context, err))
}

/// Pass successful responses through; turn everything else into a typed error.
///
/// 404 becomes `NotFound`, any other non-success status becomes `Api` with
/// the provider's message when the body carries one.
pub(crate) async fn check(response: Response, extract: MessageExtractor) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response, extract).await;
    if status == StatusCode::NOT_FOUND {
        Err(Error::NotFound(message))
    } else {
        Err(Error::api(status.as_u16(), message))
    }
}

/// Build an `Api` error from a response already known to be unexpected.
pub(crate) async fn unexpected(response: Response, extract: MessageExtractor) -> Error {
    let status = response.status().as_u16();
    Error::api(status, error_message(response, extract).await)
}

/// Parse a JSON body.
pub(crate) async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::InvalidResponse(format!("Failed to parse response: {}", e)))
}

/// Turn a response body into a [`ByteStream`].
pub(crate) fn byte_stream(response: Response) -> ByteStream {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| network("Stream read error", e)));
    Box::pin(stream)
}

async fn error_message(response: Response, extract: MessageExtractor) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| extract(&value))
        .or_else(|| (!body.is_empty()).then(|| body.clone()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
}
