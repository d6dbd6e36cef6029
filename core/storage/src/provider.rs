//! Remote backend trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use cloudbackup_common::{Cursor, Error, Locator, Page, RemoteFile, Result, SortKey};

/// Byte stream type for download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Byte stream type for whole-body uploads. It must yield exactly the
/// session's `total_size` bytes.
pub type UploadBody = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

/// Block size resumable upload chunks must be a multiple of on Google Drive.
pub const DRIVE_UPLOAD_BLOCK: usize = 256 * 1024;

/// Server-allocated upload target.
///
/// Created when an upload starts and dropped when it completes or aborts.
/// Sessions are never persisted, so an interrupted upload restarts from a
/// fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Name the uploaded file will get.
    pub name: String,
    /// Container the file is uploaded into.
    pub parent: Locator,
    /// Provider URI that accepts the bytes.
    pub uri: String,
    /// Total number of bytes the session expects.
    pub total_size: u64,
}

/// Server answer to one chunk of a resumable upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    /// All bytes received; the file exists remotely.
    Complete,
    /// The server holds bytes `[0, next_offset)`; the next send starts there.
    Partial { next_offset: u64 },
}

/// Source of bearer tokens for HTTP backends.
///
/// Called before every request so that an expired credential is refreshed
/// before it is used.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return an access token that is valid right now.
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, for tests and pre-issued credentials.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Normalized contract over structurally different remote stores.
///
/// Identifier-addressed stores (opaque ids with parent links) and
/// path-addressed stores both implement this, so tree walks never need to
/// know which one they talk to.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get the backend name (e.g., "gdrive", "yadisk").
    fn name(&self) -> &str;

    /// Locator of the top-level container.
    fn root(&self) -> &Locator;

    /// Block size chunk lengths must be a multiple of, or None when the
    /// backend only accepts whole-body uploads.
    fn chunk_block_size(&self) -> Option<usize>;

    /// List one page of objects.
    ///
    /// With `parent` set, lists the direct children of that container;
    /// without it, lists every file the account owns. `cursor` is the
    /// continuation returned by the previous page, or None for the first.
    async fn list(
        &self,
        parent: Option<&Locator>,
        cursor: Option<&Cursor>,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page>;

    /// Look up an object, returning None when it does not exist.
    async fn lookup(&self, locator: &Locator) -> Result<Option<RemoteFile>>;

    /// Get metadata for an object.
    ///
    /// # Errors
    /// - `NotFound` if the locator does not resolve
    async fn get_metadata(&self, locator: &Locator) -> Result<RemoteFile> {
        self.lookup(locator)
            .await?
            .ok_or_else(|| Error::NotFound(locator.to_string()))
    }

    /// Create a container named `name` inside `parent`.
    async fn create_container(&self, name: &str, parent: &Locator) -> Result<Locator>;

    /// Remove an object, either to the trash or permanently.
    async fn remove(&self, locator: &Locator, permanent: bool) -> Result<()>;

    /// Open an upload session for a new file.
    async fn get_upload_target(
        &self,
        name: &str,
        parent: &Locator,
        total_size: u64,
    ) -> Result<UploadSession>;

    /// Stream the whole body in one request.
    async fn put_whole(&self, session: &UploadSession, body: UploadBody) -> Result<()>;

    /// Send `data` as the byte range starting at `offset`.
    async fn put_chunk(&self, session: &UploadSession, data: &[u8], offset: u64)
        -> Result<ChunkAck>;

    /// Stream the raw bytes of a file.
    async fn get_download_stream(&self, locator: &Locator) -> Result<ByteStream>;
}
