//! Google Drive backend implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use cloudbackup_common::{
    Cursor, Error, Locator, Page, RemoteFile, Result, SortField, SortKey,
};

use crate::provider::{
    ByteStream, ChunkAck, RemoteBackend, TokenSource, UploadBody, UploadSession,
    DRIVE_UPLOAD_BLOCK,
};

use super::client::{DriveClient, DriveFile, ListQuery};

/// Id Drive accepts for the top of "My Drive".
pub const DRIVE_ROOT: &str = "root";

/// Google Drive backend.
///
/// Locators are Drive file ids; every object carries its parent ids.
/// Pagination uses the server's opaque `nextPageToken`.
pub struct GDriveBackend {
    client: DriveClient,
    root: Locator,
}

impl GDriveBackend {
    /// Create a backend against the public Drive endpoints.
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Self::with_client(DriveClient::new(tokens)?)
    }

    /// Create a backend around an existing client.
    pub fn with_client(client: DriveClient) -> Result<Self> {
        Ok(Self {
            client,
            root: Locator::new(DRIVE_ROOT)?,
        })
    }

    fn to_remote_file(file: DriveFile) -> Result<RemoteFile> {
        let kind = file.kind();
        let size = file.size_bytes();
        Ok(RemoteFile {
            locator: Locator::new(file.id)?,
            name: file.name,
            kind,
            size,
        })
    }
}

/// Map a sort key onto a Drive `orderBy` expression.
pub fn order_by(sort: SortKey) -> Result<String> {
    let field = match sort.field {
        SortField::Name => "name",
        SortField::Modified => "modifiedTime",
        SortField::Created => "createdTime",
        SortField::Size => "quotaBytesUsed",
        SortField::Folder => "folder",
        SortField::Path => {
            return Err(Error::Unsupported(
                "Google Drive cannot sort by path".to_string(),
            ))
        }
    };
    Ok(if sort.descending {
        format!("{} desc", field)
    } else {
        field.to_string()
    })
}

/// Build the `q` filter for a listing.
fn list_filter(parent: Option<&Locator>) -> String {
    let mut q = String::from("trashed=false and 'me' in owners");
    if let Some(parent) = parent {
        q.push_str(&format!(" and '{}' in parents", parent.as_str().replace('\'', "\\'")));
    }
    q
}

#[async_trait]
impl RemoteBackend for GDriveBackend {
    fn name(&self) -> &str {
        "gdrive"
    }

    fn root(&self) -> &Locator {
        &self.root
    }

    fn chunk_block_size(&self) -> Option<usize> {
        Some(DRIVE_UPLOAD_BLOCK)
    }

    async fn list(
        &self,
        parent: Option<&Locator>,
        cursor: Option<&Cursor>,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page> {
        let page_token = match cursor {
            None => None,
            Some(Cursor::Token(token)) => Some(token.clone()),
            Some(Cursor::Offset(_)) => {
                return Err(Error::InvalidInput(
                    "Google Drive pages are addressed by token".to_string(),
                ))
            }
        };

        let query = ListQuery {
            q: list_filter(parent),
            order_by: order_by(sort)?,
            page_size,
            page_token,
        };
        let response = self.client.list_files(&query).await?;
        debug!("Listed {} files", response.files.len());

        let items = response
            .files
            .into_iter()
            .map(Self::to_remote_file)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            next: response
                .next_page_token
                .filter(|token| !token.is_empty())
                .map(Cursor::Token),
        })
    }

    async fn lookup(&self, locator: &Locator) -> Result<Option<RemoteFile>> {
        match self.client.get_file(locator.as_str()).await {
            Ok(file) => Ok(Some(Self::to_remote_file(file)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, name: &str, parent: &Locator) -> Result<Locator> {
        let folder = self.client.create_folder(name, parent.as_str()).await?;
        info!("Created folder {} ({})", folder.name, folder.id);
        Locator::new(folder.id)
    }

    async fn remove(&self, locator: &Locator, permanent: bool) -> Result<()> {
        if permanent {
            self.client.delete(locator.as_str()).await
        } else {
            self.client.trash(locator.as_str()).await
        }
    }

    async fn get_upload_target(
        &self,
        name: &str,
        parent: &Locator,
        total_size: u64,
    ) -> Result<UploadSession> {
        let uri = self
            .client
            .start_resumable_upload(name, parent.as_str(), total_size)
            .await?;
        Ok(UploadSession {
            name: name.to_string(),
            parent: parent.clone(),
            uri,
            total_size,
        })
    }

    async fn put_whole(&self, session: &UploadSession, body: UploadBody) -> Result<()> {
        self.client
            .upload_whole(&session.uri, body, session.total_size)
            .await
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        data: &[u8],
        offset: u64,
    ) -> Result<ChunkAck> {
        self.client
            .upload_chunk(&session.uri, data, offset, session.total_size)
            .await
    }

    async fn get_download_stream(&self, locator: &Locator) -> Result<ByteStream> {
        self.client.download_stream(locator.as_str()).await
    }
}
