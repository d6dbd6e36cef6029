//! Yandex Disk backend implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use cloudbackup_common::{
    Cursor, Error, FileKind, Locator, Page, RemoteFile, Result, SortField, SortKey,
};

use crate::provider::{ByteStream, ChunkAck, RemoteBackend, TokenSource, UploadBody, UploadSession};

use super::client::{DiskClient, Resource};

/// Path of the disk root.
pub const DISK_ROOT: &str = "disk:/";

/// Yandex Disk backend.
///
/// Locators are full `disk:/...` paths and pages are addressed by offset.
pub struct YaDiskBackend {
    client: DiskClient,
    root: Locator,
}

impl YaDiskBackend {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Self::with_client(DiskClient::new(tokens)?)
    }

    pub fn with_client(client: DiskClient) -> Result<Self> {
        Ok(Self {
            client,
            root: Locator::new(DISK_ROOT)?,
        })
    }

    fn to_remote_file(resource: Resource) -> Result<RemoteFile> {
        let kind = if resource.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        Ok(RemoteFile {
            locator: Locator::new(resource.path)?,
            name: resource.name,
            kind,
            size: if kind == FileKind::File {
                resource.size
            } else {
                None
            },
        })
    }
}

/// Bring a user-supplied path into `disk:/...` form.
///
/// # Errors
/// - `InvalidInput` for paths in another namespace (`app:/`, `trash:/`, ...)
pub fn normalize_path(locator: &str) -> Result<String> {
    if locator.starts_with("disk:") {
        return Ok(locator.to_string());
    }
    if let Some((scheme, _)) = locator.split_once(':') {
        if !scheme.contains('/') {
            return Err(Error::InvalidInput(format!(
                "Unsupported Yandex Disk path: {}",
                locator
            )));
        }
    }
    Ok(if locator.starts_with('/') {
        format!("disk:{}", locator)
    } else {
        format!("disk:/{}", locator)
    })
}

/// Path of `name` inside the directory at `parent`.
pub fn join_path(parent: &str, name: &str) -> Result<String> {
    let parent = normalize_path(parent)?;
    Ok(if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    })
}

/// Map a sort key onto the `sort` query parameter.
pub fn sort_param(sort: SortKey) -> Result<String> {
    let field = match sort.field {
        SortField::Name => "name",
        SortField::Path => "path",
        SortField::Created => "created",
        SortField::Modified => "modified",
        SortField::Size => "size",
        SortField::Folder => {
            return Err(Error::Unsupported(
                "Yandex Disk cannot sort folders first".to_string(),
            ))
        }
    };
    Ok(if sort.descending {
        format!("-{}", field)
    } else {
        field.to_string()
    })
}

fn offset_of(cursor: Option<&Cursor>) -> Result<u64> {
    match cursor {
        None => Ok(0),
        Some(Cursor::Offset(offset)) => Ok(*offset),
        Some(Cursor::Token(_)) => Err(Error::InvalidInput(
            "Yandex Disk pages are addressed by offset".to_string(),
        )),
    }
}

#[async_trait]
impl RemoteBackend for YaDiskBackend {
    fn name(&self) -> &str {
        "yadisk"
    }

    fn root(&self) -> &Locator {
        &self.root
    }

    fn chunk_block_size(&self) -> Option<usize> {
        None
    }

    async fn list(
        &self,
        parent: Option<&Locator>,
        cursor: Option<&Cursor>,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page> {
        let offset = offset_of(cursor)?;
        let sort = sort_param(sort)?;

        let Some(parent) = parent else {
            let response = self.client.list_files(page_size, offset, &sort).await?;
            let full_page = page_size > 0 && response.items.len() as u64 == u64::from(page_size);
            let next = offset + response.items.len() as u64;
            let items = response
                .items
                .into_iter()
                .map(Self::to_remote_file)
                .collect::<Result<Vec<_>>>()?;
            return Ok(Page {
                items,
                next: full_page.then_some(Cursor::Offset(next)),
            });
        };

        let path = normalize_path(parent.as_str())?;
        let resource = self
            .client
            .get_resource(&path, page_size, offset, Some(&sort))
            .await?;

        let Some(embedded) = resource.embedded else {
            // A file has no children.
            return Ok(Page {
                items: Vec::new(),
                next: None,
            });
        };

        let next = embedded.offset + embedded.items.len() as u64;
        let more = !embedded.items.is_empty() && next < embedded.total;
        debug!("Listed {} of {} entries in {}", embedded.items.len(), embedded.total, path);

        let items = embedded
            .items
            .into_iter()
            .map(Self::to_remote_file)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            next: more.then_some(Cursor::Offset(next)),
        })
    }

    async fn lookup(&self, locator: &Locator) -> Result<Option<RemoteFile>> {
        let path = normalize_path(locator.as_str())?;
        match self.client.get_resource(&path, 1, 0, None).await {
            Ok(resource) => Ok(Some(Self::to_remote_file(resource)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, name: &str, parent: &Locator) -> Result<Locator> {
        let path = join_path(parent.as_str(), name)?;
        self.client.create_dir(&path).await?;
        info!("Created directory {}", path);
        Locator::new(path)
    }

    async fn remove(&self, locator: &Locator, permanent: bool) -> Result<()> {
        let path = normalize_path(locator.as_str())?;
        self.client.delete(&path, permanent).await
    }

    async fn get_upload_target(
        &self,
        name: &str,
        parent: &Locator,
        total_size: u64,
    ) -> Result<UploadSession> {
        let path = join_path(parent.as_str(), name)?;
        let uri = self.client.upload_link(&path).await?;
        Ok(UploadSession {
            name: name.to_string(),
            parent: parent.clone(),
            uri,
            total_size,
        })
    }

    async fn put_whole(&self, session: &UploadSession, body: UploadBody) -> Result<()> {
        self.client
            .put_to_link(&session.uri, body, session.total_size)
            .await
    }

    async fn put_chunk(
        &self,
        _session: &UploadSession,
        _data: &[u8],
        _offset: u64,
    ) -> Result<ChunkAck> {
        Err(Error::Unsupported(
            "Yandex Disk does not accept chunked uploads".to_string(),
        ))
    }

    async fn get_download_stream(&self, locator: &Locator) -> Result<ByteStream> {
        let path = normalize_path(locator.as_str())?;
        match self.client.download_link(&path).await? {
            Some(href) => self.client.fetch(&href).await,
            None => Err(Error::NotDownloadable(path)),
        }
    }
}
