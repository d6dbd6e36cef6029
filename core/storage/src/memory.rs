//! In-memory backend for testing and dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use cloudbackup_common::{
    Cursor, Error, FileKind, Locator, Page, RemoteFile, Result, SortField, SortKey,
};

use crate::provider::{ByteStream, ChunkAck, RemoteBackend, UploadBody, UploadSession};

/// Id of the root container.
pub const MEMORY_ROOT: &str = "root";

const DOWNLOAD_PIECE: usize = 64 * 1024;

/// One backend call, as recorded in the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List {
        parent: Option<Locator>,
        cursor: Option<Cursor>,
    },
    Lookup(Locator),
    CreateContainer {
        name: String,
        parent: Locator,
    },
    Remove {
        locator: Locator,
        permanent: bool,
    },
    UploadTarget {
        name: String,
        parent: Locator,
        total_size: u64,
    },
    PutWhole {
        name: String,
        len: usize,
    },
    PutChunk {
        name: String,
        offset: u64,
        len: usize,
    },
    Download(Locator),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: FileKind,
    parent: Option<String>,
    data: Vec<u8>,
    trashed: bool,
}

#[derive(Debug)]
struct Session {
    name: String,
    parent: String,
    total: u64,
    received: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, Node>,
    /// Ids in creation order.
    order: Vec<String>,
    sessions: HashMap<String, Session>,
    calls: Vec<Call>,
}

impl State {
    fn container(&self, id: &str) -> Result<&Node> {
        match self.nodes.get(id) {
            Some(node) if !node.trashed && node.kind == FileKind::Directory => Ok(node),
            Some(node) if !node.trashed => Err(Error::InvalidInput(format!(
                "{} is not a container",
                node.name
            ))),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }

    fn insert(&mut self, name: &str, kind: FileKind, parent: &str, data: Vec<u8>) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.nodes.insert(
            id.clone(),
            Node {
                name: name.to_string(),
                kind,
                parent: Some(parent.to_string()),
                data,
                trashed: false,
            },
        );
        self.order.push(id.clone());
        id
    }

    fn remove_tree(&mut self, id: &str) {
        let children: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.as_deref() == Some(id))
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            self.remove_tree(&child);
        }
        self.nodes.remove(id);
        self.order.retain(|other| other != id);
    }

    fn remote_file(&self, id: &str) -> Option<RemoteFile> {
        let node = self.nodes.get(id).filter(|node| !node.trashed)?;
        Some(RemoteFile {
            locator: Locator::new(id).ok()?,
            name: node.name.clone(),
            kind: node.kind,
            size: (node.kind == FileKind::File).then_some(node.data.len() as u64),
        })
    }
}

/// Identifier-addressed backend held entirely in memory.
///
/// Every trait call is appended to a call log that tests can inspect.
/// Chunked sessions can be told to acknowledge fewer bytes than they
/// receive, which exercises the uploader's resume path.
pub struct MemoryBackend {
    state: Mutex<State>,
    root: Locator,
    block_size: Option<usize>,
    ack_limit: Option<usize>,
}

impl MemoryBackend {
    /// Create an empty backend holding only the root container.
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(
            MEMORY_ROOT.to_string(),
            Node {
                name: MEMORY_ROOT.to_string(),
                kind: FileKind::Directory,
                parent: None,
                data: Vec::new(),
                trashed: false,
            },
        );

        Self {
            state: Mutex::new(state),
            root: Locator::from_static(MEMORY_ROOT),
            block_size: Some(1),
            ack_limit: None,
        }
    }

    /// Require chunk lengths to be multiples of `block_size`.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size.max(1));
        self
    }

    /// Accept only whole-body uploads.
    pub fn without_chunking(mut self) -> Self {
        self.block_size = None;
        self
    }

    /// Acknowledge at most `limit` bytes per chunk.
    pub fn with_ack_limit(mut self, limit: usize) -> Self {
        self.ack_limit = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a file.
    pub fn add_file(&self, parent: &Locator, name: &str, data: &[u8]) -> Result<Locator> {
        self.seed(parent, name, FileKind::File, data.to_vec())
    }

    /// Seed a directory.
    pub fn add_directory(&self, parent: &Locator, name: &str) -> Result<Locator> {
        self.seed(parent, name, FileKind::Directory, Vec::new())
    }

    /// Seed a provider-native document with no byte content.
    pub fn add_opaque(&self, parent: &Locator, name: &str) -> Result<Locator> {
        self.seed(parent, name, FileKind::Opaque, Vec::new())
    }

    fn seed(&self, parent: &Locator, name: &str, kind: FileKind, data: Vec<u8>) -> Result<Locator> {
        let mut state = self.lock();
        state.container(parent.as_str())?;
        Locator::new(state.insert(name, kind, parent.as_str(), data))
    }

    /// Content of a stored file.
    pub fn read_file(&self, locator: &Locator) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .nodes
            .get(locator.as_str())
            .filter(|node| node.kind == FileKind::File && !node.trashed)
            .map(|node| node.data.clone())
    }

    /// Find a live child of `parent` by name.
    pub fn find_child(&self, parent: &Locator, name: &str) -> Option<RemoteFile> {
        let state = self.lock();
        let id = state.order.iter().find(|id| {
            state.nodes.get(id.as_str()).is_some_and(|node| {
                !node.trashed
                    && node.name == name
                    && node.parent.as_deref() == Some(parent.as_str())
            })
        })?;
        state.remote_file(id)
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn root(&self) -> &Locator {
        &self.root
    }

    fn chunk_block_size(&self) -> Option<usize> {
        self.block_size
    }

    async fn list(
        &self,
        parent: Option<&Locator>,
        cursor: Option<&Cursor>,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page> {
        let mut state = self.lock();
        state.calls.push(Call::List {
            parent: parent.cloned(),
            cursor: cursor.cloned(),
        });

        if page_size == 0 {
            return Err(Error::InvalidInput("Page size must be positive".to_string()));
        }
        let start = match cursor {
            None => 0,
            Some(Cursor::Token(token)) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| Error::api(400, format!("Invalid page token: {}", token)))?,
            Some(Cursor::Offset(_)) => {
                return Err(Error::InvalidInput(
                    "Memory pages are addressed by token".to_string(),
                ))
            }
        };
        if let Some(parent) = parent {
            state.container(parent.as_str())?;
        }

        let mut items: Vec<RemoteFile> = state
            .order
            .iter()
            .filter(|id| {
                state.nodes.get(id.as_str()).is_some_and(|node| {
                    !node.trashed
                        && match parent {
                            Some(parent) => node.parent.as_deref() == Some(parent.as_str()),
                            None => true,
                        }
                })
            })
            .filter_map(|id| state.remote_file(id))
            .collect();

        match sort.field {
            SortField::Name => items.sort_by(|a, b| a.name.cmp(&b.name)),
            SortField::Size => items.sort_by_key(|item| item.size.unwrap_or(0)),
            SortField::Folder => items.sort_by_key(|item| !item.is_directory()),
            SortField::Created | SortField::Modified => {}
            SortField::Path => {
                return Err(Error::Unsupported(
                    "Memory backend cannot sort by path".to_string(),
                ))
            }
        }
        if sort.descending {
            items.reverse();
        }

        let end = (start + page_size as usize).min(items.len());
        let page_items = items.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < items.len()).then(|| Cursor::Token(format!("page-{}", end)));

        Ok(Page {
            items: page_items,
            next,
        })
    }

    async fn lookup(&self, locator: &Locator) -> Result<Option<RemoteFile>> {
        let mut state = self.lock();
        state.calls.push(Call::Lookup(locator.clone()));
        Ok(state.remote_file(locator.as_str()))
    }

    async fn create_container(&self, name: &str, parent: &Locator) -> Result<Locator> {
        let mut state = self.lock();
        state.calls.push(Call::CreateContainer {
            name: name.to_string(),
            parent: parent.clone(),
        });
        state.container(parent.as_str())?;
        Locator::new(state.insert(name, FileKind::Directory, parent.as_str(), Vec::new()))
    }

    async fn remove(&self, locator: &Locator, permanent: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Remove {
            locator: locator.clone(),
            permanent,
        });
        if locator.as_str() == MEMORY_ROOT {
            return Err(Error::api(403, "The root cannot be removed"));
        }
        if state.remote_file(locator.as_str()).is_none() {
            return Err(Error::NotFound(locator.to_string()));
        }
        if permanent {
            state.remove_tree(locator.as_str());
        } else if let Some(node) = state.nodes.get_mut(locator.as_str()) {
            node.trashed = true;
        }
        Ok(())
    }

    async fn get_upload_target(
        &self,
        name: &str,
        parent: &Locator,
        total_size: u64,
    ) -> Result<UploadSession> {
        let mut state = self.lock();
        state.calls.push(Call::UploadTarget {
            name: name.to_string(),
            parent: parent.clone(),
            total_size,
        });
        state.container(parent.as_str())?;

        let uri = format!("memory://upload/{}", Uuid::new_v4().simple());
        state.sessions.insert(
            uri.clone(),
            Session {
                name: name.to_string(),
                parent: parent.to_string(),
                total: total_size,
                received: Vec::new(),
            },
        );

        Ok(UploadSession {
            name: name.to_string(),
            parent: parent.clone(),
            uri,
            total_size,
        })
    }

    async fn put_whole(&self, session: &UploadSession, body: UploadBody) -> Result<()> {
        let data = body
            .try_fold(Vec::new(), |mut data, chunk| async move {
                data.extend_from_slice(&chunk);
                Ok(data)
            })
            .await?;

        let mut state = self.lock();
        state.calls.push(Call::PutWhole {
            name: session.name.clone(),
            len: data.len(),
        });

        let open = state
            .sessions
            .remove(&session.uri)
            .ok_or_else(|| Error::NotFound(session.uri.clone()))?;
        if data.len() as u64 != open.total {
            return Err(Error::api(
                400,
                format!("Expected {} bytes, got {}", open.total, data.len()),
            ));
        }
        state.insert(&open.name, FileKind::File, &open.parent, data);
        Ok(())
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        data: &[u8],
        offset: u64,
    ) -> Result<ChunkAck> {
        let mut state = self.lock();
        state.calls.push(Call::PutChunk {
            name: session.name.clone(),
            offset,
            len: data.len(),
        });

        let block = self
            .block_size
            .ok_or_else(|| Error::Unsupported("Chunked upload is disabled".to_string()))?;
        let ack_limit = self.ack_limit.unwrap_or(usize::MAX);

        let open = state
            .sessions
            .get_mut(&session.uri)
            .ok_or_else(|| Error::NotFound(session.uri.clone()))?;
        if offset != open.received.len() as u64 {
            return Err(Error::api(
                400,
                format!("Expected offset {}, got {}", open.received.len(), offset),
            ));
        }
        let end = offset + data.len() as u64;
        if end > open.total {
            return Err(Error::api(400, "Chunk runs past the declared size"));
        }
        if end < open.total && data.len() % block != 0 {
            return Err(Error::api(
                400,
                format!("Chunk length {} is not a multiple of {}", data.len(), block),
            ));
        }

        let accepted = data.len().min(ack_limit);
        open.received.extend_from_slice(&data[..accepted]);
        if (open.received.len() as u64) < open.total {
            return Ok(ChunkAck::Partial {
                next_offset: open.received.len() as u64,
            });
        }

        if let Some(done) = state.sessions.remove(&session.uri) {
            state.insert(&done.name, FileKind::File, &done.parent, done.received);
        }
        Ok(ChunkAck::Complete)
    }

    async fn get_download_stream(&self, locator: &Locator) -> Result<ByteStream> {
        let mut state = self.lock();
        state.calls.push(Call::Download(locator.clone()));

        let node = state
            .nodes
            .get(locator.as_str())
            .filter(|node| !node.trashed)
            .ok_or_else(|| Error::NotFound(locator.to_string()))?;
        match node.kind {
            FileKind::File => {}
            FileKind::Opaque => return Err(Error::NotDownloadable(node.name.clone())),
            FileKind::Directory => {
                return Err(Error::InvalidInput(format!(
                    "{} is a directory",
                    node.name
                )))
            }
        }

        let pieces: Vec<Result<Bytes>> = node
            .data
            .chunks(DOWNLOAD_PIECE)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }
}
