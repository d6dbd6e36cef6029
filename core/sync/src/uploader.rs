//! Resumable chunked upload.

use futures::{stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use cloudbackup_common::{Error, Locator, Result};
use cloudbackup_storage::{ChunkAck, RemoteBackend, UploadBody, UploadSession, DRIVE_UPLOAD_BLOCK};

/// Default chunk length: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * DRIVE_UPLOAD_BLOCK;

/// Files up to this size go up in one request by default.
pub const DEFAULT_SINGLE_REQUEST_MAX: u64 = 5 * 1024 * 1024;

/// Upload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Length of every chunk but the last.
    pub chunk_size: usize,
    /// Largest file sent as a single whole-body request, or None to always
    /// chunk when the backend supports it.
    pub single_request_max: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            single_request_max: Some(DEFAULT_SINGLE_REQUEST_MAX),
        }
    }
}

impl UploadConfig {
    /// Chunked-only configuration with the given chunk length.
    pub fn chunked(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            single_request_max: None,
        }
    }

    /// Check the chunk length against a backend's block size.
    ///
    /// # Errors
    /// - `InvalidInput` if the chunk length is zero or not a multiple of `block`
    pub fn validate(&self, block: usize) -> Result<()> {
        if self.chunk_size == 0 || block == 0 || self.chunk_size % block != 0 {
            return Err(Error::InvalidInput(format!(
                "Chunk size {} must be a positive multiple of {}",
                self.chunk_size, block
            )));
        }
        Ok(())
    }
}

/// Lifecycle of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    SessionOpened,
    ChunkSent,
    Complete,
    Aborted,
}

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub name: String,
    pub size: u64,
    /// Number of chunk requests sent (0 on the whole-body path).
    pub chunks: usize,
    /// Whether the body went up in a single request.
    pub whole_body: bool,
}

/// Sends files to a backend, one request at a time.
///
/// After every chunk the next send starts at exactly the offset the server
/// acknowledged. Any error aborts the session; there is no retry, so a
/// caller that wants one starts a fresh upload.
pub struct ResumableUploader {
    backend: Arc<dyn RemoteBackend>,
    config: UploadConfig,
    state: Mutex<UploadState>,
}

impl ResumableUploader {
    pub fn new(backend: Arc<dyn RemoteBackend>, config: UploadConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(UploadState::Init),
        }
    }

    /// State of the most recent upload.
    pub fn state(&self) -> UploadState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: UploadState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Upload a local file into `parent`, keeping its file name.
    pub async fn upload_file(&self, path: &Path, parent: &Locator) -> Result<UploadReport> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("No usable file name in {}", path.display()))
            })?
            .to_string();

        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.upload_reader(file, size, &name, parent).await
    }

    /// Upload `total` bytes from `reader` as `name` inside `parent`.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        total: u64,
        name: &str,
        parent: &Locator,
    ) -> Result<UploadReport>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + Sync + 'static,
    {
        self.set_state(UploadState::Init);
        let result = self.run(reader, total, name, parent).await;
        self.set_state(match result {
            Ok(_) => UploadState::Complete,
            Err(_) => UploadState::Aborted,
        });
        result
    }

    async fn run<R>(
        &self,
        mut reader: R,
        total: u64,
        name: &str,
        parent: &Locator,
    ) -> Result<UploadReport>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + Sync + 'static,
    {
        let block = self.backend.chunk_block_size();
        if let Some(block) = block {
            self.config.validate(block)?;
        }

        let session = self
            .backend
            .get_upload_target(name, parent, total)
            .await?;
        self.set_state(UploadState::SessionOpened);

        let whole_body = match (block, self.config.single_request_max) {
            (None, _) => true,
            (Some(_), Some(max)) => total <= max,
            (Some(_), None) => false,
        };

        let chunks = if whole_body {
            info!("Uploading {} ({} bytes) in one request", name, total);
            let body = body_stream(reader, total, name.to_string());
            self.backend.put_whole(&session, body).await?;
            0
        } else {
            info!("Uploading {} ({} bytes) in chunks", name, total);
            self.send_chunks(&mut reader, &session).await?
        };

        info!("Uploaded {}", name);
        Ok(UploadReport {
            name: name.to_string(),
            size: total,
            chunks,
            whole_body,
        })
    }

    async fn send_chunks<R>(&self, reader: &mut R, session: &UploadSession) -> Result<usize>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let total = session.total_size;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut offset = 0u64;
        let mut chunks = 0usize;

        loop {
            // Bounded by chunk_size, so the cast cannot truncate.
            let len = (total - offset).min(self.config.chunk_size as u64) as usize;
            reader.seek(SeekFrom::Start(offset)).await?;
            reader.read_exact(&mut buf[..len]).await?;

            let end = offset + len as u64;
            debug!("Sending bytes {}..{} of {}", offset, end, total);
            let ack = self
                .backend
                .put_chunk(session, &buf[..len], offset)
                .await?;
            chunks += 1;
            self.set_state(UploadState::ChunkSent);

            match ack {
                ChunkAck::Complete if end == total => return Ok(chunks),
                ChunkAck::Complete => {
                    return Err(Error::InvalidResponse(format!(
                        "Upload reported complete after {} of {} bytes",
                        end, total
                    )))
                }
                ChunkAck::Partial { next_offset } if next_offset > end => {
                    return Err(Error::InvalidResponse(format!(
                        "Server acknowledged {} bytes but only {} were sent",
                        next_offset, end
                    )))
                }
                ChunkAck::Partial { next_offset } if next_offset <= offset => {
                    return Err(Error::InvalidResponse(format!(
                        "Upload stalled at offset {}",
                        offset
                    )))
                }
                ChunkAck::Partial { next_offset } if next_offset >= total => {
                    return Err(Error::InvalidResponse(format!(
                        "All {} bytes acknowledged but the upload is not complete",
                        total
                    )))
                }
                ChunkAck::Partial { next_offset } => {
                    if next_offset < end {
                        debug!("Server kept {} of {} bytes, resuming", next_offset - offset, len);
                    }
                    offset = next_offset;
                }
            }
        }
    }
}

/// Stream exactly `total` bytes of `reader`, failing if it ends early.
fn body_stream<R>(reader: R, total: u64, name: String) -> UploadBody
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
{
    let chunks = ReaderStream::new(reader.take(total));
    Box::pin(stream::try_unfold(
        (chunks, 0u64, name),
        move |(mut chunks, sent, name)| async move {
            match chunks.try_next().await? {
                Some(chunk) => {
                    let sent = sent + chunk.len() as u64;
                    Ok(Some((chunk, (chunks, sent, name))))
                }
                None if sent < total => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} ended after {} of {} bytes", name, sent, total),
                ))),
                None => Ok(None),
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbackup_storage::{Call, MemoryBackend};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn chunk_calls(backend: &MemoryBackend) -> Vec<(u64, usize)> {
        backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PutChunk { offset, len, .. } => Some((offset, len)),
                _ => None,
            })
            .collect()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn upload(
        backend: &Arc<MemoryBackend>,
        config: UploadConfig,
        bytes: &[u8],
    ) -> (ResumableUploader, Result<UploadReport>) {
        let uploader = ResumableUploader::new(backend.clone(), config);
        let root = backend.root().clone();
        let result = uploader
            .upload_reader(Cursor::new(bytes.to_vec()), bytes.len() as u64, "f.bin", &root)
            .await;
        (uploader, result)
    }

    #[tokio::test]
    async fn test_chunk_count_and_lengths() {
        let backend = Arc::new(MemoryBackend::new().with_block_size(4));
        let bytes = data(30);

        let (uploader, result) = upload(&backend, UploadConfig::chunked(8), &bytes).await;
        let report = result.unwrap();

        let calls = chunk_calls(&backend);
        assert_eq!(calls.len(), 4); // ceil(30 / 8)
        assert_eq!(calls.iter().map(|(_, len)| len).sum::<usize>(), 30);
        assert_eq!(calls.last(), Some(&(24, 6)));
        assert_eq!(report.chunks, 4);
        assert!(!report.whole_body);
        assert_eq!(uploader.state(), UploadState::Complete);

        let file = backend.find_child(backend.root(), "f.bin").unwrap();
        assert_eq!(backend.read_file(&file.locator).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, result) = upload(&backend, UploadConfig::chunked(8), &data(16)).await;
        result.unwrap();
        assert_eq!(chunk_calls(&backend), vec![(0, 8), (8, 8)]);
    }

    #[tokio::test]
    async fn test_resume_at_acknowledged_offset() {
        let backend = Arc::new(MemoryBackend::new().with_ack_limit(5));
        let bytes = data(20);

        let (_, result) = upload(&backend, UploadConfig::chunked(8), &bytes).await;
        result.unwrap();

        assert_eq!(
            chunk_calls(&backend),
            vec![(0, 8), (5, 8), (10, 8), (15, 5)]
        );
        let file = backend.find_child(backend.root(), "f.bin").unwrap();
        assert_eq!(backend.read_file(&file.locator).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_empty_file_is_one_empty_chunk() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, result) = upload(&backend, UploadConfig::chunked(8), &[]).await;

        assert_eq!(result.unwrap().chunks, 1);
        assert_eq!(chunk_calls(&backend), vec![(0, 0)]);
        let file = backend.find_child(backend.root(), "f.bin").unwrap();
        assert_eq!(file.size, Some(0));
    }

    #[tokio::test]
    async fn test_stalled_upload_aborts() {
        let backend = Arc::new(MemoryBackend::new().with_ack_limit(0));
        let (uploader, result) = upload(&backend, UploadConfig::chunked(8), &data(20)).await;

        assert!(matches!(result, Err(Error::InvalidResponse(_))));
        assert_eq!(chunk_calls(&backend).len(), 1);
        assert_eq!(uploader.state(), UploadState::Aborted);
    }

    #[tokio::test]
    async fn test_small_file_takes_whole_body_path() {
        let backend = Arc::new(MemoryBackend::new());
        let config = UploadConfig {
            chunk_size: 8,
            single_request_max: Some(16),
        };
        let (_, result) = upload(&backend, config, &data(16)).await;

        let report = result.unwrap();
        assert!(report.whole_body);
        assert!(chunk_calls(&backend).is_empty());
        assert!(backend.calls().contains(&Call::PutWhole {
            name: "f.bin".to_string(),
            len: 16,
        }));
    }

    #[tokio::test]
    async fn test_backend_without_chunking_gets_whole_body() {
        let backend = Arc::new(MemoryBackend::new().without_chunking());
        let (_, result) = upload(&backend, UploadConfig::chunked(8), &data(100)).await;

        assert!(result.unwrap().whole_body);
        assert!(chunk_calls(&backend).is_empty());
    }

    #[tokio::test]
    async fn test_large_whole_body_round_trips() {
        let backend = Arc::new(MemoryBackend::new().without_chunking());
        let bytes = data(3 * 1024 * 1024 + 17);

        let (uploader, result) = upload(&backend, UploadConfig::default(), &bytes).await;
        let report = result.unwrap();

        assert!(report.whole_body);
        assert_eq!(report.size, bytes.len() as u64);
        assert_eq!(uploader.state(), UploadState::Complete);
        let file = backend.find_child(backend.root(), "f.bin").unwrap();
        assert_eq!(backend.read_file(&file.locator).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_short_reader_aborts_whole_body() {
        let backend = Arc::new(MemoryBackend::new().without_chunking());
        let uploader = ResumableUploader::new(backend.clone(), UploadConfig::default());
        let root = backend.root().clone();

        let result = uploader
            .upload_reader(Cursor::new(data(10)), 20, "f.bin", &root)
            .await;

        assert!(
            matches!(result, Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof)
        );
        assert_eq!(uploader.state(), UploadState::Aborted);
        assert!(backend.find_child(backend.root(), "f.bin").is_none());
    }

    #[tokio::test]
    async fn test_chunk_size_must_match_block() {
        let backend = Arc::new(MemoryBackend::new().with_block_size(4));
        let (uploader, result) = upload(&backend, UploadConfig::chunked(6), &data(20)).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(backend.calls().is_empty());
        assert_eq!(uploader.state(), UploadState::Aborted);
    }

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        config.validate(DRIVE_UPLOAD_BLOCK).unwrap();
        assert!(UploadConfig::chunked(0).validate(DRIVE_UPLOAD_BLOCK).is_err());
        assert!(UploadConfig::chunked(100_000)
            .validate(DRIVE_UPLOAD_BLOCK)
            .is_err());
    }

    #[tokio::test]
    async fn test_upload_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let uploader = ResumableUploader::new(backend.clone(), UploadConfig::default());
        let report = uploader
            .upload_file(&path, backend.root())
            .await
            .unwrap();

        assert_eq!(report.name, "notes.txt");
        assert_eq!(report.size, 5);
        let file = backend.find_child(backend.root(), "notes.txt").unwrap();
        assert_eq!(backend.read_file(&file.locator).unwrap(), b"hello");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_partial_acks_reconstruct_file(
            bytes in proptest::collection::vec(any::<u8>(), 0..600),
            chunk in 1usize..64,
            ack in 1usize..64,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let backend = Arc::new(MemoryBackend::new().with_ack_limit(ack));
            let (_, result) =
                runtime.block_on(upload(&backend, UploadConfig::chunked(chunk), &bytes));
            prop_assert!(result.is_ok());

            // Each send starts right after the bytes the previous one kept.
            let calls = chunk_calls(&backend);
            let mut expected = 0u64;
            for (offset, len) in &calls {
                prop_assert_eq!(*offset, expected);
                prop_assert!(*len <= chunk);
                expected += (*len).min(ack) as u64;
            }
            prop_assert_eq!(expected, bytes.len() as u64);

            let file = backend.find_child(backend.root(), "f.bin").unwrap();
            prop_assert_eq!(backend.read_file(&file.locator).unwrap(), bytes);
        }
    }
}
