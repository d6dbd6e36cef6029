//! Recursive upload and download of directory trees.

use futures::future::BoxFuture;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use cloudbackup_common::{Error, FileKind, Locator, RemoteFile, Result};
use cloudbackup_storage::RemoteBackend;

use crate::conflict::prepare_target;
use crate::pager::Pager;
use crate::uploader::{ResumableUploader, UploadConfig};

/// Tree sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSyncConfig {
    /// Page size used when listing remote directories.
    pub download_page_size: u32,
    /// Replace local paths that already exist.
    pub overwrite: bool,
}

impl Default for TreeSyncConfig {
    fn default() -> Self {
        Self {
            download_page_size: 1000,
            overwrite: false,
        }
    }
}

/// Local directories and the remote containers they correspond to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMapping {
    entries: Vec<(PathBuf, Locator)>,
}

impl TreeMapping {
    pub fn insert(&mut self, path: PathBuf, locator: Locator) {
        self.entries.push((path, locator));
    }

    pub fn get(&self, path: &Path) -> Option<&Locator> {
        self.entries
            .iter()
            .find(|(known, _)| known == path)
            .map(|(_, locator)| locator)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in the order they were created.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Locator)> {
        self.entries
            .iter()
            .map(|(path, locator)| (path.as_path(), locator))
    }
}

/// Outcome of a tree transfer.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub mapping: TreeMapping,
    pub uploaded: usize,
    pub downloaded: usize,
    /// Names of objects that were passed over.
    pub skipped: Vec<String>,
    /// File bytes transferred.
    pub bytes: u64,
}

/// Walks local and remote trees depth first, one request at a time.
///
/// A container is always created before anything is uploaded into it, and
/// its locator is passed straight down into the recursive call. Each
/// remote directory is listed to the end before any of its children is
/// downloaded.
pub struct TreeSync {
    backend: Arc<dyn RemoteBackend>,
    uploader: ResumableUploader,
    config: TreeSyncConfig,
}

impl TreeSync {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        upload: UploadConfig,
        config: TreeSyncConfig,
    ) -> Self {
        Self {
            uploader: ResumableUploader::new(backend.clone(), upload),
            backend,
            config,
        }
    }

    /// Upload a file or directory tree into `parent` (the root when None).
    pub async fn upload(&self, local: &Path, parent: Option<&Locator>) -> Result<SyncReport> {
        let parent = parent.unwrap_or_else(|| self.backend.root()).clone();
        let mut report = SyncReport::default();

        let metadata = tokio::fs::metadata(local).await?;
        if metadata.is_dir() {
            self.upload_dir(local.to_path_buf(), parent, &mut report)
                .await?;
        } else {
            let sent = self.uploader.upload_file(local, &parent).await?;
            report.uploaded += 1;
            report.bytes += sent.size;
        }

        info!(
            "Uploaded {} files ({} bytes), {} containers created",
            report.uploaded,
            report.bytes,
            report.mapping.len()
        );
        Ok(report)
    }

    fn upload_dir<'a>(
        &'a self,
        dir: PathBuf,
        parent: Locator,
        report: &'a mut SyncReport,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let name = local_name(&dir).await?;
            let container = self.backend.create_container(&name, &parent).await?;
            debug!("Created container {} for {}", container, dir.display());
            report.mapping.insert(dir.clone(), container.clone());

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // Symlinked files are uploaded by content; symlinked
                // directories are never descended into.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    subdirs.push(path);
                } else if file_type.is_file()
                    || (file_type.is_symlink() && points_to_file(&path).await)
                {
                    files.push(path);
                } else {
                    warn!("Skipping {}: not a regular file or directory", path.display());
                    report.skipped.push(path.display().to_string());
                }
            }
            files.sort();
            subdirs.sort();

            for file in files {
                let sent = self.uploader.upload_file(&file, &container).await?;
                report.uploaded += 1;
                report.bytes += sent.size;
            }

            for subdir in subdirs {
                self.upload_dir(subdir, container.clone(), report).await?;
            }
            Ok(())
        })
    }

    /// Download the object at `locator` into `dest_dir`.
    ///
    /// # Errors
    /// - `NotDownloadable` if `locator` itself is opaque; opaque objects
    ///   further down the tree are skipped instead
    /// - `PathConflict` if a target exists and overwrite is off
    pub async fn download(&self, locator: &Locator, dest_dir: &Path) -> Result<SyncReport> {
        let remote = self.backend.get_metadata(locator).await?;
        let mut report = SyncReport::default();
        tokio::fs::create_dir_all(dest_dir).await?;

        match remote.kind {
            FileKind::File => self.download_file(&remote, dest_dir, &mut report).await?,
            FileKind::Directory => {
                self.download_dir(remote, dest_dir.to_path_buf(), &mut report)
                    .await?
            }
            FileKind::Opaque => return Err(Error::NotDownloadable(remote.name)),
        }

        info!(
            "Downloaded {} files ({} bytes), skipped {}",
            report.downloaded,
            report.bytes,
            report.skipped.len()
        );
        Ok(report)
    }

    async fn download_file(
        &self,
        remote: &RemoteFile,
        dest_dir: &Path,
        report: &mut SyncReport,
    ) -> Result<()> {
        let path = dest_dir.join(checked_name(&remote.name)?);
        prepare_target(&path, self.config.overwrite).await?;

        let mut stream = self.backend.get_download_stream(&remote.locator).await?;
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Wrote {} bytes to {}", written, path.display());
        report.downloaded += 1;
        report.bytes += written;
        Ok(())
    }

    fn download_dir<'a>(
        &'a self,
        remote: RemoteFile,
        dest_dir: PathBuf,
        report: &'a mut SyncReport,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = dest_dir.join(checked_name(&remote.name)?);
            prepare_target(&path, self.config.overwrite).await?;
            tokio::fs::create_dir(&path).await?;
            report.mapping.insert(path.clone(), remote.locator.clone());

            let children = Pager::new(
                self.backend.as_ref(),
                Some(remote.locator.clone()),
                self.config.download_page_size,
            )
            .collect_items()
            .await?;

            for child in children {
                match child.kind {
                    FileKind::File => self.download_file(&child, &path, report).await?,
                    FileKind::Directory => {
                        self.download_dir(child, path.clone(), report).await?
                    }
                    FileKind::Opaque => {
                        warn!("Skipping {}: no downloadable content", child.name);
                        report.skipped.push(child.name);
                    }
                }
            }
            Ok(())
        })
    }
}

async fn points_to_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}

async fn local_name(dir: &Path) -> Result<String> {
    let resolved;
    let dir = if dir.file_name().is_some() {
        dir
    } else {
        resolved = tokio::fs::canonicalize(dir).await?;
        resolved.as_path()
    };
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("No usable name for {}", dir.display())))
}

/// Reject remote names that would escape the destination directory.
fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidResponse(format!(
            "Refusing to write remote name {:?}",
            name
        )));
    }
    Ok(name)
}
