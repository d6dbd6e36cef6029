//! Local overwrite policy.

use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

use cloudbackup_common::{Error, Result};

/// Make `path` ready to receive a download.
///
/// A missing path is left alone. An existing one is a conflict unless
/// `overwrite` is set, in which case it is removed (recursively for
/// directories). Removal and the write that follows are not atomic.
///
/// # Errors
/// - `PathConflict` if the path exists and `overwrite` is false; the path
///   is not touched
/// - `Io` if the existing path cannot be removed
pub async fn prepare_target(path: &Path, overwrite: bool) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !overwrite {
        return Err(Error::PathConflict(path.to_path_buf()));
    }

    info!("Replacing existing {}", path.display());
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}
