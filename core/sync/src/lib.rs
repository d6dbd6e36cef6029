//! Tree transfers for cloudbackup.
//!
//! This module drives a [`RemoteBackend`](cloudbackup_storage::RemoteBackend)
//! to move whole trees between the local filesystem and a remote store:
//! - Lazy paginated listing
//! - Resumable chunked upload that resumes at the acknowledged offset
//! - Recursive upload and download with a local overwrite policy
//!
//! Every remote call is awaited before the next one is issued.

pub mod conflict;
pub mod pager;
pub mod tree;
pub mod uploader;

// Re-export main types
pub use conflict::prepare_target;
pub use pager::Pager;
pub use tree::{SyncReport, TreeMapping, TreeSync, TreeSyncConfig};
pub use uploader::{
    ResumableUploader, UploadConfig, UploadReport, UploadState, DEFAULT_CHUNK_SIZE,
    DEFAULT_SINGLE_REQUEST_MAX,
};
