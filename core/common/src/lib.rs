//! Common utilities and types shared across cloudbackup modules.
//!
//! This module provides the error taxonomy and the normalized remote data
//! model that every storage backend maps its native responses onto.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Cursor, FileKind, Locator, Page, RemoteFile, SortField, SortKey};
