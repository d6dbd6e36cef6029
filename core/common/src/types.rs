//! Common types used throughout cloudbackup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend-specific reference to a remote file or directory.
///
/// For identifier-addressed stores this is an opaque id, for path-addressed
/// stores it is the full remote path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator(String);

impl Locator {
    /// Create a new Locator from a string.
    ///
    /// # Errors
    /// - Returns error if the locator is empty
    pub fn new(value: impl Into<String>) -> crate::Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Locator cannot be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Locator for a fixed sentinel such as a root id.
    pub fn from_static(value: &'static str) -> Self {
        debug_assert!(!value.is_empty());
        Self(value.to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a remote object is, as far as transfers are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file with downloadable bytes.
    File,
    /// Container of other objects.
    Directory,
    /// Provider-native document with no raw byte content.
    Opaque,
}

impl FileKind {
    /// Single-letter tag used in listings.
    pub fn tag(&self) -> char {
        match self {
            Self::File => 'F',
            Self::Directory => 'D',
            Self::Opaque => 'S',
        }
    }
}

/// Snapshot of a remote object taken from a single list/get call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub locator: Locator,
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes (None for directories and opaque objects).
    pub size: Option<u64>,
}

impl RemoteFile {
    /// Check if this is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.kind.tag(), self.name, self.locator)
    }
}

/// Continuation for the next page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// Opaque server-issued page token.
    Token(String),
    /// Numeric offset into the collection.
    Offset(u64),
}

/// One page of listing results, in server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<RemoteFile>,
    /// None when this is the last page.
    pub next: Option<Cursor>,
}

impl Page {
    /// Number of items on this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the page has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether another page follows.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Field a listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Name,
    Modified,
    Created,
    Size,
    Folder,
    Path,
}

/// Listing order requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    /// Ascending order on `field`.
    pub fn ascending(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Descending order on `field`.
    pub fn descending(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

impl Default for SortKey {
    fn default() -> Self {
        Self::ascending(SortField::Name)
    }
}

impl FromStr for SortKey {
    type Err = crate::Error;

    /// Parses `name`, `modified`, ... and their `rev_` forms.
    fn from_str(s: &str) -> crate::Result<Self> {
        let (descending, field) = match s.strip_prefix("rev_") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field = match field {
            "name" => SortField::Name,
            "modified" => SortField::Modified,
            "created" => SortField::Created,
            "size" => SortField::Size,
            "folder" => SortField::Folder,
            "path" => SortField::Path,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "Unknown sort key: {}",
                    other
                )))
            }
        };
        Ok(Self { field, descending })
    }
}
