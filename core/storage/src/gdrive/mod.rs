//! Google Drive backend.
//!
//! This module provides a storage backend using Google Drive v3 with:
//! - Id-addressed objects with explicit parent links
//! - Token-based pagination
//! - Resumable uploads in 256 KiB multiples

pub mod client;
pub mod provider;

pub use client::DriveClient;
pub use provider::{GDriveBackend, DRIVE_ROOT};
