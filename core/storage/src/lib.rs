//! Remote backend abstraction for cloudbackup.
//!
//! This module provides a trait-based interface over structurally different
//! remote stores (Google Drive's id-and-parent graph, Yandex Disk's path
//! tree, and an in-memory store) plus the OAuth2 machinery the HTTP
//! backends authenticate with.
//!
//! # Design Principles
//! - Backend isolation: tree walks only see [`RemoteBackend`]
//! - Async operations: all I/O is async, awaited one request at a time
//! - Streaming downloads: file bodies arrive as a [`ByteStream`]
//! - Unified error semantics: every backend maps onto the common `Error`

pub mod auth;
pub mod gdrive;
mod http;
pub mod memory;
pub mod provider;
pub mod yadisk;

pub use auth::{AuthConfig, AuthenticationFlow, ConsentPrompt, Credential, FlowState, TokenStore};
pub use gdrive::GDriveBackend;
pub use memory::{Call, MemoryBackend};
pub use provider::{
    ByteStream, ChunkAck, RemoteBackend, StaticToken, TokenSource, UploadBody, UploadSession,
    DRIVE_UPLOAD_BLOCK,
};
pub use yadisk::YaDiskBackend;
