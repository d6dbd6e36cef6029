//! Yandex Disk backend.
//!
//! Path-addressed: locators are `disk:/...` paths, listings page by
//! offset, and downloads go through a short-lived signed link.

pub mod client;
pub mod provider;

pub use client::DiskClient;
pub use provider::{YaDiskBackend, DISK_ROOT};
