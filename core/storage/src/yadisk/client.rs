//! Yandex Disk REST API client.

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use cloudbackup_common::{Error, Result};

use crate::http::{self, network};
use crate::provider::{ByteStream, TokenSource, UploadBody};

/// Yandex Disk API base URL.
pub const DISK_API_BASE: &str = "https://cloud-api.yandex.net/v1/disk";

/// Resource metadata from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    pub name: String,
    /// Full path, e.g. `disk:/photos/cat.png`.
    pub path: String,
    /// `dir` or `file`.
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Children, present when a directory is requested.
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<ResourceList>,
}

impl Resource {
    pub fn is_dir(&self) -> bool {
        self.resource_type == "dir"
    }
}

/// One window of a directory's children.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub items: Vec<Resource>,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub total: u64,
}

/// Flat file listing response.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesResponse {
    #[serde(default)]
    pub items: Vec<Resource>,
}

/// Short-lived URL returned for uploads and downloads.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub href: String,
}

/// Yandex Disk API client.
pub struct DiskClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    api_base: String,
}

impl DiskClient {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Self::with_base_url(tokens, DISK_API_BASE)
    }

    /// Create a client against a custom endpoint.
    pub fn with_base_url(tokens: Arc<dyn TokenSource>, api_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("cloudbackup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            tokens,
            api_base: api_base.into(),
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.tokens.access_token().await?;
        Ok(format!("OAuth {}", token))
    }

    /// Get a resource, with up to `limit` children starting at `offset`.
    pub async fn get_resource(
        &self,
        path: &str,
        limit: u32,
        offset: u64,
        sort: Option<&str>,
    ) -> Result<Resource> {
        let url = format!("{}/resources", self.api_base);
        let auth = self.auth_header().await?;
        let limit = limit.to_string();
        let offset = offset.to_string();

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[
                ("path", path),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ]);
        if let Some(sort) = sort {
            request = request.query(&[("sort", sort)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| network("Failed to get resource", e))?;

        let response = http::check(response, disk_error_message).await?;
        http::json(response).await
    }

    /// List every file on the disk, directories excluded.
    pub async fn list_files(&self, limit: u32, offset: u64, sort: &str) -> Result<FilesResponse> {
        let url = format!("{}/resources/files", self.api_base);
        let auth = self.auth_header().await?;
        let limit = limit.to_string();
        let offset = offset.to_string();

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
                ("sort", sort),
            ])
            .send()
            .await
            .map_err(|e| network("Failed to list files", e))?;

        let response = http::check(response, disk_error_message).await?;
        http::json(response).await
    }

    /// Create a directory.
    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let url = format!("{}/resources", self.api_base);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .put(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| network("Failed to create directory", e))?;

        http::check(response, disk_error_message).await?;
        Ok(())
    }

    /// Delete a resource. Directory removal may finish asynchronously (202).
    pub async fn delete(&self, path: &str, permanently: bool) -> Result<()> {
        let url = format!("{}/resources", self.api_base);
        let auth = self.auth_header().await?;
        let permanently = permanently.to_string();

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("path", path), ("permanently", permanently.as_str())])
            .send()
            .await
            .map_err(|e| network("Failed to delete resource", e))?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(path.to_string())),
            _ => Err(http::unexpected(response, disk_error_message).await),
        }
    }

    /// Ask for an upload URL for a new file.
    pub async fn upload_link(&self, path: &str) -> Result<String> {
        let url = format!("{}/resources/upload", self.api_base);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("path", path), ("overwrite", "false")])
            .send()
            .await
            .map_err(|e| network("Failed to request upload link", e))?;

        let response = http::check(response, disk_error_message).await?;
        let link: Link = http::json(response).await?;
        if link.href.is_empty() {
            return Err(Error::InvalidResponse("Empty upload link".to_string()));
        }
        Ok(link.href)
    }

    /// Stream `len` bytes of file content to an upload URL.
    pub async fn put_to_link(&self, href: &str, body: UploadBody, len: u64) -> Result<()> {
        let response = self
            .http
            .put(href)
            .header(header::CONTENT_LENGTH, len.to_string())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| network("Failed to upload file", e))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            _ => Err(http::unexpected(response, disk_error_message).await),
        }
    }

    /// Ask for a download URL. An empty link means the file has no raw bytes.
    pub async fn download_link(&self, path: &str) -> Result<Option<String>> {
        let url = format!("{}/resources/download", self.api_base);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| network("Failed to request download link", e))?;

        let response = http::check(response, disk_error_message).await?;
        let link: Link = http::json(response).await?;
        Ok(Some(link.href).filter(|href| !href.is_empty()))
    }

    /// Stream the bytes behind a download URL.
    pub async fn fetch(&self, href: &str) -> Result<ByteStream> {
        debug!("Fetching download link");
        let response = self
            .http
            .get(href)
            .send()
            .await
            .map_err(|e| network("Failed to start download", e))?;

        let response = http::check(response, disk_error_message).await?;
        Ok(http::byte_stream(response))
    }
}

fn disk_error_message(body: &serde_json::Value) -> Option<String> {
    ["description", "message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}
