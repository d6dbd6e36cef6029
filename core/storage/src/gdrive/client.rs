//! Google Drive v3 API client.

use reqwest::{header, redirect, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use cloudbackup_common::{Error, FileKind, Result};

use crate::http::{self, network};
use crate::provider::{ByteStream, ChunkAck, TokenSource, UploadBody};

/// Google Drive API base URL.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
/// Prefix shared by Drive-native documents (Docs, Sheets, ...).
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

const FILE_FIELDS: &str = "id,name,mimeType,size,parents";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,parents)";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// File size in bytes, sent as a string (absent for folders and documents).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    /// Classify the file by MIME type.
    pub fn kind(&self) -> FileKind {
        if self.mime_type == FOLDER_MIME_TYPE {
            FileKind::Directory
        } else if self.mime_type.starts_with(NATIVE_MIME_PREFIX) {
            FileKind::Opaque
        } else {
            FileKind::File
        }
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListResponse {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Query parameters for one `files.list` call.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub q: String,
    pub order_by: String,
    pub page_size: u32,
    pub page_token: Option<String>,
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Create a new Drive client against the public endpoints.
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Self::with_base_urls(tokens, DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    /// Create a client against custom endpoints.
    pub fn with_base_urls(
        tokens: Arc<dyn TokenSource>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Result<Self> {
        // 308 is the resumable "incomplete" answer, not a redirect to follow.
        let http = Client::builder()
            .user_agent(concat!("cloudbackup/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            tokens,
            api_base: api_base.into(),
            upload_base: upload_base.into(),
        })
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.tokens.access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// List one page of files.
    pub async fn list_files(&self, query: &ListQuery) -> Result<FileListResponse> {
        let url = format!("{}/files", self.api_base);
        let auth = self.auth_header().await?;
        let page_size = query.page_size.to_string();

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[
                ("q", query.q.as_str()),
                ("orderBy", query.order_by.as_str()),
                ("pageSize", page_size.as_str()),
                ("fields", LIST_FIELDS),
            ]);

        if let Some(token) = &query.page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| network("Failed to list files", e))?;

        let response = http::check(response, drive_error_message).await?;
        http::json(response).await
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let url = file_url(&self.api_base, file_id)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| network("Failed to get file", e))?;

        let response = http::check(response, drive_error_message).await?;
        http::json(response).await
    }

    /// Create a folder.
    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files", self.api_base);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| network("Failed to create folder", e))?;

        let response = http::check(response, drive_error_message).await?;
        http::json(response).await
    }

    /// Delete a file permanently.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let url = file_url(&self.api_base, file_id)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| network("Failed to delete file", e))?;

        http::check(response, drive_error_message).await?;
        Ok(())
    }

    /// Move a file to the trash.
    pub async fn trash(&self, file_id: &str) -> Result<()> {
        let url = file_url(&self.api_base, file_id)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .patch(url)
            .header(header::AUTHORIZATION, auth)
            .json(&serde_json::json!({ "trashed": true }))
            .send()
            .await
            .map_err(|e| network("Failed to trash file", e))?;

        http::check(response, drive_error_message).await?;
        Ok(())
    }

    /// Start a resumable upload session and return its URI.
    pub async fn start_resumable_upload(
        &self,
        name: &str,
        parent_id: &str,
        total_size: u64,
    ) -> Result<String> {
        let url = format!("{}/files", self.upload_base);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| network("Failed to start resumable upload", e))?;

        let response = http::check(response, drive_error_message).await?;

        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::InvalidResponse("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::InvalidResponse(format!("Invalid upload URI: {}", e)))?
            .to_string();

        debug!("Opened resumable session for {}", name);
        Ok(upload_uri)
    }

    /// Stream the whole body of `len` bytes to a session in one request.
    pub async fn upload_whole(&self, upload_uri: &str, body: UploadBody, len: u64) -> Result<()> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .put(upload_uri)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_LENGTH, len.to_string())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| network("Failed to upload file", e))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            _ => Err(http::unexpected(response, drive_error_message).await),
        }
    }

    /// Upload a chunk to a resumable upload session.
    ///
    /// An empty `data` with `total_size` 0 finalizes an empty file.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: &[u8],
        start_byte: u64,
        total_size: u64,
    ) -> Result<ChunkAck> {
        let auth = self.auth_header().await?;
        let content_range = if data.is_empty() {
            format!("bytes */{}", total_size)
        } else {
            let end_byte = start_byte + data.len() as u64 - 1;
            format!("bytes {}-{}/{}", start_byte, end_byte, total_size)
        };

        let response = self
            .http
            .put(upload_uri)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| network("Failed to upload chunk", e))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(ChunkAck::Complete);
        }
        if status == StatusCode::PERMANENT_REDIRECT {
            // 308 Resume Incomplete; no Range header means nothing was kept.
            let next_offset = match response.headers().get(header::RANGE) {
                Some(value) => {
                    let value = value
                        .to_str()
                        .map_err(|e| Error::InvalidResponse(format!("Invalid Range: {}", e)))?;
                    parse_range_header(value)?
                }
                None => 0,
            };
            return Ok(ChunkAck::Partial { next_offset });
        }

        Err(http::unexpected(response, drive_error_message).await)
    }

    /// Download file as a stream.
    pub async fn download_stream(&self, file_id: &str) -> Result<ByteStream> {
        let url = file_url(&self.api_base, file_id)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| network("Failed to start download", e))?;

        let response = http::check(response, drive_error_message).await?;
        Ok(http::byte_stream(response))
    }
}

/// URL of one file resource. The id is a single percent-encoded path
/// segment, so `/`, `?` and `#` cannot change the request.
pub fn file_url(api_base: &str, file_id: &str) -> Result<Url> {
    let mut url = Url::parse(api_base)
        .map_err(|e| Error::Config(format!("Invalid API base URL {}: {}", api_base, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("API base URL cannot take a path: {}", api_base)))?
        .pop_if_empty()
        .push("files")
        .push(file_id);
    Ok(url)
}

/// Parse the `Range: bytes=0-N` header of a 308 answer into the next offset.
pub fn parse_range_header(value: &str) -> Result<u64> {
    let invalid = || Error::InvalidResponse(format!("Malformed Range header: {}", value));
    let range = value.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    if start.trim() != "0" {
        return Err(invalid());
    }
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    Ok(end + 1)
}

fn drive_error_message(body: &serde_json::Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_file(mime_type: &str, size: Option<&str>) -> DriveFile {
        DriveFile {
            id: "1".to_string(),
            name: "item".to_string(),
            mime_type: mime_type.to_string(),
            size: size.map(str::to_string),
            parents: vec![],
        }
    }

    #[test]
    fn test_drive_file_kind() {
        assert_eq!(drive_file(FOLDER_MIME_TYPE, None).kind(), FileKind::Directory);
        assert_eq!(
            drive_file("application/vnd.google-apps.spreadsheet", None).kind(),
            FileKind::Opaque
        );
        assert_eq!(drive_file("text/plain", Some("3")).kind(), FileKind::File);
    }

    #[test]
    fn test_drive_file_size_bytes() {
        assert_eq!(drive_file("text/plain", Some("12345")).size_bytes(), Some(12345));
        assert_eq!(drive_file(FOLDER_MIME_TYPE, None).size_bytes(), None);
    }

    #[test]
    fn test_drive_file_deserialization() {
        let json = r#"{"id":"abc123","name":"test.txt","mimeType":"text/plain","size":"100"}"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.id, "abc123");
        assert_eq!(file.size_bytes(), Some(100));
        assert!(file.parents.is_empty());
    }

    #[test]
    fn test_file_url_escapes_id() {
        let url = file_url(DRIVE_API_BASE, "abc123").unwrap();
        assert_eq!(url.as_str(), "https://www.googleapis.com/drive/v3/files/abc123");

        let url = file_url("http://127.0.0.1:9000", "x/../y?alt=media#frag").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/files/x%2F..%2Fy%3Falt=media%23frag"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        assert!(matches!(file_url("not a url", "a"), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-262143").unwrap(), 262_144);
        assert_eq!(parse_range_header("bytes=0-0").unwrap(), 1);
        assert!(parse_range_header("bytes=5-10").is_err());
        assert!(parse_range_header("0-10").is_err());
        assert!(parse_range_header("bytes=0-x").is_err());
    }

    #[test]
    fn test_drive_error_message() {
        let body = serde_json::json!({"error": {"code": 403, "message": "Rate limit"}});
        assert_eq!(drive_error_message(&body).as_deref(), Some("Rate limit"));
        assert_eq!(drive_error_message(&serde_json::json!({})), None);
    }
}
