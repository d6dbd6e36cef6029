//! Yandex Disk backend against a mocked REST API.

use futures::{stream, TryStreamExt};
use std::sync::Arc;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cloudbackup_common::{Cursor, Error, FileKind, Locator, SortField, SortKey};
use cloudbackup_storage::yadisk::{DiskClient, YaDiskBackend};
use cloudbackup_storage::{RemoteBackend, StaticToken};

fn backend(server: &MockServer) -> YaDiskBackend {
    let client =
        DiskClient::with_base_url(Arc::new(StaticToken::new("ya-token")), server.uri()).unwrap();
    YaDiskBackend::with_client(client).unwrap()
}

fn items(range: std::ops::Range<u64>) -> Vec<serde_json::Value> {
    range
        .map(|i| {
            serde_json::json!({
                "name": format!("f{}", i),
                "path": format!("disk:/docs/f{}", i),
                "type": "file",
                "size": i
            })
        })
        .collect()
}

#[tokio::test]
async fn test_list_uses_total_for_continuation() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(header("Authorization", "OAuth ya-token"))
        .and(query_param("path", "disk:/docs"))
        .and(query_param("offset", "20"))
        .and(query_param("limit", "20"))
        .and(query_param("sort", "-size"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "docs",
            "path": "disk:/docs",
            "type": "dir",
            "_embedded": {"items": items(20..40), "limit": 20, "offset": 20, "total": 45}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(query_param("offset", "40"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "docs",
            "path": "disk:/docs",
            "type": "dir",
            "_embedded": {"items": items(40..45), "limit": 20, "offset": 40, "total": 45}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    let docs = Locator::new("/docs").unwrap();
    let sort = SortKey::descending(SortField::Size);

    let page = backend
        .list(Some(&docs), Some(&Cursor::Offset(20)), 20, sort)
        .await
        .unwrap();
    assert_eq!(page.len(), 20);
    assert_eq!(page.next, Some(Cursor::Offset(40)));

    let page = backend
        .list(Some(&docs), page.next.as_ref(), 20, sort)
        .await
        .unwrap();
    assert_eq!(page.len(), 5);
    assert!(page.next.is_none());
}

#[tokio::test]
async fn test_flat_listing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources/files"))
        .and(query_param("limit", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": items(0..3), "limit": 3, "offset": 0
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let page = backend
        .list(None, None, 3, SortKey::default())
        .await
        .unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(page.items[2].locator.as_str(), "disk:/docs/f2");
    assert_eq!(page.next, Some(Cursor::Offset(3)));
}

#[tokio::test]
async fn test_folder_sort_unsupported() {
    let server = MockServer::start().await;
    let backend = backend(&server);
    let root = backend.root().clone();

    let err = backend
        .list(Some(&root), None, 20, SortKey::ascending(SortField::Folder))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn test_lookup_and_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(query_param("path", "disk:/report.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "report.pdf", "path": "disk:/report.pdf", "type": "file", "size": 2048
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(query_param("path", "disk:/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "description": "Resource not found.", "error": "DiskNotFoundError"
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let file = backend
        .get_metadata(&Locator::new("disk:/report.pdf").unwrap())
        .await
        .unwrap();
    assert_eq!(file.kind, FileKind::File);
    assert_eq!(file.size, Some(2048));

    assert!(backend
        .lookup(&Locator::new("/gone").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_create_container_joins_path() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/resources"))
        .and(query_param("path", "disk:/backup/2024"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "href": "https://cloud-api.yandex.net/v1/disk/resources?path=disk%3A%2Fbackup%2F2024",
            "method": "GET"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    let parent = Locator::new("disk:/backup").unwrap();
    let locator = backend.create_container("2024", &parent).await.unwrap();
    assert_eq!(locator.as_str(), "disk:/backup/2024");
}

#[tokio::test]
async fn test_conflict_error_uses_description() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/resources"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "description": "Specified path already exists.",
            "error": "DiskPathPointsToExistentDirectoryError"
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.root().clone();
    match backend.create_container("docs", &root).await.unwrap_err() {
        Error::Api { status, message } => {
            assert_eq!(status, 409);
            assert_eq!(message, "Specified path already exists.");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_whole_upload_through_link() {
    let server = MockServer::start().await;
    let href = format!("{}/upload-target/abc", server.uri());

    Mock::given(method("GET"))
        .and(path("/resources/upload"))
        .and(query_param("path", "disk:/notes.txt"))
        .and(query_param("overwrite", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "href": href, "method": "PUT", "templated": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/upload-target/abc"))
        .and(header("Content-Length", "5"))
        .and(body_bytes(b"hello".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    assert_eq!(backend.chunk_block_size(), None);

    let root = backend.root().clone();
    let session = backend
        .get_upload_target("notes.txt", &root, 5)
        .await
        .unwrap();
    let body = stream::iter(vec![
        Ok(bytes::Bytes::from_static(b"hel")),
        Ok(bytes::Bytes::from_static(b"lo")),
    ]);
    backend.put_whole(&session, Box::pin(body)).await.unwrap();

    let err = backend.put_chunk(&session, b"hello", 0).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn test_download_via_signed_link() {
    let server = MockServer::start().await;
    let href = format!("{}/signed/xyz", server.uri());

    Mock::given(method("GET"))
        .and(path("/resources/download"))
        .and(query_param("path", "disk:/a.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "href": href, "method": "GET"
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/signed/xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let stream = backend
        .get_download_stream(&Locator::new("/a.txt").unwrap())
        .await
        .unwrap();
    let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"abc");
}

#[tokio::test]
async fn test_empty_download_link_is_not_downloadable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources/download"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "href": "", "method": "GET"
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let result = backend
        .get_download_stream(&Locator::new("disk:/doc").unwrap())
        .await;
    assert!(matches!(result, Err(Error::NotDownloadable(_))));
}

#[tokio::test]
async fn test_remove_accepts_async_deletion() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/resources"))
        .and(query_param("path", "disk:/old"))
        .and(query_param("permanently", "true"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "href": "https://cloud-api.yandex.net/v1/disk/operations/1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    backend
        .remove(&Locator::new("/old").unwrap(), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_foreign_namespace_rejected() {
    let server = MockServer::start().await;
    let backend = backend(&server);

    let err = backend
        .remove(&Locator::new("trash:/x").unwrap(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}
