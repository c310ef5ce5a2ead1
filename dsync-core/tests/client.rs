use dsync_core::{DropboxClient, DropboxError, Metadata, SpaceAllocation};
use serde_json::json;
use wiremock::matchers::{
    body_bytes, body_json, body_partial_json, header, header_exists, method, path,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn file_json(id: &str, path_display: &str, rev: &str, size: u64) -> serde_json::Value {
    json!({
        ".tag": "file",
        "id": id,
        "name": path_display.rsplit('/').next().unwrap(),
        "path_display": path_display,
        "path_lower": path_display.to_lowercase(),
        "rev": rev,
        "size": size,
        "server_modified": "2024-01-01T00:00:00Z",
        "client_modified": "2024-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn list_folder_sends_bearer_token_and_root_as_empty_path() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({ "path": "", "recursive": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                file_json("id:a", "/Docs/A.txt", "r1", 12),
                {
                    ".tag": "folder",
                    "id": "id:docs",
                    "name": "Docs",
                    "path_display": "/Docs",
                    "path_lower": "/docs"
                }
            ],
            "cursor": "cursor-1",
            "has_more": true
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder("/", true).await.unwrap();

    assert_eq!(page.cursor, "cursor-1");
    assert!(page.has_more);
    assert_eq!(page.entries.len(), 2);
    match &page.entries[0] {
        Metadata::File(file) => {
            assert_eq!(file.id, "id:a");
            assert_eq!(file.rev, "r1");
            assert_eq!(file.size, 12);
        }
        other => panic!("unexpected entry {other:?}"),
    }
    assert_eq!(page.entries[1].path_lower(), Some("/docs"));
}

#[tokio::test]
async fn list_folder_continue_parses_deleted_entries() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/continue"))
        .and(body_json(json!({ "cursor": "cursor-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {
                    ".tag": "deleted",
                    "name": "Old.txt",
                    "path_display": "/Old.txt",
                    "path_lower": "/old.txt"
                }
            ],
            "cursor": "cursor-2",
            "has_more": false
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder_continue("cursor-1").await.unwrap();

    assert_eq!(page.cursor, "cursor-2");
    assert!(!page.has_more);
    assert!(matches!(&page.entries[0], Metadata::Deleted(d) if d.name == "Old.txt"));
}

#[tokio::test]
async fn get_latest_cursor_returns_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/get_latest_cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "cursor": "latest" })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    assert_eq!(client.get_latest_cursor("/", true).await.unwrap(), "latest");
}

#[tokio::test]
async fn longpoll_reports_changes_and_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/longpoll"))
        .and(body_json(json!({ "cursor": "cursor-1", "timeout": 30 })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "changes": true, "backoff": 5 })),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let result = client.longpoll("cursor-1", 30).await.unwrap();

    assert!(result.changes);
    assert_eq!(result.backoff, Some(5));
}

#[tokio::test]
async fn download_passes_path_in_api_arg_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("dropbox-api-arg", r#"{"path":"/Docs/Hello.txt"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client.download("/Docs/Hello.txt").await.unwrap();

    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");
}

#[tokio::test]
async fn download_maps_missing_path_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/..",
            "error": { ".tag": "path", "path": { ".tag": "not_found" } }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.download("/Missing.txt").await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn upload_sends_body_in_overwrite_mode() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .and(header("content-type", "application/octet-stream"))
        .and(header_exists("dropbox-api-arg"))
        .and(body_bytes(b"payload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_json(
            "id:new",
            "/new.txt",
            "r9",
            7,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let meta = client
        .upload("/new.txt", b"payload".to_vec(), 7)
        .await
        .unwrap();

    assert_eq!(meta.id, "id:new");
    assert_eq!(meta.rev, "r9");

    let requests = server.received_requests().await.unwrap();
    let arg = requests[0]
        .headers
        .get("dropbox-api-arg")
        .and_then(|value| value.to_str().ok())
        .unwrap();
    assert_eq!(
        arg,
        r#"{"autorename":false,"mode":"overwrite","mute":true,"path":"/new.txt"}"#
    );
}

#[tokio::test]
async fn upload_rejects_files_over_single_call_limit() {
    let client = DropboxClient::with_base_url("http://127.0.0.1:9", "test-token").unwrap();
    let err = client
        .upload("/big.bin", Vec::new(), dsync_core::MAX_SINGLE_UPLOAD_BYTES + 1)
        .await
        .unwrap_err();

    assert!(matches!(err, DropboxError::UploadTooLarge { .. }));
}

#[tokio::test]
async fn delete_returns_removed_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .and(body_json(json!({ "path": "/Docs/A.txt" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": file_json("id:a", "/Docs/A.txt", "r1", 1)
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let meta = client.delete("/Docs/A.txt").await.unwrap();

    assert_eq!(meta.path_display(), Some("/Docs/A.txt"));
}

#[tokio::test]
async fn create_folder_returns_folder_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/create_folder_v2"))
        .and(body_partial_json(json!({ "path": "/Docs/New" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {
                "id": "id:new-folder",
                "name": "New",
                "path_display": "/Docs/New",
                "path_lower": "/docs/new"
            }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let folder = client.create_folder("/Docs/New").await.unwrap();

    assert_eq!(folder.id, "id:new-folder");
    assert_eq!(folder.path_lower.as_deref(), Some("/docs/new"));
}

#[tokio::test]
async fn account_and_space_usage_are_parsed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/users/get_current_account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account_id": "dbid:1",
            "name": { "display_name": "Jo Doe", "given_name": "Jo" },
            "email": "jo@example.com"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/users/get_space_usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "used": 256,
            "allocation": { ".tag": "individual", "allocated": 1024 }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let account = client.get_current_account().await.unwrap();
    let usage = client.get_space_usage().await.unwrap();

    assert_eq!(account.name.display_name, "Jo Doe");
    assert_eq!(usage.used, 256);
    assert!(matches!(usage.allocation, SpaceAllocation::Individual { .. }));
    assert_eq!(usage.allocation.allocated(), 1024);
}

#[tokio::test]
async fn unauthorized_is_classified_as_auth_and_rate_limit_keeps_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/continue"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired_access_token"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let auth = client.list_folder_continue("c").await.unwrap_err();
    assert!(auth.is_auth());
    assert!(!auth.is_retryable());

    let limited = client.list_folder("/", true).await.unwrap_err();
    assert!(limited.is_retryable());
    assert_eq!(limited.retry_after_secs(), Some(3));
}
