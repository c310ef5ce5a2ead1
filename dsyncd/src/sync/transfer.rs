use dsync_core::{DropboxClient, DropboxError, FileMetadata, MAX_SINGLE_UPLOAD_BYTES};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use super::local_fs::{LocalFolder, LocalFsError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("local file error: {0}")]
    Local(#[from] LocalFsError),
    #[error("file of {size} bytes exceeds the single upload limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
}

impl TransferError {
    pub fn as_api(&self) -> Option<&DropboxError> {
        match self {
            TransferError::Api(err) => Some(err),
            _ => None,
        }
    }
}

/// Moves file content between Dropbox and the local folder.
#[derive(Clone)]
pub struct TransferClient {
    client: DropboxClient,
}

impl TransferClient {
    pub fn new(client: DropboxClient) -> Self {
        Self { client }
    }

    /// Downloads `remote_path` into the same path under `folder`; returns bytes written.
    pub async fn download(
        &self,
        remote_path: &str,
        folder: &LocalFolder,
    ) -> Result<u64, TransferError> {
        let response = self.client.download(remote_path).await?;
        let written = folder
            .write_stream(remote_path, response.bytes_stream())
            .await?;
        Ok(written)
    }

    /// Uploads the local file at `remote_path` in overwrite mode.
    pub async fn upload(
        &self,
        remote_path: &str,
        folder: &LocalFolder,
    ) -> Result<FileMetadata, TransferError> {
        let (file, size) = folder.open_for_read(remote_path).await?;
        if size > MAX_SINGLE_UPLOAD_BYTES {
            return Err(TransferError::TooLarge {
                size,
                limit: MAX_SINGLE_UPLOAD_BYTES,
            });
        }
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        Ok(self.client.upload(remote_path, body, size).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_file_to_target_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/download"))
            .and(header("dropbox-api-arg", r#"{"path":"/nested/out.txt"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let folder = LocalFolder::new(dir.path());
        let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();

        let written = TransferClient::new(client)
            .download("/nested/out.txt", &folder)
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(dir.path().join("nested/out.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/download"))
            .respond_with(ResponseTemplate::new(409).set_body_string("path/not_found/"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let folder = LocalFolder::new(dir.path());
        let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();

        let err = TransferClient::new(client)
            .download("/gone.txt", &folder)
            .await
            .unwrap_err();

        assert!(err.as_api().is_some_and(DropboxError::is_not_found));
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn uploads_file_contents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/upload"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "id:in",
                "name": "in.bin",
                "path_display": "/in.bin",
                "path_lower": "/in.bin",
                "rev": "r1",
                "size": 7,
                "server_modified": "2024-01-01T00:00:00Z",
                "client_modified": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("in.bin"), b"payload").unwrap();
        let folder = LocalFolder::new(dir.path());
        let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();

        let meta = TransferClient::new(client)
            .upload("/in.bin", &folder)
            .await
            .unwrap();

        assert_eq!(meta.id, "id:in");
        assert_eq!(meta.size, 7);
    }

    #[tokio::test]
    async fn upload_of_missing_file_is_local_error() {
        let dir = tempdir().unwrap();
        let folder = LocalFolder::new(dir.path());
        let client = DropboxClient::with_base_url("http://127.0.0.1:9", "test-token").unwrap();

        let err = TransferClient::new(client)
            .upload("/missing.bin", &folder)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Local(_)));
    }
}
