use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
pub const DEFAULT_NOTIFY_URL: &str = "https://notify.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Largest body accepted by a single `/2/files/upload` call.
pub const MAX_SINGLE_UPLOAD_BYTES: u64 = 150 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("file of {size} bytes exceeds the single upload limit of {limit} bytes")]
    UploadTooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    notify_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(
            DEFAULT_API_URL,
            DEFAULT_CONTENT_URL,
            DEFAULT_NOTIFY_URL,
            token,
        )
    }

    /// Points every endpoint family at one host, which is what the mock servers in tests do.
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(base_url, base_url, base_url, token)
    }

    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        notify_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DropboxError> {
        Ok(Self {
            http: Client::new(),
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            notify_url: Url::parse(notify_url)?,
            token: token.into(),
        })
    }

    pub async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc(
            "/2/files/list_folder",
            &serde_json::json!({
                "path": root_aware(path),
                "recursive": recursive,
                "include_deleted": false,
            }),
        )
        .await
    }

    pub async fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc(
            "/2/files/list_folder/continue",
            &serde_json::json!({ "cursor": cursor }),
        )
        .await
    }

    pub async fn get_latest_cursor(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<String, DropboxError> {
        let result: LatestCursor = self
            .rpc(
                "/2/files/list_folder/get_latest_cursor",
                &serde_json::json!({ "path": root_aware(path), "recursive": recursive }),
            )
            .await?;
        Ok(result.cursor)
    }

    /// Blocks until the account changes after `cursor` or `timeout_secs` elapses.
    /// This endpoint is unauthenticated: the cursor itself identifies the account.
    pub async fn longpoll(
        &self,
        cursor: &str,
        timeout_secs: u64,
    ) -> Result<LongpollResult, DropboxError> {
        let url = self.notify_url.join("/2/files/list_folder/longpoll")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "cursor": cursor, "timeout": timeout_secs }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Returns the raw response so the caller can stream the body to disk.
    pub async fn download(&self, path: &str) -> Result<reqwest::Response, DropboxError> {
        let url = self.content_url.join("/2/files/download")?;
        let request = self
            .authorized(self.http.post(url))
            .header(API_ARG_HEADER, api_arg(&serde_json::json!({ "path": path }))?);
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn upload(
        &self,
        path: &str,
        body: impl Into<reqwest::Body>,
        size: u64,
    ) -> Result<FileMetadata, DropboxError> {
        if size > MAX_SINGLE_UPLOAD_BYTES {
            return Err(DropboxError::UploadTooLarge {
                size,
                limit: MAX_SINGLE_UPLOAD_BYTES,
            });
        }
        let url = self.content_url.join("/2/files/upload")?;
        let arg = api_arg(&serde_json::json!({
            "path": path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        }))?;
        let response = self
            .authorized(self.http.post(url))
            .header(API_ARG_HEADER, arg)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", size)
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<Metadata, DropboxError> {
        let result: MetadataResult<Metadata> = self
            .rpc("/2/files/delete_v2", &serde_json::json!({ "path": path }))
            .await?;
        Ok(result.metadata)
    }

    pub async fn create_folder(&self, path: &str) -> Result<FolderMetadata, DropboxError> {
        let result: MetadataResult<FolderMetadata> = self
            .rpc(
                "/2/files/create_folder_v2",
                &serde_json::json!({ "path": path, "autorename": false }),
            )
            .await?;
        Ok(result.metadata)
    }

    pub async fn get_current_account(&self) -> Result<FullAccount, DropboxError> {
        self.rpc_without_arg("/2/users/get_current_account").await
    }

    pub async fn get_space_usage(&self) -> Result<SpaceUsage, DropboxError> {
        self.rpc_without_arg("/2/users/get_space_usage").await
    }

    async fn rpc<A: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        arg: &A,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .authorized(self.http.post(url))
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn rpc_without_arg<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self.authorized(self.http.post(url)).send().await?;
        Self::handle_response(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DropboxError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DropboxError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        DropboxError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl DropboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DropboxError::Api { status, .. } => Some(classify_api_status(*status)),
            DropboxError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    /// Path errors come back as 409 with a tagged summary such as `path_lookup/not_found/`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DropboxError::Api { status, body, .. }
                if *status == StatusCode::CONFLICT && body.contains("not_found")
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DropboxError::Api { status, body, .. }
                if *status == StatusCode::CONFLICT && body.contains("conflict")
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DropboxError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// The API names the account root "" rather than "/".
fn root_aware(path: &str) -> &str {
    if path == "/" { "" } else { path }
}

/// Header values must be ASCII, so everything else is sent as JSON `\u` escapes.
fn api_arg<A: Serialize>(arg: &A) -> Result<String, DropboxError> {
    let json = serde_json::to_string(arg)?;
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn path_display(&self) -> Option<&str> {
        match self {
            Metadata::File(file) => file.path_display.as_deref(),
            Metadata::Folder(folder) => folder.path_display.as_deref(),
            Metadata::Deleted(deleted) => deleted.path_display.as_deref(),
        }
    }

    pub fn path_lower(&self) -> Option<&str> {
        match self {
            Metadata::File(file) => file.path_lower.as_deref(),
            Metadata::Folder(folder) => folder.path_lower.as_deref(),
            Metadata::Deleted(deleted) => deleted.path_lower.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    pub rev: String,
    pub size: u64,
    pub server_modified: String,
    pub client_modified: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LongpollResult {
    pub changes: bool,
    #[serde(default)]
    pub backoff: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LatestCursor {
    cursor: String,
}

#[derive(Debug, Deserialize)]
struct MetadataResult<T> {
    metadata: T,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FullAccount {
    pub account_id: String,
    pub name: AccountName,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocation: SpaceAllocation,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum SpaceAllocation {
    Individual { allocated: u64 },
    Team { allocated: u64 },
}

impl SpaceAllocation {
    pub fn allocated(&self) -> u64 {
        match self {
            SpaceAllocation::Individual { allocated } | SpaceAllocation::Team { allocated } => {
                *allocated
            }
        }
    }
}
