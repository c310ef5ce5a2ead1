mod client;
mod oauth;

pub use client::{
    AccountName, ApiErrorClass, DEFAULT_API_URL, DEFAULT_CONTENT_URL, DEFAULT_NOTIFY_URL,
    DeletedMetadata, DropboxClient, DropboxError, FileMetadata,
    FolderMetadata, FullAccount, ListFolderResult, LongpollResult, MAX_SINGLE_UPLOAD_BYTES,
    Metadata, SpaceAllocation, SpaceUsage,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
