use dsync_core::Metadata;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::oneshot;

use super::index::FileRecord;
use super::paths::path_lower;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    Created,
    Modified,
    Deleted,
}

/// A filesystem change under the local root. `path` is root-relative POSIX ("/Docs/A.txt").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: String,
    pub kind: LocalChange,
    pub is_dir: bool,
}

impl LocalEvent {
    pub fn new(path: impl Into<String>, kind: LocalChange, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChange {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub id: Option<String>,
    pub path_display: String,
    pub path_lower: String,
    pub kind: RemoteChange,
    pub is_folder: bool,
    pub revision: Option<String>,
    pub size: Option<i64>,
    pub server_modified: Option<i64>,
    pub client_modified: Option<i64>,
}

impl RemoteEvent {
    /// Normalizes one delta entry. `known` says whether its id is already in the
    /// metadata store, which decides `Added` versus `Modified`. Entries without
    /// any path are dropped.
    pub fn from_metadata(entry: &Metadata, known: bool) -> Option<Self> {
        let path_display = entry
            .path_display()
            .or(entry.path_lower())?
            .to_string();
        let path_lower = entry
            .path_lower()
            .map(str::to_string)
            .unwrap_or_else(|| path_lower(&path_display));
        let change = if known {
            RemoteChange::Modified
        } else {
            RemoteChange::Added
        };

        Some(match entry {
            Metadata::File(file) => Self {
                id: Some(file.id.clone()),
                path_display,
                path_lower,
                kind: change,
                is_folder: false,
                revision: Some(file.rev.clone()),
                size: Some(i64::try_from(file.size).unwrap_or(i64::MAX)),
                server_modified: parse_timestamp_millis(&file.server_modified),
                client_modified: parse_timestamp_millis(&file.client_modified),
            },
            Metadata::Folder(folder) => Self {
                id: Some(folder.id.clone()),
                path_display,
                path_lower,
                kind: change,
                is_folder: true,
                revision: None,
                size: None,
                server_modified: None,
                client_modified: None,
            },
            Metadata::Deleted(_) => Self {
                id: None,
                path_display,
                path_lower,
                kind: RemoteChange::Removed,
                is_folder: false,
                revision: None,
                size: None,
                server_modified: None,
                client_modified: None,
            },
        })
    }

    /// The metadata row this event describes; `None` for removals.
    pub fn to_record(&self, loaded: bool) -> Option<FileRecord> {
        let id = self.id.clone()?;
        Some(FileRecord {
            id,
            path_display: self.path_display.clone(),
            path_lower: self.path_lower.clone(),
            loaded,
            revision: self.revision.clone(),
            size: self.size,
            server_modified: self.server_modified,
            client_modified: self.client_modified,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    /// A page of the initial recursive listing.
    Listing { has_more: bool },
    /// A page of incremental changes.
    Delta,
}

/// One page of remote changes, applied as a unit. The engine answers on
/// `applied` once the metadata and the page cursor are committed.
#[derive(Debug)]
pub struct RemoteBatch {
    pub events: Vec<RemoteEvent>,
    pub cursor: String,
    pub origin: BatchOrigin,
    pub applied: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub enum SyncEvent {
    Local(LocalEvent),
    Remote(RemoteBatch),
}

pub fn parse_timestamp_millis(value: &str) -> Option<i64> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}
