use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::paths::{PARTIAL_SUFFIX, PathError, is_partial_file, local_path_for, remote_path_for};

#[derive(Debug, Error)]
pub enum LocalFsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

impl LocalFsError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The synchronized directory on disk, addressed by remote-style paths.
#[derive(Debug, Clone)]
pub struct LocalFolder {
    root: PathBuf,
}

impl LocalFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, remote_path: &str) -> Result<PathBuf, LocalFsError> {
        Ok(local_path_for(&self.root, remote_path)?)
    }

    /// Creates the directory and its parents. Returns `false` when it already existed.
    pub async fn create_directory(&self, remote_path: &str) -> Result<bool, LocalFsError> {
        let target = self.path_for(remote_path)?;
        if tokio::fs::metadata(&target)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|err| LocalFsError::io(&target, err))?;
        Ok(true)
    }

    /// Removes a file or a whole directory tree. Returns `false` when nothing was there.
    pub async fn delete_recursive(&self, remote_path: &str) -> Result<bool, LocalFsError> {
        let target = self.path_for(remote_path)?;
        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(LocalFsError::io(&target, err)),
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match removed {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(LocalFsError::io(&target, err)),
        }
    }

    /// Streams `body` into a sibling `*.dsync-partial` file and renames it over the
    /// target once complete, so readers never observe a half-written file.
    pub async fn write_stream<S, B, E>(&self, remote_path: &str, body: S) -> Result<u64, LocalFsError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let target = self.path_for(remote_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| LocalFsError::io(parent, err))?;
        }
        let partial = partial_path(&target);
        match write_partial(&partial, body).await {
            Ok(written) => {
                tokio::fs::rename(&partial, &target)
                    .await
                    .map_err(|err| LocalFsError::io(&target, err))?;
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(LocalFsError::io(&partial, err))
            }
        }
    }

    /// Opens a file for upload along with its current length.
    pub async fn open_for_read(
        &self,
        remote_path: &str,
    ) -> Result<(tokio::fs::File, u64), LocalFsError> {
        let source = self.path_for(remote_path)?;
        let file = tokio::fs::File::open(&source)
            .await
            .map_err(|err| LocalFsError::io(&source, err))?;
        let len = file
            .metadata()
            .await
            .map_err(|err| LocalFsError::io(&source, err))?
            .len();
        Ok((file, len))
    }

    /// Everything beneath the directory at `remote_path` as `(remote path, is_dir)`,
    /// parents before their children and siblings in name order.
    pub async fn list_tree(&self, remote_path: &str) -> Result<Vec<(String, bool)>, LocalFsError> {
        let mut pending = VecDeque::from([self.path_for(remote_path)?]);
        let mut out = Vec::new();
        while let Some(dir) = pending.pop_front() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| LocalFsError::io(&dir, err))?;
            let mut children = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| LocalFsError::io(&dir, err))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| LocalFsError::io(&path, err))?;
                if file_type.is_symlink() || is_partial_file(&path) {
                    continue;
                }
                children.push((path, file_type.is_dir()));
            }
            children.sort();
            for (path, is_dir) in children {
                let Some(remote) = remote_path_for(&self.root, &path) else {
                    continue;
                };
                out.push((remote, is_dir));
                if is_dir {
                    pending.push_back(path);
                }
            }
        }
        Ok(out)
    }

    /// Empties the root, keeping the directory itself. Creates it when missing.
    pub async fn clear_contents(&self) -> Result<(), LocalFsError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| LocalFsError::io(&self.root, err))?;
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| LocalFsError::io(&self.root, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| LocalFsError::io(&self.root, err))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| LocalFsError::io(&path, err))?;
            let removed = if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            removed.map_err(|err| LocalFsError::io(&path, err))?;
        }
        Ok(())
    }
}

async fn write_partial<S, B, E>(partial: &Path, body: S) -> io::Result<u64>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut file = tokio::fs::File::create(partial).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        let bytes = chunk.as_ref();
        file.write_all(bytes).await?;
        written += bytes.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}
