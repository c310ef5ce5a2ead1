use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Suffix of in-flight download files; the watcher never reports them.
pub const PARTIAL_SUFFIX: &str = ".dsync-partial";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a remote POSIX path ("/Docs/A.txt") under the local root.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]; `None` for paths outside the root and for the root itself.
pub fn remote_path_for(root: &Path, local: &Path) -> Option<String> {
    let relative = local.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    let remote = PathBuf::from("/").join(relative);
    Some(remote.to_string_lossy().replace('\\', "/"))
}

/// Case-insensitive identity of a path, used as the join key everywhere.
pub fn path_lower(path: &str) -> String {
    path.to_lowercase()
}

/// True when `path_lower` equals `ancestor_lower` or lies beneath it.
pub fn is_same_or_beneath(path_lower: &str, ancestor_lower: &str) -> bool {
    let ancestor = ancestor_lower.trim_end_matches('/');
    if ancestor.is_empty() {
        return true;
    }
    path_lower == ancestor
        || path_lower
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_partial_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_path_under_root() {
        let root = PathBuf::from("/sync");
        let mapped = local_path_for(&root, "/Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/sync/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "/Docs/../../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(local_path_for(&root, ""), Err(PathError::Empty)));
    }

    #[test]
    fn maps_local_path_back_to_remote() {
        let root = Path::new("/sync");
        assert_eq!(
            remote_path_for(root, Path::new("/sync/Docs/A.txt")).as_deref(),
            Some("/Docs/A.txt")
        );
        assert_eq!(remote_path_for(root, Path::new("/sync")), None);
        assert_eq!(remote_path_for(root, Path::new("/elsewhere/A.txt")), None);
    }

    #[test]
    fn lower_path_is_case_insensitive_identity() {
        assert_eq!(path_lower("Foo/Bar.txt"), path_lower("foo/bar.txt"));
        assert_eq!(path_lower("/Docs/Café.TXT"), "/docs/café.txt");
    }

    #[test]
    fn beneath_matches_whole_components_only() {
        assert!(is_same_or_beneath("/docs", "/docs"));
        assert!(is_same_or_beneath("/docs/a.txt", "/docs"));
        assert!(!is_same_or_beneath("/docs2/a.txt", "/docs"));
        assert!(is_same_or_beneath("/anything", "/"));
    }

    #[test]
    fn detects_partial_downloads() {
        assert!(is_partial_file(Path::new("/sync/a.txt.dsync-partial")));
        assert!(!is_partial_file(Path::new("/sync/a.txt")));
    }
}
