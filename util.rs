//! Small filesystem helpers shared across components.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

/// `path` with `suffix` appended to its file name: `a/encrypted` + `.bak`
/// gives `a/encrypted.bak`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(suffix);
    path.with_file_name(name)
}

/// Remove a file or directory tree. Returns `Ok(false)` if nothing was there.
pub fn remove_path(path: &Path) -> io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path).map(|_| true),
        Ok(_) => std::fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether anything exists at `path`. Errors count as absent.
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Absolute form of `path` as the OS would resolve it: the longest existing
/// prefix is canonicalized (symlinks and `..` followed), the missing rest is
/// normalized lexically. `path` itself need not exist.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut base = absolute.as_path();
    let mut missing = Vec::new();
    let mut resolved = loop {
        match base.canonicalize() {
            Ok(real) => break real,
            Err(_) => match (base.parent(), base.components().next_back()) {
                (Some(parent), Some(last)) => {
                    missing.push(last);
                    base = parent;
                }
                _ => break base.to_path_buf(),
            },
        }
    };

    for component in missing.into_iter().rev() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}

/// Flush directory metadata so a preceding rename survives a crash.
/// No-op where directories cannot be opened for syncing.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::File::open(parent)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
