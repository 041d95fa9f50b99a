//! Folder <-> single compressed archive file.
//!
//! Archives are gzip-compressed tarballs at maximum compression. Entry names
//! are relative to the packed folder, so unpacking into any folder reproduces
//! the same tree.

use crate::container_ops::PLAINTEXT_PART_SUFFIX;
use crate::error::{DriveError, Result};
use crate::util::{sync_parent_dir, with_suffix};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Where [`pack`] writes `archive` before renaming it into place.
pub fn partial_path(archive: &Path) -> PathBuf {
    with_suffix(archive, PLAINTEXT_PART_SUFFIX)
}

/// Pack `folder` into a new archive at `archive`, replacing any file there.
pub async fn pack(folder: &Path, archive: &Path) -> Result<PathBuf> {
    let folder = folder.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&folder, &archive))
        .await
        .map_err(|e| DriveError::archive(format!("pack task failed: {}", e)))?
}

/// Extract `archive` into `folder`, creating the folder if needed.
pub async fn unpack(archive: &Path, folder: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let folder = folder.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &folder))
        .await
        .map_err(|e| DriveError::archive(format!("unpack task failed: {}", e)))?
}

fn pack_blocking(folder: &Path, archive: &Path) -> Result<PathBuf> {
    if !folder.is_dir() {
        return Err(DriveError::archive(format!(
            "source folder {} does not exist",
            folder.display()
        )));
    }

    let tmp = partial_path(archive);
    let result = build_archive(folder, &tmp).and_then(|entries| {
        std::fs::rename(&tmp, archive).map_err(|e| {
            DriveError::archive(format!("moving archive into {}: {}", archive.display(), e))
        })?;
        sync_parent_dir(archive)
            .map_err(|e| DriveError::archive(format!("syncing {}: {}", archive.display(), e)))?;
        Ok(entries)
    });

    match result {
        Ok(entries) => {
            info!(folder = %folder.display(), archive = %archive.display(), entries, "folder packed");
            Ok(archive.to_path_buf())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn build_archive(folder: &Path, out: &Path) -> Result<usize> {
    let file = File::create(out)
        .map_err(|e| DriveError::archive(format!("creating {}: {}", out.display(), e)))?;
    let encoder = GzEncoder::new(file, Compression::best());
    let mut tar = tar::Builder::new(encoder);
    tar.follow_symlinks(false);

    let mut entries = 0usize;
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry
            .map_err(|e| DriveError::archive(format!("walking {}: {}", folder.display(), e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(folder)
            .map_err(|e| DriveError::archive(format!("relativizing {}: {}", path.display(), e)))?;

        debug!(entry = %relative.display(), "adding to archive");
        let added = if entry.file_type().is_dir() {
            tar.append_dir(relative, path)
        } else {
            tar.append_path_with_name(path, relative)
        };
        added.map_err(|e| {
            DriveError::archive(format!("adding {} to archive: {}", relative.display(), e))
        })?;
        entries += 1;
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| DriveError::archive(format!("finalizing tar stream: {}", e)))?;
    let file = encoder
        .finish()
        .map_err(|e| DriveError::archive(format!("finishing gzip stream: {}", e)))?;
    file.sync_all()
        .map_err(|e| DriveError::archive(format!("syncing {}: {}", out.display(), e)))?;
    Ok(entries)
}

fn unpack_blocking(archive: &Path, folder: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| {
        DriveError::archive(format!("opening archive {}: {}", archive.display(), e))
    })?;
    std::fs::create_dir_all(folder)
        .map_err(|e| DriveError::archive(format!("creating {}: {}", folder.display(), e)))?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(folder).map_err(|e| {
        DriveError::archive(format!(
            "extracting {} into {}: {}",
            archive.display(),
            folder.display(),
            e
        ))
    })?;

    info!(archive = %archive.display(), folder = %folder.display(), "archive extracted");
    Ok(())
}
