//! Backup of the encrypted container across risky windows.
//!
//! The backup sits next to the container (`<container>.bak`). It is created
//! before the container is removed or replaced and deleted only after the
//! replacement has been written and synced. [`BackupGuard::recover`] settles
//! whatever an interrupted run left behind.

use crate::container_ops::CONTAINER_TMP_SUFFIX;
use crate::error::{DriveError, Result};
use crate::util::{path_exists, remove_path, sync_parent_dir, with_suffix};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub const BACKUP_SUFFIX: &str = ".bak";

/// What [`BackupGuard::recover`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No backup present.
    Clean,
    /// Container missing, backup moved back into place.
    Restored,
    /// Container present, stale backup removed.
    DiscardedStale,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackupGuard;

impl BackupGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn backup_path(container: &Path) -> PathBuf {
        with_suffix(container, BACKUP_SUFFIX)
    }

    /// Copy the container to its backup path. No-op if there is no container.
    ///
    /// An existing backup is kept as is: within a run it is always the older
    /// last-known-good copy, and stale backups from earlier runs are settled
    /// by [`BackupGuard::recover`] at startup.
    pub async fn protect(&self, container: &Path) -> Result<()> {
        let backup = Self::backup_path(container);
        if !path_exists(container).await {
            debug!(container = %container.display(), "no container to protect");
            return Ok(());
        }
        if path_exists(&backup).await {
            debug!(backup = %backup.display(), "backup already present");
            return Ok(());
        }

        let tmp = with_suffix(&backup, CONTAINER_TMP_SUFFIX);
        let copied = async {
            fs::copy(container, &tmp).await?;
            fs::File::open(&tmp).await?.sync_all().await?;
            fs::rename(&tmp, &backup).await?;
            sync_parent_dir(&backup)
        }
        .await;
        if let Err(e) = copied {
            let _ = fs::remove_file(&tmp).await;
            return Err(DriveError::crypto(format!(
                "backing up {} to {}: {}",
                container.display(),
                backup.display(),
                e
            )));
        }

        info!(container = %container.display(), backup = %backup.display(), "container backed up");
        Ok(())
    }

    /// Delete the backup. Call only after the replacement container has been
    /// confirmed written.
    pub async fn release(&self, container: &Path) -> Result<()> {
        let backup = Self::backup_path(container);
        match fs::remove_file(&backup).await {
            Ok(()) => {
                info!(backup = %backup.display(), "backup released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriveError::crypto(format!(
                "removing backup {}: {}",
                backup.display(),
                e
            ))),
        }
    }

    /// Settle leftovers of an interrupted run: restore the backup if the
    /// container is gone, drop it if the container is present, and remove
    /// unfinished container writes.
    pub async fn recover(&self, container: &Path) -> Result<Recovery> {
        let backup = Self::backup_path(container);
        for partial in [
            with_suffix(container, CONTAINER_TMP_SUFFIX),
            with_suffix(&backup, CONTAINER_TMP_SUFFIX),
        ] {
            if remove_path(&partial)
                .map_err(|e| DriveError::cleanup(format!("removing {}: {}", partial.display(), e)))?
            {
                warn!(path = %partial.display(), "removed unfinished container write");
            }
        }

        if !path_exists(&backup).await {
            return Ok(Recovery::Clean);
        }

        if path_exists(container).await {
            fs::remove_file(&backup).await.map_err(|e| {
                DriveError::cleanup(format!("removing stale backup {}: {}", backup.display(), e))
            })?;
            warn!(backup = %backup.display(), "removed stale backup of a confirmed container");
            return Ok(Recovery::DiscardedStale);
        }

        fs::rename(&backup, container).await.map_err(|e| {
            DriveError::cleanup(format!(
                "restoring {} from {}: {}",
                container.display(),
                backup.display(),
                e
            ))
        })?;
        warn!(container = %container.display(), "container restored from backup");
        Ok(Recovery::Restored)
    }
}
