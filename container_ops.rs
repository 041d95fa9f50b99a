//! Encrypted container operations.
//!
//! This module provides [`ContainerOps`], which replaces a plaintext file with
//! its encrypted container and back, using a [`CryptoProvider`].
//!
//! ## Write Discipline
//!
//! - Output is always written to a temporary sibling, synced, then renamed
//!   into place, so a crash never leaves a half-written container or archive
//! - The plaintext input of `encrypt_in_place` is deleted only after the
//!   container rename has been synced
//! - `decrypt_in_place` opens the container read-only and never modifies it

use crate::encryptor::CryptoProvider;
use crate::error::{DriveError, Result};
use crate::key_manager::KeyMaterial;
use crate::util::{remove_path, sync_parent_dir, with_suffix};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Suffix of the in-progress container write.
pub const CONTAINER_TMP_SUFFIX: &str = ".tmp";
/// Suffix of the in-progress plaintext write during decryption.
pub const PLAINTEXT_PART_SUFFIX: &str = ".part";

pub struct ContainerOps {
    provider: Arc<dyn CryptoProvider>,
}

impl ContainerOps {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Encrypt `file` into `container`, then delete `file`.
    ///
    /// Consumes `key`; it is scrubbed as soon as the provider returns.
    pub async fn encrypt_in_place(
        &self,
        file: &Path,
        container: &Path,
        key: KeyMaterial,
    ) -> Result<PathBuf> {
        debug!(file = %file.display(), container = %container.display(), "encrypting file");
        let provider = Arc::clone(&self.provider);
        let file = file.to_path_buf();
        let container = container.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let result = encrypt_blocking(provider.as_ref(), &file, &container, key);
            if let Err(e) = &result {
                error!(file = %file.display(), error = %e, "encryption failed");
            }
            result
        })
        .await
        .map_err(|e| DriveError::crypto(format!("encryption task failed: {}", e)))?
    }

    /// Decrypt `container` into `file`. The container is left untouched.
    ///
    /// Consumes `key`; it is scrubbed as soon as the provider returns.
    pub async fn decrypt_in_place(
        &self,
        container: &Path,
        file: &Path,
        key: KeyMaterial,
    ) -> Result<PathBuf> {
        debug!(container = %container.display(), file = %file.display(), "decrypting container");
        let provider = Arc::clone(&self.provider);
        let container = container.to_path_buf();
        let file = file.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let result = decrypt_blocking(provider.as_ref(), &container, &file, key);
            if let Err(e) = &result {
                error!(container = %container.display(), error = %e, "decryption failed");
            }
            result
        })
        .await
        .map_err(|e| DriveError::crypto(format!("decryption task failed: {}", e)))?
    }
}

fn encrypt_blocking(
    provider: &dyn CryptoProvider,
    file: &Path,
    container: &Path,
    mut key: KeyMaterial,
) -> Result<PathBuf> {
    let input = File::open(file).map_err(|e| {
        DriveError::crypto(format!("opening {} for encryption: {}", file.display(), e))
    })?;
    let tmp = with_suffix(container, CONTAINER_TMP_SUFFIX);

    let written = write_via_temp(&tmp, container, |out| {
        let result = provider.encrypt(&mut BufReader::new(&input), out, &key);
        key.scrub();
        result
    });
    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = remove_path(&tmp);
            return Err(e);
        }
    };

    std::fs::remove_file(file).map_err(|e| {
        DriveError::crypto(format!(
            "container written but plaintext {} could not be removed: {}",
            file.display(),
            e
        ))
    })?;

    info!(container = %container.display(), plaintext_bytes = written, "container written");
    Ok(container.to_path_buf())
}

fn decrypt_blocking(
    provider: &dyn CryptoProvider,
    container: &Path,
    file: &Path,
    mut key: KeyMaterial,
) -> Result<PathBuf> {
    let input = OpenOptions::new().read(true).open(container).map_err(|e| {
        DriveError::crypto(format!("opening container {}: {}", container.display(), e))
    })?;
    let part = with_suffix(file, PLAINTEXT_PART_SUFFIX);

    let produced = write_via_temp(&part, file, |out| {
        let result = provider.decrypt(&mut BufReader::new(&input), out, &key);
        key.scrub();
        result
    });
    match produced {
        Ok(n) => {
            info!(file = %file.display(), plaintext_bytes = n, "container decrypted");
            Ok(file.to_path_buf())
        }
        Err(e) => {
            let _ = remove_path(&part);
            Err(e)
        }
    }
}

/// Run `body` against a fresh file at `tmp`, sync it, and rename it to `dest`.
fn write_via_temp<F>(tmp: &Path, dest: &Path, body: F) -> Result<u64>
where
    F: FnOnce(&mut dyn Write) -> Result<u64>,
{
    let out = File::create(tmp)
        .map_err(|e| DriveError::crypto(format!("creating {}: {}", tmp.display(), e)))?;
    let mut writer = BufWriter::new(out);
    let n = body(&mut writer)?;

    let out = writer
        .into_inner()
        .map_err(|e| DriveError::crypto(format!("flushing {}: {}", tmp.display(), e.error())))?;
    out.sync_all()
        .map_err(|e| DriveError::crypto(format!("syncing {}: {}", tmp.display(), e)))?;
    drop(out);

    std::fs::rename(tmp, dest).map_err(|e| {
        DriveError::crypto(format!(
            "moving {} to {}: {}",
            tmp.display(),
            dest.display(),
            e
        ))
    })?;
    sync_parent_dir(dest)
        .map_err(|e| DriveError::crypto(format!("syncing directory of {}: {}", dest.display(), e)))?;
    Ok(n)
}
