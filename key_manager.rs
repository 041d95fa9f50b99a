//! Key file loading and key material lifetime.
//!
//! This module provides [`KeyManager`] for reading the user's secret from the
//! key file and turning it into [`KeyMaterial`] for exactly one encrypt or
//! decrypt call.
//!
//! ## Lifetime Rules
//!
//! - The secret read from disk lives in a [`SensitiveBuffer`] and is wiped as
//!   soon as key material has been derived from it
//! - Key material is never cached: it is loaded before the decrypt step and
//!   loaded again before the encrypt step
//! - Key material is consumed by the call that uses it and scrubbed on drop

use crate::config::Config;
use crate::encryptor::CryptoProvider;
use crate::error::{DriveError, Result};
use crate::secret::SensitiveBuffer;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Opaque key object produced by a [`CryptoProvider`] from a secret.
pub struct KeyMaterial {
    secret: SensitiveBuffer,
}

impl KeyMaterial {
    pub fn new(secret: SensitiveBuffer) -> Self {
        Self { secret }
    }

    /// Raw bytes for the provider that created this key material.
    pub fn expose_secret(&self) -> &[u8] {
        self.secret.expose()
    }

    pub fn scrub(&mut self) {
        self.secret.wipe();
    }

    pub fn is_scrubbed(&self) -> bool {
        self.secret.is_wiped()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// Reads the key file and derives key material through the crypto provider.
pub struct KeyManager {
    key_path: PathBuf,
    provider: Arc<dyn CryptoProvider>,
}

impl KeyManager {
    pub fn new(cfg: &Config, provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            key_path: cfg.key_path.clone(),
            provider,
        }
    }

    /// Read the secret at `path`, trimmed of surrounding whitespace.
    ///
    /// Fails with [`DriveError::Key`] if the file is missing, unreadable, not
    /// UTF-8 text, or empty after trimming.
    pub async fn load_secret(path: &Path) -> Result<SensitiveBuffer> {
        let raw = match fs::read(path).await {
            Ok(bytes) => SensitiveBuffer::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "key file not found");
                return Err(DriveError::key(format!(
                    "key file {} not found",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(DriveError::key(format!(
                    "reading key file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let text = std::str::from_utf8(raw.expose()).map_err(|_| {
            DriveError::key(format!("key file {} is not valid UTF-8 text", path.display()))
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DriveError::key(format!(
                "key file {} is empty",
                path.display()
            )));
        }

        debug!(path = %path.display(), "secret loaded");
        // `raw` is wiped on drop at the end of this scope
        Ok(SensitiveBuffer::copy_from(trimmed.as_bytes()))
    }

    /// Convert a secret into key material via the provider.
    pub fn derive(&self, secret: &SensitiveBuffer) -> Result<KeyMaterial> {
        self.provider.key_pair(secret)
    }

    /// Load the secret, derive key material, and wipe the secret.
    pub async fn load_key_material(&self) -> Result<KeyMaterial> {
        let mut secret = Self::load_secret(&self.key_path).await?;
        let derived = self.derive(&secret);
        secret.wipe();
        let key = derived?;
        info!(path = %self.key_path.display(), provider = self.provider.name(), "key material derived");
        Ok(key)
    }
}
