//! Crypto provider seam.
//!
//! The session never touches a cipher directly. It goes through a
//! [`CryptoProvider`], which turns a secret into [`KeyMaterial`] and streams
//! payload bytes through encryption or decryption. Payload bytes are passed
//! through unchanged in both directions; no text or hex re-encoding happens
//! anywhere on either path.
//!
//! [`AgeProvider`] is the production provider: it writes standard age files
//! keyed by the secret (scrypt recipient stanza).

use crate::error::{DriveError, Result};
use crate::key_manager::KeyMaterial;
use crate::secret::SensitiveBuffer;
use age::secrecy::SecretString;
use std::io::{self, Read, Write};
use std::iter;

pub trait CryptoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Build key material from a secret. The caller wipes `secret` afterwards.
    fn key_pair(&self, secret: &SensitiveBuffer) -> Result<KeyMaterial>;

    /// Encrypt everything read from `plaintext` into `ciphertext`.
    /// Returns the number of plaintext bytes consumed.
    fn encrypt(
        &self,
        plaintext: &mut dyn Read,
        ciphertext: &mut dyn Write,
        key: &KeyMaterial,
    ) -> Result<u64>;

    /// Decrypt everything read from `ciphertext` into `plaintext`.
    /// Returns the number of plaintext bytes produced.
    fn decrypt(
        &self,
        ciphertext: &mut dyn Read,
        plaintext: &mut dyn Write,
        key: &KeyMaterial,
    ) -> Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AgeProvider;

impl AgeProvider {
    pub fn new() -> Self {
        Self
    }

    fn passphrase(key: &KeyMaterial) -> Result<SecretString> {
        let text = std::str::from_utf8(key.expose_secret())
            .map_err(|_| DriveError::key("key material is not valid UTF-8"))?;
        // SecretString zeroizes its copy on drop
        Ok(SecretString::from(text.to_owned()))
    }
}

impl CryptoProvider for AgeProvider {
    fn name(&self) -> &str {
        "age"
    }

    fn key_pair(&self, secret: &SensitiveBuffer) -> Result<KeyMaterial> {
        if secret.is_empty() {
            return Err(DriveError::key("secret is empty"));
        }
        if std::str::from_utf8(secret.expose()).is_err() {
            return Err(DriveError::key("secret is not valid UTF-8"));
        }
        Ok(KeyMaterial::new(SensitiveBuffer::copy_from(secret.expose())))
    }

    fn encrypt(
        &self,
        plaintext: &mut dyn Read,
        ciphertext: &mut dyn Write,
        key: &KeyMaterial,
    ) -> Result<u64> {
        let encryptor = age::Encryptor::with_user_passphrase(Self::passphrase(key)?);

        let mut writer = encryptor
            .wrap_output(ciphertext)
            .map_err(|e| DriveError::crypto(format!("failed to create encryptor: {}", e)))?;

        let written = io::copy(plaintext, &mut writer)
            .map_err(|e| DriveError::crypto(format!("encryption write failed: {}", e)))?;

        writer
            .finish()
            .map_err(|e| DriveError::crypto(format!("encryption finish failed: {}", e)))?;

        Ok(written)
    }

    fn decrypt(
        &self,
        ciphertext: &mut dyn Read,
        plaintext: &mut dyn Write,
        key: &KeyMaterial,
    ) -> Result<u64> {
        let decryptor = age::Decryptor::new(ciphertext)
            .map_err(|e| DriveError::crypto(format!("malformed container: {}", e)))?;

        let identity = age::scrypt::Identity::new(Self::passphrase(key)?);
        let mut reader = decryptor
            .decrypt(iter::once(&identity as &dyn age::Identity))
            .map_err(|e| match e {
                age::DecryptError::NoMatchingKeys
                | age::DecryptError::DecryptionFailed
                | age::DecryptError::KeyDecryptionFailed => {
                    DriveError::crypto("key does not match the container")
                }
                _ => DriveError::crypto(format!("decryption failed: {}", e)),
            })?;

        io::copy(&mut reader, plaintext)
            .map_err(|e| DriveError::crypto(format!("container payload is corrupt: {}", e)))
    }
}
