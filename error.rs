use thiserror::Error;

/// Error taxonomy for a drive session.
///
/// Every variant except [`DriveError::Cleanup`] is fatal: it aborts the
/// session and terminates the process with exit code 1.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Bad flags, bad config file, unsupported platform
    #[error("Config error: {0}")]
    Config(String),

    /// Volume mapping create/teardown/open failures
    #[error("Mount error: {0}")]
    Mount(String),

    /// Pack/unpack failures, missing source folder or archive
    #[error("Archive error: {0}")]
    Archive(String),

    /// Missing or empty key file, provider rejected the secret
    #[error("Key error: {0}")]
    Key(String),

    /// Encrypt/decrypt failures, malformed ciphertext
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Best-effort cleanup failures; logged, never fatal
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// Termination signal received while a session was live
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl DriveError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::Interrupted(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cleanup(_))
    }

    /// Process exit code for a session that ended with this error.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;
