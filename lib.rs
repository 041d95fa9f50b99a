//! # CryptDrive - Encrypted Drive Sessions
//!
//! CryptDrive exposes a plaintext working folder as a drive for one
//! interactive session and guarantees that, once the session ends, the only
//! thing left on disk is a single encrypted container.
//!
//! ## Features
//!
//! - **Session state machine**: mount, wait for the user, unmount, archive,
//!   encrypt, with one idempotent cleanup pass for every exit path
//! - **age containers**: the folder is stored as a gzip tarball encrypted
//!   with a secret from a key file
//! - **Key hygiene**: secrets live in wipeable buffers and key material is
//!   loaded per operation, never cached across the user session
//! - **Crash recovery**: the previous container is kept as a backup until its
//!   replacement is synced, and restored automatically after interruptions
//! - **Platform strategies**: drive-letter mapping or loop-mounted images
//!
//! ## Quick Start
//!
//! ```no_run
//! use cryptdrive::{config::Config, encryptor::AgeProvider, mount, session::SessionOrchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cryptdrive::DriveError> {
//!     let cfg = Config::load_with_env(None)?;
//!     let strategy = mount::strategy_for(
//!         &mount::HostPlatform::detect(),
//!         &cfg,
//!         Arc::new(mount::SystemRunner),
//!     )?;
//!     let mut orchestrator = SessionOrchestrator::new(cfg, strategy, Arc::new(AgeProvider::new()))?;
//!
//!     let outcome = orchestrator.run().await;
//!     orchestrator.cleanup().await;
//!     outcome
//! }
//! ```

pub mod archive;
pub mod backup;
pub mod config;
pub mod container_ops;
pub mod encryptor;
pub mod error;
pub mod key_manager;
pub mod mount;
pub mod secret;
pub mod session;
pub mod util;

// Re-export common types for convenience
pub use error::{DriveError, Result};
pub use session::{SessionOrchestrator, SessionState};
