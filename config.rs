//! Configuration management with environment variable support.
//!
//! This module provides [`Config`], the immutable settings value built once
//! at startup and handed to the session orchestrator.
//!
//! ## Environment Variables
//!
//! - `CRYPTDRIVE_KEY_PATH`: Override key file path
//! - `CRYPTDRIVE_CONTAINER`: Override encrypted container path
//! - `CRYPTDRIVE_DRIVE`: Override drive letter
//! - `CRYPTDRIVE_WORKDIR`: Override working folder path
//! - `CRYPTDRIVE_CONFIG`: Override config file path

use crate::error::{DriveError, Result};
use crate::util::resolve_path;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_KEY_PATH: &str = "CRYPTDRIVE_KEY_PATH";
pub const ENV_CONTAINER: &str = "CRYPTDRIVE_CONTAINER";
pub const ENV_DRIVE: &str = "CRYPTDRIVE_DRIVE";
pub const ENV_WORKDIR: &str = "CRYPTDRIVE_WORKDIR";
pub const ENV_CONFIG_PATH: &str = "CRYPTDRIVE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub drive: String,
    pub key_path: PathBuf,
    pub container_path: PathBuf,
    pub working_dir: PathBuf,
    pub archive_path: PathBuf,
    pub image_path: PathBuf,
    pub image_size_mb: u64,
    pub mount_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drive: "A".to_string(),
            key_path: PathBuf::from("./key.txt"),
            container_path: PathBuf::from("./encrypted"),
            working_dir: PathBuf::from("./drive"),
            archive_path: PathBuf::from("./drive.tar.gz"),
            image_path: PathBuf::from("./drive.img"),
            image_size_mb: 512,
            mount_root: PathBuf::from("/mnt"),
        }
    }
}

/// Where the working folder is exposed: a drive letter for path-mapping
/// platforms, a mount point for loop-image platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub letter: char,
    pub mount_point: PathBuf,
}

impl MountTarget {
    /// `X:` form used by drive-mapping commands.
    pub fn drive_spec(&self) -> String {
        format!("{}:", self.letter)
    }
}

impl Config {
    /// Load config with environment variable overrides.
    /// Priority: ENV vars > config file > defaults. CLI flags are applied by
    /// the caller on top of the returned value, followed by [`Config::validate`].
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));

        let mut config = match config_path {
            Some(ref p) if p.exists() => {
                info!(path = %p.display(), "loading config from file");
                let s = fs::read_to_string(p).map_err(|e| {
                    DriveError::config(format!("reading config file {}: {}", p.display(), e))
                })?;
                serde_json::from_str(&s).map_err(|e| {
                    DriveError::config(format!("parsing config file {}: {}", p.display(), e))
                })?
            }
            Some(ref p) => {
                return Err(DriveError::config(format!(
                    "config file {} does not exist",
                    p.display()
                )))
            }
            None => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_overrides(|name| env::var(name).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key_path) = lookup(ENV_KEY_PATH) {
            debug!(key_path = %key_path, "overriding key_path from environment");
            self.key_path = PathBuf::from(key_path);
        }

        if let Some(container) = lookup(ENV_CONTAINER) {
            debug!(container = %container, "overriding container_path from environment");
            self.container_path = PathBuf::from(container);
        }

        if let Some(drive) = lookup(ENV_DRIVE) {
            debug!(drive = %drive, "overriding drive from environment");
            self.drive = drive;
        }

        if let Some(workdir) = lookup(ENV_WORKDIR) {
            debug!(workdir = %workdir, "overriding working_dir from environment");
            self.working_dir = PathBuf::from(workdir);
        }
    }

    /// Validate configuration values. Runs before anything touches the disk.
    pub fn validate(&self) -> Result<()> {
        let mut letters = self.drive.chars();
        match (letters.next(), letters.next()) {
            (Some(c), None) if c.is_ascii_uppercase() => {}
            _ => {
                return Err(DriveError::config(format!(
                    "drive must be a single uppercase letter A-Z, got {:?}",
                    self.drive
                )))
            }
        }

        for (name, path) in [
            ("key_path", &self.key_path),
            ("container_path", &self.container_path),
            ("working_dir", &self.working_dir),
            ("archive_path", &self.archive_path),
            ("image_path", &self.image_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(DriveError::config(format!("{} cannot be empty", name)));
            }
            if path.components().any(|c| c == std::path::Component::ParentDir) {
                warn!(field = name, path = %path.display(), "path contains '..' - consider using absolute paths");
            }
        }

        self.image_size_bytes()?;
        self.check_layout()
    }

    /// Image size in bytes. Fails with [`DriveError::Config`] for zero or
    /// values that do not fit in a `u64`.
    pub fn image_size_bytes(&self) -> Result<u64> {
        if self.image_size_mb == 0 {
            return Err(DriveError::config("image_size_mb must be greater than zero"));
        }
        self.image_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            DriveError::config(format!(
                "image_size_mb {} is too large",
                self.image_size_mb
            ))
        })
    }

    /// The working folder is archived and then deleted wholesale, and the
    /// archive and image are deleted on cleanup. Compare resolved paths so
    /// `./drive`, `sub/../drive`, absolute spellings and symlinked parents
    /// all count as the same place.
    fn check_layout(&self) -> Result<()> {
        let working = resolve("working_dir", &self.working_dir)?;
        let mut seen: Vec<(&str, PathBuf)> = Vec::new();

        for (name, path) in [
            ("key_path", &self.key_path),
            ("container_path", &self.container_path),
            ("archive_path", &self.archive_path),
            ("image_path", &self.image_path),
        ] {
            let resolved = resolve(name, path)?;
            if resolved.starts_with(&working) || working.starts_with(&resolved) {
                return Err(DriveError::config(format!(
                    "{} {} overlaps the working folder {}",
                    name,
                    path.display(),
                    self.working_dir.display()
                )));
            }
            if let Some((other, _)) = seen.iter().find(|(_, p)| *p == resolved) {
                return Err(DriveError::config(format!(
                    "{} and {} point to the same file {}",
                    other,
                    name,
                    resolved.display()
                )));
            }
            seen.push((name, resolved));
        }

        Ok(())
    }

    /// Drive letter and mount point derived from `drive` and `mount_root`.
    ///
    /// Only meaningful after [`Config::validate`] has succeeded.
    pub fn mount_target(&self) -> MountTarget {
        let letter = self.drive.chars().next().unwrap_or('A');
        MountTarget {
            letter,
            mount_point: self.mount_root.join(format!("cryptdrive-{}", letter)),
        }
    }
}

fn resolve(name: &str, path: &Path) -> Result<PathBuf> {
    resolve_path(path)
        .map_err(|e| DriveError::config(format!("resolving {} {}: {}", name, path.display(), e)))
}
