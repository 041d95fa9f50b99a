//! Exposing the working folder as a drive-like volume.
//!
//! One [`MountStrategy`] is chosen per process by [`strategy_for`]:
//!
//! - [`DriveMapping`] maps the folder to a drive letter (`subst`)
//! - [`LoopImage`] loop-mounts an ext4 image at a mount point and mirrors the
//!   folder in and out of it
//!
//! All external commands go through a [`CommandRunner`] so strategies can be
//! exercised without privileges.

use crate::config::{Config, MountTarget};
use crate::error::{DriveError, Result};
use crate::util::{path_exists, remove_path};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directory created by `mkfs.ext4` at the volume root; never mirrored.
const LOST_AND_FOUND: &str = "lost+found";

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion, failing on a non-zero exit status.
    async fn run(&self, program: &str, args: &[OsString]) -> Result<()>;

    /// Open `target` in the native file browser.
    async fn open(&self, target: &Path) -> Result<()>;
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<()> {
        debug!(program, args = ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DriveError::mount(format!("failed to start {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(DriveError::mount(format!(
                "{} {:?} failed ({}): {}",
                program,
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn open(&self, target: &Path) -> Result<()> {
        let target = target.to_path_buf();
        let shown = target.display().to_string();
        tokio::task::spawn_blocking(move || open::that(&target))
            .await
            .map_err(|e| DriveError::mount(format!("open task failed: {}", e)))?
            .map_err(|e| DriveError::mount(format!("opening {} failed: {}", shown, e)))
    }
}

#[async_trait]
pub trait MountStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expose `working_dir` at `target`. Creates `working_dir` (and parents)
    /// if missing; an existing folder is not an error.
    async fn mount(&self, working_dir: &Path, target: &MountTarget) -> Result<()>;

    /// Tear down the exposure. Fails if nothing is mounted; cleanup paths
    /// call this best-effort and swallow the error.
    async fn unmount(&self, target: &MountTarget) -> Result<()>;

    /// Open the exposed volume for the user.
    async fn open(&self, target: &MountTarget) -> Result<()>;

    /// Plaintext files this strategy may leave behind after a crash.
    fn residue(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Host platforms with a known mount mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Linux,
    Unsupported(String),
}

impl HostPlatform {
    pub fn detect() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "windows" => Self::Windows,
            "linux" => Self::Linux,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

/// Pick the strategy for `platform`. Fails with [`DriveError::Config`] for
/// unsupported platforms, before anything is touched.
pub fn strategy_for(
    platform: &HostPlatform,
    cfg: &Config,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn MountStrategy>> {
    match platform {
        HostPlatform::Windows => Ok(Box::new(DriveMapping::new(runner))),
        HostPlatform::Linux => Ok(Box::new(LoopImage::new(
            cfg.image_path.clone(),
            cfg.image_size_bytes()?,
            runner,
        ))),
        HostPlatform::Unsupported(os) => Err(DriveError::config(format!(
            "platform {:?} is not supported (supported: windows, linux)",
            os
        ))),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| DriveError::mount(format!("resolving current directory: {}", e)))?;
    Ok(cwd.join(path))
}

async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| DriveError::mount(format!("creating {}: {}", path.display(), e)))
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    items.into_iter().map(|s| s.as_ref().to_os_string()).collect()
}

/// Strategy A: map the working folder to a drive letter.
pub struct DriveMapping {
    runner: Arc<dyn CommandRunner>,
}

impl DriveMapping {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl MountStrategy for DriveMapping {
    fn name(&self) -> &'static str {
        "drive-mapping"
    }

    async fn mount(&self, working_dir: &Path, target: &MountTarget) -> Result<()> {
        ensure_dir(working_dir).await?;
        let folder = absolute(working_dir)?;
        let drive = target.drive_spec();
        self.runner
            .run("subst", &args([OsStr::new(&drive), folder.as_os_str()]))
            .await?;
        info!(drive = %drive, folder = %folder.display(), "folder mapped to drive");
        Ok(())
    }

    async fn unmount(&self, target: &MountTarget) -> Result<()> {
        let drive = target.drive_spec();
        self.runner.run("subst", &args([drive.as_str(), "/D"])).await?;
        info!(drive = %drive, "drive mapping removed");
        Ok(())
    }

    async fn open(&self, target: &MountTarget) -> Result<()> {
        let root = PathBuf::from(format!("{}\\", target.drive_spec()));
        self.runner.open(&root).await
    }
}

/// Strategy B: loop-mount a fixed-size ext4 image at the mount point.
///
/// The image is created and formatted on first use. On mount the working
/// folder is copied into the volume; on unmount the volume is copied back,
/// unmounted, and the image deleted.
pub struct LoopImage {
    image_path: PathBuf,
    image_size_bytes: u64,
    runner: Arc<dyn CommandRunner>,
    mounted_from: Mutex<Option<PathBuf>>,
}

impl LoopImage {
    pub fn new(image_path: PathBuf, image_size_bytes: u64, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            image_path,
            image_size_bytes,
            runner,
            mounted_from: Mutex::new(None),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        if path_exists(&self.image_path).await {
            debug!(image = %self.image_path.display(), "reusing existing image");
            return Ok(());
        }
        if let Some(parent) = self.image_path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent).await?;
            }
        }

        let file = fs::File::create(&self.image_path).await.map_err(|e| {
            DriveError::mount(format!("creating image {}: {}", self.image_path.display(), e))
        })?;
        file.set_len(self.image_size_bytes).await.map_err(|e| {
            DriveError::mount(format!("sizing image {}: {}", self.image_path.display(), e))
        })?;
        drop(file);

        if let Err(e) = self
            .runner
            .run("mkfs.ext4", &args([OsStr::new("-q"), OsStr::new("-F"), self.image_path.as_os_str()]))
            .await
        {
            let _ = fs::remove_file(&self.image_path).await;
            return Err(e);
        }
        info!(image = %self.image_path.display(), bytes = self.image_size_bytes, "image created and formatted");
        Ok(())
    }

    fn set_mounted_from(&self, value: Option<PathBuf>) {
        if let Ok(mut slot) = self.mounted_from.lock() {
            *slot = value;
        }
    }

    fn mounted_from(&self) -> Option<PathBuf> {
        self.mounted_from.lock().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl MountStrategy for LoopImage {
    fn name(&self) -> &'static str {
        "loop-image"
    }

    async fn mount(&self, working_dir: &Path, target: &MountTarget) -> Result<()> {
        ensure_dir(working_dir).await?;
        ensure_dir(&target.mount_point).await?;
        self.ensure_image().await?;

        self.runner
            .run(
                "mount",
                &args([
                    OsStr::new("-o"),
                    OsStr::new("loop"),
                    self.image_path.as_os_str(),
                    target.mount_point.as_os_str(),
                ]),
            )
            .await?;

        if let Err(e) = mirror(working_dir, &target.mount_point).await {
            warn!(error = %e, "populating volume failed, unmounting");
            let _ = self
                .runner
                .run("umount", &args([target.mount_point.as_os_str()]))
                .await;
            return Err(e);
        }

        self.set_mounted_from(Some(working_dir.to_path_buf()));
        info!(
            image = %self.image_path.display(),
            mount_point = %target.mount_point.display(),
            "image mounted"
        );
        Ok(())
    }

    async fn unmount(&self, target: &MountTarget) -> Result<()> {
        let point = target.mount_point.as_os_str();
        self.runner
            .run("mountpoint", &args([OsStr::new("-q"), point]))
            .await
            .map_err(|_| {
                DriveError::mount(format!(
                    "nothing is mounted at {}",
                    target.mount_point.display()
                ))
            })?;

        if let Some(working_dir) = self.mounted_from() {
            mirror(&target.mount_point, &working_dir).await?;
        }

        self.runner.run("umount", &args([point])).await?;
        self.set_mounted_from(None);

        remove_path(&self.image_path).map_err(|e| {
            DriveError::mount(format!(
                "removing image {}: {}",
                self.image_path.display(),
                e
            ))
        })?;
        info!(mount_point = %target.mount_point.display(), "image unmounted and removed");
        Ok(())
    }

    async fn open(&self, target: &MountTarget) -> Result<()> {
        self.runner.open(&target.mount_point).await
    }

    fn residue(&self) -> Vec<PathBuf> {
        vec![self.image_path.clone()]
    }
}

/// Make `dst` hold exactly the contents of `src`. `dst` itself is kept (it
/// may be a mount point); `lost+found` at either root is left alone.
/// Symlinks are recreated as symlinks, never followed.
async fn mirror(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || mirror_blocking(&src, &dst))
        .await
        .map_err(|e| DriveError::mount(format!("mirror task failed: {}", e)))?
}

fn mirror_blocking(src: &Path, dst: &Path) -> Result<()> {
    let io_err = |what: &str, path: &Path, e: std::io::Error| {
        DriveError::mount(format!("{} {}: {}", what, path.display(), e))
    };

    std::fs::create_dir_all(dst).map_err(|e| io_err("creating", dst, e))?;
    for entry in std::fs::read_dir(dst).map_err(|e| io_err("listing", dst, e))? {
        let entry = entry.map_err(|e| io_err("listing", dst, e))?;
        if entry.file_name() == LOST_AND_FOUND {
            continue;
        }
        remove_path(&entry.path()).map_err(|e| io_err("clearing", &entry.path(), e))?;
    }

    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == LOST_AND_FOUND));
    for entry in walker {
        let entry = entry.map_err(|e| DriveError::mount(format!("walking {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DriveError::mount(format!("relativizing {}: {}", entry.path().display(), e)))?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| io_err("creating", &target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| io_err("copying", entry.path(), e))?;
        }
    }
    debug!(src = %src.display(), dst = %dst.display(), "tree mirrored");
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = std::fs::read_link(src)
        .map_err(|e| DriveError::mount(format!("reading link {}: {}", src.display(), e)))?;
    std::os::unix::fs::symlink(&link, dst)
        .map_err(|e| DriveError::mount(format!("creating link {}: {}", dst.display(), e)))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<()> {
    Err(DriveError::mount(format!(
        "cannot mirror symlink {} on this platform",
        src.display()
    )))
}
