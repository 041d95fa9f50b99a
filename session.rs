//! Session lifecycle orchestration.
//!
//! [`SessionOrchestrator`] drives one session through its states:
//!
//! ```text
//! Start -> Cleaned -> Keyed -> (DecryptedExtracted | NoContainer) -> Mounted
//!       -> Opened -> AwaitingSignal -> Unmounted -> Archived
//!       -> ClearedPlaintext -> ReKeyed -> Encrypted -> CleanedUp
//! ```
//!
//! Any failing step ends in `Aborted`. Regardless of how the run ends, the
//! caller runs [`SessionOrchestrator::cleanup`], which is the same idempotent
//! best-effort pass performed at startup.
//!
//! Termination requests arrive through a [`ShutdownHandle`]. Steps are never
//! abandoned halfway: a request stops the session at the next step boundary
//! up to `AwaitingSignal`, and interrupts the wait itself. Once the unmount
//! signal has been received the close sequence always runs to the end.

use crate::archive;
use crate::backup::BackupGuard;
use crate::config::{Config, MountTarget};
use crate::container_ops::ContainerOps;
use crate::encryptor::CryptoProvider;
use crate::error::{DriveError, Result};
use crate::key_manager::{KeyManager, KeyMaterial};
use crate::mount::MountStrategy;
use crate::util::{path_exists, remove_path};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Cleaned,
    Keyed,
    DecryptedExtracted,
    NoContainer,
    Mounted,
    Opened,
    AwaitingSignal,
    Unmounted,
    Archived,
    ClearedPlaintext,
    ReKeyed,
    Encrypted,
    CleanedUp,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanedUp | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Start => "starting",
            Self::Cleaned => "leftovers cleaned",
            Self::Keyed => "key loaded",
            Self::DecryptedExtracted => "container decrypted and extracted",
            Self::NoContainer => "no container yet, starting empty",
            Self::Mounted => "drive mounted",
            Self::Opened => "drive opened",
            Self::AwaitingSignal => "waiting for unmount",
            Self::Unmounted => "drive unmounted",
            Self::Archived => "drive archived",
            Self::ClearedPlaintext => "plaintext removed",
            Self::ReKeyed => "key reloaded",
            Self::Encrypted => "container encrypted",
            Self::CleanedUp => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// The one session of this process.
#[derive(Debug, Clone)]
pub struct Session {
    pub working_dir: PathBuf,
    pub archive_path: PathBuf,
    pub container_path: PathBuf,
    pub key_path: PathBuf,
    pub target: MountTarget,
    state: SessionState,
    volume_exposed: bool,
}

impl Session {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            working_dir: cfg.working_dir.clone(),
            archive_path: cfg.archive_path.clone(),
            container_path: cfg.container_path.clone(),
            key_path: cfg.key_path.clone(),
            target: cfg.mount_target(),
            state: SessionState::Start,
            volume_exposed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True between a successful mount and a successful unmount.
    pub fn volume_exposed(&self) -> bool {
        self.volume_exposed
    }

    /// Plaintext paths that must not outlive the session.
    pub fn plaintext_paths(&self) -> Vec<PathBuf> {
        vec![
            self.working_dir.clone(),
            self.archive_path.clone(),
            archive::partial_path(&self.archive_path),
        ]
    }
}

/// The single user-controlled suspension point.
#[async_trait]
pub trait UnmountSignal: Send {
    /// Resolve once the user asks for the drive to be closed.
    async fn wait(&mut self, session: &Session) -> Result<()>;
}

/// Resolves on one line (or EOF) of standard input.
///
/// The read happens on a dedicated thread so an interrupted session does
/// not leave the runtime waiting on stdin at shutdown.
#[derive(Debug, Default)]
pub struct StdinSignal;

#[async_trait]
impl UnmountSignal for StdinSignal {
    async fn wait(&mut self, _session: &Session) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = tx.send(std::io::stdin().read_line(&mut line).map(|_| ()));
        });
        rx.await
            .map_err(|_| DriveError::interrupted("standard input reader vanished"))?
            .map_err(|e| DriveError::interrupted(format!("reading standard input: {}", e)))
    }
}

/// Asks a running session to stop. Cheap to clone and usable from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl ShutdownHandle {
    /// Request termination. The first reason wins; later requests are no-ops.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
            }
        });
    }
}

/// Notified on every state transition.
pub trait SessionObserver: Send + Sync {
    fn on_transition(&self, state: SessionState, session: &Session);
}

/// Removes plaintext synchronously if dropped while armed, e.g. while
/// unwinding from a panic before the async cleanup could run.
pub struct ExitGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl ExitGuard {
    pub fn new(session: &Session, residue: Vec<PathBuf>) -> Self {
        let mut paths = session.plaintext_paths();
        paths.extend(residue);
        Self { paths, armed: true }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            match remove_path(path) {
                Ok(true) => warn!(path = %path.display(), "plaintext removed by exit guard"),
                Ok(false) => {}
                Err(e) => error!(path = %path.display(), error = %e, "exit guard could not remove plaintext"),
            }
        }
    }
}

pub struct SessionOrchestrator {
    session: Session,
    mount: Box<dyn MountStrategy>,
    keys: KeyManager,
    containers: ContainerOps,
    backups: BackupGuard,
    signal: Box<dyn UnmountSignal>,
    observer: Option<Box<dyn SessionObserver>>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<Option<String>>,
}

impl SessionOrchestrator {
    /// Validates `config` before anything touches the disk.
    pub fn new(
        config: Config,
        mount: Box<dyn MountStrategy>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, shutdown_rx) = watch::channel(None);
        Ok(Self {
            session: Session::from_config(&config),
            mount,
            keys: KeyManager::new(&config, Arc::clone(&provider)),
            containers: ContainerOps::new(provider),
            backups: BackupGuard::new(),
            signal: Box::new(StdinSignal),
            observer: None,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            shutdown_rx,
        })
    }

    pub fn with_signal(mut self, signal: impl UnmountSignal + 'static) -> Self {
        self.signal = Box::new(signal);
        self
    }

    pub fn with_observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Handle for requesting termination while [`SessionOrchestrator::run`]
    /// is in progress.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Guard covering this session's plaintext and the strategy's residue.
    pub fn exit_guard(&self) -> ExitGuard {
        ExitGuard::new(&self.session, self.mount.residue())
    }

    /// Step boundary: stop here if termination has been requested.
    fn checkpoint(&self) -> Result<()> {
        match self.shutdown_rx.borrow().as_ref() {
            Some(reason) => {
                warn!(state = ?self.session.state, reason = %reason, "stopping at step boundary");
                Err(DriveError::interrupted(reason.clone()))
            }
            None => Ok(()),
        }
    }

    fn transition(&mut self, state: SessionState) {
        info!(from = ?self.session.state, to = ?state, "session transition");
        self.session.state = state;
        if let Some(observer) = &self.observer {
            observer.on_transition(state, &self.session);
        }
    }

    /// Drive the whole session. Ends in `CleanedUp` or `Aborted`.
    pub async fn run(&mut self) -> Result<()> {
        match self.run_steps().await {
            Ok(()) => {
                self.transition(SessionState::CleanedUp);
                Ok(())
            }
            Err(e) => {
                error!(state = ?self.session.state, error = %e, "session aborted");
                self.transition(SessionState::Aborted);
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self) -> Result<()> {
        self.transition(SessionState::Start);

        for e in self.clean_leftovers().await {
            warn!(error = %e, "startup cleanup incomplete");
        }
        self.transition(SessionState::Cleaned);
        self.checkpoint()?;

        let key = self.keys.load_key_material().await?;
        self.transition(SessionState::Keyed);
        self.checkpoint()?;

        let container = self.session.container_path.clone();
        let archive_path = self.session.archive_path.clone();
        let working = self.session.working_dir.clone();
        let target = self.session.target.clone();

        if path_exists(&container).await {
            self.open_container(&container, &archive_path, &working, key)
                .await?;
            self.transition(SessionState::DecryptedExtracted);
        } else {
            drop(key);
            info!(container = %container.display(), "no container, starting with an empty drive");
            self.transition(SessionState::NoContainer);
        }
        self.checkpoint()?;

        self.mount.mount(&working, &target).await?;
        self.session.volume_exposed = true;
        warn!(drive = %target.drive_spec(), "volume mounted - do not terminate the process until it is closed");
        self.transition(SessionState::Mounted);
        self.checkpoint()?;

        self.mount.open(&target).await?;
        self.transition(SessionState::Opened);
        self.checkpoint()?;

        self.transition(SessionState::AwaitingSignal);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            waited = self.signal.wait(&self.session) => waited?,
            reason = requested(&mut shutdown) => return Err(DriveError::interrupted(reason)),
        }

        self.mount.unmount(&target).await?;
        self.session.volume_exposed = false;
        self.transition(SessionState::Unmounted);

        archive::pack(&working, &archive_path).await?;
        self.transition(SessionState::Archived);

        remove_path(&working).map_err(|e| {
            DriveError::archive(format!(
                "removing working folder {}: {}",
                working.display(),
                e
            ))
        })?;
        self.transition(SessionState::ClearedPlaintext);

        let key = self.keys.load_key_material().await?;
        self.transition(SessionState::ReKeyed);

        self.backups.protect(&container).await?;
        self.containers
            .encrypt_in_place(&archive_path, &container, key)
            .await?;
        self.backups.release(&container).await?;
        self.transition(SessionState::Encrypted);

        Ok(())
    }

    /// Decrypt and extract the container into the working folder, then keep
    /// the container only as a backup until the new one is written.
    async fn open_container(
        &self,
        container: &Path,
        archive_path: &Path,
        working: &Path,
        key: KeyMaterial,
    ) -> Result<()> {
        let archive = self
            .containers
            .decrypt_in_place(container, archive_path, key)
            .await?;
        if !path_exists(&archive).await {
            return Err(DriveError::crypto(format!(
                "decrypting {} produced no archive at {}",
                container.display(),
                archive.display()
            )));
        }

        archive::unpack(&archive, working).await?;

        self.backups.protect(container).await?;
        fs::remove_file(container).await.map_err(|e| {
            DriveError::crypto(format!(
                "removing opened container {}: {}",
                container.display(),
                e
            ))
        })?;
        fs::remove_file(&archive).await.map_err(|e| {
            DriveError::archive(format!("removing archive {}: {}", archive.display(), e))
        })?;
        Ok(())
    }

    /// Best-effort teardown: unmount, remove plaintext, settle the backup.
    /// Never fails; returns what could not be done.
    async fn clean_leftovers(&mut self) -> Vec<DriveError> {
        let mut problems = Vec::new();
        let target = &self.session.target;

        match self.mount.unmount(target).await {
            Ok(()) => {
                self.session.volume_exposed = false;
                info!(strategy = self.mount.name(), "leftover volume torn down")
            }
            Err(e) if self.session.volume_exposed => {
                problems.push(DriveError::cleanup(format!("volume teardown: {}", e)))
            }
            Err(e) => debug!(error = %e, "no volume to tear down"),
        }

        let mut paths = self.session.plaintext_paths();
        paths.extend(self.mount.residue());
        for path in paths {
            match remove_path(&path) {
                Ok(true) => info!(path = %path.display(), "removed plaintext leftover"),
                Ok(false) => {}
                Err(e) => problems.push(DriveError::cleanup(format!(
                    "removing {}: {}",
                    path.display(),
                    e
                ))),
            }
        }

        if let Err(e) = self.backups.recover(&self.session.container_path).await {
            problems.push(e);
        }

        problems
    }

    /// Exit cleanup. Idempotent; safe to call after any outcome of
    /// [`SessionOrchestrator::run`], including an interrupted one.
    pub async fn cleanup(&mut self) -> Vec<DriveError> {
        if !self.session.state.is_terminal() {
            warn!(state = ?self.session.state, "session interrupted");
            self.transition(SessionState::Aborted);
        }
        let problems = self.clean_leftovers().await;
        for e in &problems {
            warn!(error = %e, "cleanup step failed");
        }
        problems
    }
}

/// Resolves with the reason once termination has been requested.
async fn requested(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
