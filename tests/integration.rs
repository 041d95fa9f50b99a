use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use cryptdrive::archive;
use cryptdrive::backup::BackupGuard;
use cryptdrive::config::{Config, MountTarget};
use cryptdrive::container_ops::ContainerOps;
use cryptdrive::encryptor::AgeProvider;
use cryptdrive::key_manager::KeyManager;
use cryptdrive::mount::MountStrategy;
use cryptdrive::session::{
    Session, SessionObserver, SessionOrchestrator, SessionState, ShutdownHandle, UnmountSignal,
};
use cryptdrive::DriveError;

type Trigger = Arc<Mutex<Option<(&'static str, ShutdownHandle)>>>;

/// Exposes the working folder as-is and records what was asked of it.
/// When armed, requests termination while performing the named operation.
struct FolderMount {
    log: Arc<Mutex<Vec<String>>>,
    mounted: Mutex<bool>,
    fail_unmount: bool,
    trigger: Trigger,
}

impl FolderMount {
    fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            log,
            mounted: Mutex::new(false),
            fail_unmount: false,
            trigger: Arc::default(),
        }
    }

    fn terminate_if(&self, operation: &str) {
        if let Some((at, handle)) = self.trigger.lock().unwrap().as_ref() {
            if *at == operation {
                handle.request(format!("terminated during {}", operation));
            }
        }
    }
}

#[async_trait]
impl MountStrategy for FolderMount {
    fn name(&self) -> &'static str {
        "folder"
    }

    async fn mount(&self, working_dir: &Path, _target: &MountTarget) -> cryptdrive::Result<()> {
        fs::create_dir_all(working_dir).map_err(|e| DriveError::mount(e.to_string()))?;
        *self.mounted.lock().unwrap() = true;
        self.log.lock().unwrap().push("mount".into());
        self.terminate_if("mount");
        Ok(())
    }

    async fn unmount(&self, _target: &MountTarget) -> cryptdrive::Result<()> {
        let mut mounted = self.mounted.lock().unwrap();
        if !*mounted {
            return Err(DriveError::mount("nothing mounted"));
        }
        if self.fail_unmount {
            return Err(DriveError::mount("device busy"));
        }
        *mounted = false;
        self.log.lock().unwrap().push("unmount".into());
        self.terminate_if("unmount");
        Ok(())
    }

    async fn open(&self, _target: &MountTarget) -> cryptdrive::Result<()> {
        self.log.lock().unwrap().push("open".into());
        self.terminate_if("open");
        Ok(())
    }
}

/// Plays the user: writes files into the drive, then asks to close it.
struct UserEdits {
    files: Vec<(&'static str, &'static str)>,
    seen: Arc<Mutex<BTreeSet<String>>>,
}

impl UserEdits {
    fn writing(files: &[(&'static str, &'static str)]) -> Self {
        Self {
            files: files.to_vec(),
            seen: Arc::default(),
        }
    }
}

#[async_trait]
impl UnmountSignal for UserEdits {
    async fn wait(&mut self, session: &Session) -> cryptdrive::Result<()> {
        let mut seen = self.seen.lock().unwrap();
        for entry in fs::read_dir(&session.working_dir).unwrap() {
            seen.insert(entry.unwrap().file_name().to_string_lossy().into_owned());
        }
        for (name, content) in &self.files {
            fs::write(session.working_dir.join(name), content).unwrap();
        }
        Ok(())
    }
}

/// The user session ends abnormally (e.g. the process is interrupted).
struct Interrupted;

#[async_trait]
impl UnmountSignal for Interrupted {
    async fn wait(&mut self, session: &Session) -> cryptdrive::Result<()> {
        fs::write(session.working_dir.join("unsaved.txt"), "lost").unwrap();
        Err(DriveError::interrupted("test interrupt"))
    }
}

/// The user never closes the drive; the process is terminated instead.
struct TerminatedWhileWaiting(ShutdownHandle);

#[async_trait]
impl UnmountSignal for TerminatedWhileWaiting {
    async fn wait(&mut self, session: &Session) -> cryptdrive::Result<()> {
        fs::write(session.working_dir.join("unsaved.txt"), "lost").unwrap();
        self.0.request("terminate signal");
        std::future::pending().await
    }
}

#[derive(Clone, Default)]
struct RecordingObserver(Arc<Mutex<Vec<SessionState>>>);

impl SessionObserver for RecordingObserver {
    fn on_transition(&self, state: SessionState, _session: &Session) {
        self.0.lock().unwrap().push(state);
    }
}

struct Outcome {
    result: cryptdrive::Result<()>,
    states: Vec<SessionState>,
    mount_log: Vec<String>,
    cleanup_problems: usize,
}

fn test_config(tmp: &TempDir) -> Config {
    Config {
        drive: "A".to_string(),
        key_path: tmp.path().join("key.txt"),
        container_path: tmp.path().join("encrypted"),
        working_dir: tmp.path().join("drive"),
        archive_path: tmp.path().join("drive.tar.gz"),
        image_path: tmp.path().join("drive.img"),
        image_size_mb: 1,
        mount_root: tmp.path().join("mnt"),
    }
}

async fn run_session_with(
    cfg: &Config,
    mount: FolderMount,
    signal: impl UnmountSignal + 'static,
    terminate_during: Option<&'static str>,
) -> Result<Outcome> {
    let log = Arc::clone(&mount.log);
    let trigger = Arc::clone(&mount.trigger);
    let observer = RecordingObserver::default();
    let mut orchestrator =
        SessionOrchestrator::new(cfg.clone(), Box::new(mount), Arc::new(AgeProvider::new()))?
            .with_signal(signal)
            .with_observer(observer.clone());
    if let Some(operation) = terminate_during {
        *trigger.lock().unwrap() = Some((operation, orchestrator.shutdown_handle()));
    }

    let result = orchestrator.run().await;
    let cleanup_problems = orchestrator.cleanup().await.len();

    let states = observer.0.lock().unwrap().clone();
    let mount_log = log.lock().unwrap().clone();
    Ok(Outcome {
        result,
        states,
        mount_log,
        cleanup_problems,
    })
}

async fn run_session(cfg: &Config, signal: impl UnmountSignal + 'static) -> Result<Outcome> {
    run_session_with(cfg, FolderMount::new(Arc::default()), signal, None).await
}

/// Decrypt and unpack the container into `out`, the way the next session would.
async fn open_container(cfg: &Config, out: &Path) -> Result<()> {
    let provider = Arc::new(AgeProvider::new());
    let key = KeyManager::new(cfg, provider.clone()).load_key_material().await?;
    let archive_path = out.with_extension("tar.gz");
    ContainerOps::new(provider)
        .decrypt_in_place(&cfg.container_path, &archive_path, key)
        .await?;
    archive::unpack(&archive_path, out).await?;
    fs::remove_file(archive_path)?;
    Ok(())
}

fn dir_names(path: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(path)? {
        names.insert(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn full_session_leaves_only_the_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;

    let outcome = run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")])).await?;

    outcome.result?;
    assert_eq!(outcome.cleanup_problems, 0);
    assert_eq!(
        outcome.states,
        vec![
            SessionState::Start,
            SessionState::Cleaned,
            SessionState::Keyed,
            SessionState::NoContainer,
            SessionState::Mounted,
            SessionState::Opened,
            SessionState::AwaitingSignal,
            SessionState::Unmounted,
            SessionState::Archived,
            SessionState::ClearedPlaintext,
            SessionState::ReKeyed,
            SessionState::Encrypted,
            SessionState::CleanedUp,
        ]
    );
    assert_eq!(outcome.mount_log, vec!["mount", "open", "unmount"]);

    // Exactly one container, no plaintext, no backup
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));

    let check = TempDir::new()?;
    let tree = check.path().join("tree");
    open_container(&cfg, &tree).await?;
    assert_eq!(dir_names(&tree)?, names(&["a.txt"]));
    assert_eq!(fs::read_to_string(tree.join("a.txt"))?, "hello");
    Ok(())
}

#[tokio::test]
async fn next_session_sees_previous_contents() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "  s3cr3t\n")?;

    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;

    let second = UserEdits::writing(&[("b.txt", "world")]);
    let seen = Arc::clone(&second.seen);
    let outcome = run_session(&cfg, second).await?;
    outcome.result?;

    assert!(outcome.states.contains(&SessionState::DecryptedExtracted));
    assert_eq!(*seen.lock().unwrap(), names(&["a.txt"]));
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));

    let check = TempDir::new()?;
    let tree = check.path().join("tree");
    open_container(&cfg, &tree).await?;
    assert_eq!(fs::read_to_string(tree.join("a.txt"))?, "hello");
    assert_eq!(fs::read_to_string(tree.join("b.txt"))?, "world");
    Ok(())
}

#[tokio::test]
async fn corrupted_container_aborts_before_mount() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;

    let full = fs::read(&cfg.container_path)?;
    let truncated = &full[..full.len() / 2];
    fs::write(&cfg.container_path, truncated)?;

    let outcome = run_session(&cfg, UserEdits::writing(&[])).await?;

    assert!(
        matches!(outcome.result, Err(DriveError::Crypto(_)) | Err(DriveError::Archive(_))),
        "unexpected: {:?}",
        outcome.result
    );
    assert!(outcome.mount_log.is_empty(), "plaintext must never be exposed");
    assert_eq!(outcome.states.last(), Some(&SessionState::Aborted));
    assert!(!cfg.working_dir.exists());
    assert!(!cfg.archive_path.exists());
    assert_eq!(fs::read(&cfg.container_path)?, truncated);
    Ok(())
}

#[tokio::test]
async fn wrong_key_leaves_container_unchanged() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;
    let before = fs::read(&cfg.container_path)?;

    fs::write(&cfg.key_path, "not the secret")?;
    let outcome = run_session(&cfg, UserEdits::writing(&[])).await?;

    assert!(matches!(outcome.result, Err(DriveError::Crypto(_))));
    assert!(outcome.mount_log.is_empty());
    assert_eq!(fs::read(&cfg.container_path)?, before);
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));
    Ok(())
}

#[tokio::test]
async fn invalid_drive_letter_is_rejected_before_any_mutation() -> Result<()> {
    let tmp = TempDir::new()?;
    fs::write(tmp.path().join("key.txt"), "s3cr3t")?;

    for bad in ["1", "AB"] {
        let cfg = Config {
            drive: bad.to_string(),
            ..test_config(&tmp)
        };
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let result = SessionOrchestrator::new(
            cfg.clone(),
            Box::new(FolderMount::new(Arc::clone(&log))),
            Arc::new(AgeProvider::new()),
        );

        assert!(matches!(result, Err(DriveError::Config(_))), "{bad}");
        assert!(log.lock().unwrap().is_empty());
        assert!(!cfg.working_dir.exists());
    }
    assert_eq!(dir_names(tmp.path())?, names(&["key.txt"]));
    Ok(())
}

#[tokio::test]
async fn missing_or_empty_key_aborts_before_mount() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);

    let outcome = run_session(&cfg, UserEdits::writing(&[])).await?;
    assert!(matches!(outcome.result, Err(DriveError::Key(_))));
    assert!(outcome.mount_log.is_empty());

    fs::write(&cfg.key_path, " \n")?;
    let outcome = run_session(&cfg, UserEdits::writing(&[])).await?;
    assert!(matches!(outcome.result, Err(DriveError::Key(_))));
    assert!(outcome.mount_log.is_empty());
    assert!(!cfg.working_dir.exists());
    Ok(())
}

#[tokio::test]
async fn interrupted_session_falls_back_to_previous_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;
    let before = fs::read(&cfg.container_path)?;

    let outcome = run_session(&cfg, Interrupted).await?;

    assert!(matches!(outcome.result, Err(DriveError::Interrupted(_))));
    assert_eq!(outcome.cleanup_problems, 0);
    // Cleanup tore the volume down even though the session never did
    assert_eq!(outcome.mount_log, vec!["mount", "open", "unmount"]);
    assert_eq!(fs::read(&cfg.container_path)?, before);
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));
    Ok(())
}

#[tokio::test]
async fn failed_unmount_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;

    let mount = FolderMount {
        fail_unmount: true,
        ..FolderMount::new(Arc::default())
    };
    let outcome =
        run_session_with(&cfg, mount, UserEdits::writing(&[("a.txt", "x")]), None).await?;

    assert!(matches!(outcome.result, Err(DriveError::Mount(_))));
    assert!(!outcome.states.contains(&SessionState::Unmounted));
    assert!(!outcome.states.contains(&SessionState::Archived));
    // The teardown failure during cleanup is reported, not raised
    assert_eq!(outcome.cleanup_problems, 1);
    assert!(!cfg.working_dir.exists());
    assert!(!cfg.container_path.exists());
    Ok(())
}

#[tokio::test]
async fn startup_recovers_from_a_crashed_run() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;

    // A run that died mid-session: container already moved to the backup,
    // plaintext still lying around.
    fs::rename(&cfg.container_path, BackupGuard::backup_path(&cfg.container_path))?;
    fs::create_dir_all(&cfg.working_dir)?;
    fs::write(cfg.working_dir.join("stale.txt"), "stale")?;
    fs::write(&cfg.archive_path, "half an archive")?;

    let second = UserEdits::writing(&[]);
    let seen = Arc::clone(&second.seen);
    let outcome = run_session(&cfg, second).await?;
    outcome.result?;

    assert_eq!(*seen.lock().unwrap(), names(&["a.txt"]));
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));
    Ok(())
}

#[tokio::test]
async fn container_inside_working_folder_is_rejected_before_cleanup() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;

    // Container moved into what the next config calls the working folder,
    // spelled through a `..` detour.
    fs::create_dir_all(tmp.path().join("drive"))?;
    fs::create_dir_all(tmp.path().join("sub"))?;
    let inside = tmp.path().join("drive/encrypted");
    fs::rename(&cfg.container_path, &inside)?;
    let before = fs::read(&inside)?;

    let cfg = Config {
        container_path: inside.clone(),
        working_dir: tmp.path().join("sub/../drive"),
        ..cfg
    };
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let result = SessionOrchestrator::new(
        cfg,
        Box::new(FolderMount::new(Arc::clone(&log))),
        Arc::new(AgeProvider::new()),
    );

    assert!(matches!(result, Err(DriveError::Config(_))));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(fs::read(&inside)?, before);
    Ok(())
}

#[tokio::test]
async fn termination_before_the_user_session_stops_at_the_next_step() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;
    let before = fs::read(&cfg.container_path)?;

    let outcome = run_session_with(
        &cfg,
        FolderMount::new(Arc::default()),
        UserEdits::writing(&[("b.txt", "never written")]),
        Some("mount"),
    )
    .await?;

    assert!(matches!(outcome.result, Err(DriveError::Interrupted(_))));
    // The mount step completed; nothing after it ran
    assert!(outcome.states.contains(&SessionState::Mounted));
    assert!(!outcome.states.contains(&SessionState::Opened));
    assert_eq!(outcome.mount_log, vec!["mount", "unmount"]);
    assert_eq!(outcome.cleanup_problems, 0);
    assert_eq!(fs::read(&cfg.container_path)?, before);
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));
    Ok(())
}

#[tokio::test]
async fn termination_while_waiting_falls_back_to_previous_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;
    let before = fs::read(&cfg.container_path)?;

    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let orchestrator = SessionOrchestrator::new(
        cfg.clone(),
        Box::new(FolderMount::new(Arc::clone(&log))),
        Arc::new(AgeProvider::new()),
    )?;
    let handle = orchestrator.shutdown_handle();
    let mut orchestrator = orchestrator.with_signal(TerminatedWhileWaiting(handle));

    let result = orchestrator.run().await;
    let problems = orchestrator.cleanup().await;

    assert!(matches!(result, Err(DriveError::Interrupted(_))));
    assert!(problems.is_empty());
    assert_eq!(orchestrator.session().state(), SessionState::Aborted);
    assert_eq!(*log.lock().unwrap(), vec!["mount", "open", "unmount"]);
    assert_eq!(fs::read(&cfg.container_path)?, before);
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));
    Ok(())
}

#[tokio::test]
async fn termination_while_closing_still_encrypts_edits() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;
    run_session(&cfg, UserEdits::writing(&[("a.txt", "hello")]))
        .await?
        .result?;

    // Requested while the volume is being torn down, ahead of archiving and
    // encryption.
    let outcome = run_session_with(
        &cfg,
        FolderMount::new(Arc::default()),
        UserEdits::writing(&[("b.txt", "world")]),
        Some("unmount"),
    )
    .await?;

    outcome.result?;
    assert_eq!(outcome.cleanup_problems, 0);
    for state in [
        SessionState::Archived,
        SessionState::Encrypted,
        SessionState::CleanedUp,
    ] {
        assert!(outcome.states.contains(&state), "{state:?}");
    }
    assert_eq!(dir_names(tmp.path())?, names(&["encrypted", "key.txt"]));

    let check = TempDir::new()?;
    let tree = check.path().join("tree");
    open_container(&cfg, &tree).await?;
    assert_eq!(fs::read_to_string(tree.join("a.txt"))?, "hello");
    assert_eq!(fs::read_to_string(tree.join("b.txt"))?, "world");
    Ok(())
}

/// Adds a directory and a symlink to it.
#[cfg(unix)]
struct MakesLinks;

#[cfg(unix)]
#[async_trait]
impl UnmountSignal for MakesLinks {
    async fn wait(&mut self, session: &Session) -> cryptdrive::Result<()> {
        fs::create_dir_all(session.working_dir.join("real")).unwrap();
        fs::write(session.working_dir.join("real/a.txt"), "hello").unwrap();
        std::os::unix::fs::symlink("real", session.working_dir.join("link")).unwrap();
        Ok(())
    }
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_survive_a_session() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    fs::write(&cfg.key_path, "s3cr3t")?;

    run_session(&cfg, MakesLinks).await?.result?;

    let check = TempDir::new()?;
    let tree = check.path().join("tree");
    open_container(&cfg, &tree).await?;
    assert_eq!(fs::read_link(tree.join("link"))?, Path::new("real"));
    assert_eq!(fs::read_to_string(tree.join("link/a.txt"))?, "hello");
    Ok(())
}
