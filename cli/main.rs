use anyhow::{Context, Result};
use clap::Parser;
use cryptdrive::config::Config;
use cryptdrive::encryptor::AgeProvider;
use cryptdrive::mount::{self, HostPlatform, SystemRunner};
use cryptdrive::session::{Session, SessionObserver, SessionOrchestrator, SessionState};
use cryptdrive::DriveError;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// `println!` that tolerates a vanished terminal, e.g. after a hangup.
macro_rules! say {
    () => { say!("") };
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let _ = writeln!(std::io::stdout(), $($arg)*);
    }};
}

/// `eprintln!` counterpart of [`say!`].
macro_rules! complain {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}

/// CryptDrive - mount an encrypted folder as a drive for one session
#[derive(Parser, Debug)]
#[command(name = "cryptdrive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Drive letter to mount as, a single uppercase letter [default: A]
    #[arg(short, long)]
    drive: Option<String>,

    /// Key file holding the secret [default: ./key.txt]
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Encrypted container file [default: ./encrypted]
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Plaintext working folder used during the session [default: ./drive]
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Optional JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the user-facing progress.
    // Use RUST_LOG to control log level (e.g., RUST_LOG=cryptdrive=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(args = ?cli, "CryptDrive starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "session failed");
            complain!("Error: {:#}", e);
            let code = e
                .downcast_ref::<DriveError>()
                .map(DriveError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = build_config(&cli).context("invalid configuration")?;
    let strategy = mount::strategy_for(&HostPlatform::detect(), &cfg, Arc::new(SystemRunner))?;
    info!(strategy = strategy.name(), "mount strategy selected");

    let mut orchestrator =
        SessionOrchestrator::new(cfg, strategy, Arc::new(AgeProvider::new()))?
            .with_observer(ConsoleObserver::default());
    let mut guard = orchestrator.exit_guard();

    // Signals are forwarded to the orchestrator, which stops between steps;
    // the running step is never dropped mid-write.
    let shutdown = orchestrator.shutdown_handle();
    let listener = tokio::spawn(async move {
        loop {
            let signal = shutdown_signal().await;
            warn!(signal, "termination requested, stopping at the next safe point");
            shutdown.request(format!("received {}", signal));
        }
    });

    let outcome = orchestrator.run().await;
    let problems = orchestrator.cleanup().await;
    listener.abort();

    if problems.is_empty() {
        guard.disarm();
    } else {
        complain!(
            "Warning: {} cleanup step(s) failed, check the log for leftovers",
            problems.len()
        );
    }

    outcome?;
    say!("Drive closed. Data is encrypted in the container.");
    Ok(())
}

/// Defaults < config file < environment < flags, validated once.
fn build_config(cli: &Cli) -> Result<Config, DriveError> {
    let mut cfg = Config::load_with_env(cli.config.as_deref())?;
    if let Some(drive) = &cli.drive {
        cfg.drive = drive.clone();
    }
    if let Some(key) = &cli.key {
        cfg.key_path = key.clone();
    }
    if let Some(file) = &cli.file {
        cfg.container_path = file.clone();
    }
    if let Some(workdir) = &cli.workdir {
        cfg.working_dir = workdir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Resolve on Ctrl-C or any platform signal that ends the process: SIGTERM
/// and SIGHUP (terminal closed) on Unix, console close and logoff on Windows.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => "interrupt",
        name = platform_signal() => name,
    }
}

#[cfg(unix)]
async fn platform_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    async fn next(kind: SignalKind) {
        match signal(kind) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }

    tokio::select! {
        _ = next(SignalKind::terminate()) => "terminate signal",
        _ = next(SignalKind::hangup()) => "hangup signal",
    }
}

#[cfg(windows)]
async fn platform_signal() -> &'static str {
    use tokio::signal::windows::{ctrl_close, ctrl_logoff};

    let close = async {
        match ctrl_close() {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    let logoff = async {
        match ctrl_logoff() {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = close => "console close",
        _ = logoff => "logoff",
    }
}

#[cfg(not(any(unix, windows)))]
async fn platform_signal() -> &'static str {
    std::future::pending().await
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Human-readable progress on stdout.
#[derive(Default)]
struct ConsoleObserver {
    spinner: Mutex<Option<ProgressBar>>,
}

impl SessionObserver for ConsoleObserver {
    fn on_transition(&self, state: SessionState, session: &Session) {
        let Ok(mut slot) = self.spinner.lock() else {
            return;
        };
        if let Some(pb) = slot.take() {
            pb.finish_and_clear();
        }

        match state {
            SessionState::Start | SessionState::CleanedUp => {}
            SessionState::Keyed => {
                say!("  {}", state);
                if session.container_path.exists() {
                    *slot = Some(create_spinner("Decrypting container..."));
                }
            }
            SessionState::Mounted => {
                say!("  {} as {}", state, session.target.drive_spec());
                say!();
                say!("WARNING: Do NOT close this window or kill this process while the");
                say!("drive is mounted. Your files exist only in plaintext until it is");
                say!("closed and encrypted.");
                say!();
            }
            SessionState::AwaitingSignal => {
                say!("Press Enter to close the drive and encrypt its contents.");
            }
            SessionState::Unmounted => {
                say!("  {}", state);
                *slot = Some(create_spinner("Archiving drive..."));
            }
            SessionState::ReKeyed => {
                say!("  {}", state);
                *slot = Some(create_spinner("Encrypting container..."));
            }
            SessionState::Aborted => {
                say!("  session {}", state);
            }
            other => say!("  {}", other),
        }
    }
}
