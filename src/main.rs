//! listingd - property listing collection daemon
//!
//! CLI entry point for daemon lifecycle and status inspection.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use listingd::challenge::{ChallengeBroker, FileChallengeStore};
use listingd::cli::{Cli, Command, OutputFormat};
use listingd::config::Config;
use listingd::lock::{LockManager, is_process_alive};
use listingd::scheduler::{CycleScheduler, SchedulerControl, SchedulerDeps};
use listingd::sources::ListingSource;
use listingd::sources::builtin::{CompsValuer, DropDirSource, FileInbox, JsonCatalog, StaticEgressPool};
use listingd::standby::StandbyWatcher;
use listingd::watermark::Watermark;

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    let log_dir = config.storage.log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("listingd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

fn log_path(config: &Config) -> PathBuf {
    config.storage.log_dir().join("listingd.log")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(&config, cli.verbose).context("Failed to setup logging")?;

    match cli.command {
        Some(Command::Start { foreground }) => cmd_start(&config, cli.config.as_ref(), foreground).await,
        Some(Command::Stop) => cmd_stop(&config).await,
        Some(Command::Status { format }) => cmd_status(&config, format).await,
        Some(Command::Logs { follow, lines }) => cmd_logs(&config, follow, lines).await,
        Some(Command::Sources) => cmd_sources(&config).await,
        Some(Command::RunDaemon) => run_daemon(&config).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Start the daemon, forking to the background unless asked not to
async fn cmd_start(config: &Config, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    let lock = lock_manager(config);
    if let Some(pid) = lock.owner_pid().filter(|&pid| is_process_alive(pid)) {
        println!("listingd is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting listingd in foreground mode...");
        return run_daemon(config).await;
    }

    let exe = std::env::current_exe().context("Failed to get current executable")?;
    let mut command = std::process::Command::new(&exe);
    command.arg("run-daemon");
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;

    println!("listingd started (PID: {})", child.id());
    Ok(())
}

/// Stop the running daemon via its lock marker
async fn cmd_stop(config: &Config) -> Result<()> {
    let lock = lock_manager(config);
    let Some(pid) = lock.owner_pid().filter(|&pid| is_process_alive(pid)) else {
        println!("listingd is not running");
        return Ok(());
    };

    println!("Stopping listingd (PID: {})...", pid);

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let mut attempts = 0;
        while is_process_alive(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_alive(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            // A killed owner cannot release its marker; reclaim it here.
            let _ = lock.reclaim_if_stale();
        }
    }

    println!("listingd stopped (was PID: {})", pid);
    Ok(())
}

/// Show daemon status from the lock marker and configuration
async fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    let lock = lock_manager(config);
    let pid = lock.owner_pid();
    let running = pid.is_some_and(is_process_alive);

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": running,
                "pid": pid,
                "lock_file": config.lock_path().to_string_lossy(),
                "sources": config.sources.selected,
                "data_dir": config.storage.data_dir().to_string_lossy(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("listingd Status");
            println!("---------------");
            if running {
                println!("Status: running");
                println!("PID: {}", pid.unwrap());
            } else {
                println!("Status: stopped");
            }
            println!("Lock file: {}", config.lock_path().display());
            println!("Data dir: {}", config.storage.data_dir().display());
            if config.sources.selected.is_empty() {
                println!("Sources: (none selected)");
            } else {
                println!("Sources: {}", config.sources.selected.join(", "));
            }
        }
    }

    Ok(())
}

/// Show logs
async fn cmd_logs(config: &Config, follow: bool, lines: usize) -> Result<()> {
    let log_path = log_path(config);

    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        println!("The daemon may not have been started yet.");
        return Ok(());
    }

    if follow {
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;

        child.wait()?;
    } else {
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let reader = BufReader::new(file);
        let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}

/// List configured sources and their drop directories
async fn cmd_sources(config: &Config) -> Result<()> {
    if config.sources.selected.is_empty() {
        println!("No sources selected.");
        println!("Set sources.selected in the config file or LISTINGD_SOURCES.");
        return Ok(());
    }

    println!("Configured sources:");
    println!();
    for source in &config.sources.selected {
        println!("  {}", source);
        println!("    Drop dir: {}", config.storage.drop_dir(source).display());
        if let Some(limit) = config.concurrency.overrides.get(source) {
            println!("    Concurrency: {} (pinned)", limit);
        }
        println!();
    }

    Ok(())
}

/// Run as the daemon process: acquire the singleton lock or stand by,
/// then drive the scheduler until a signal arrives.
async fn run_daemon(config: &Config) -> Result<()> {
    info!("Daemon starting...");

    let storage = &config.storage;
    let catalog = Arc::new(JsonCatalog::new(storage.catalog_path()));
    let challenge_store = Arc::new(FileChallengeStore::new(storage.challenge_dir()));
    let inbox = Arc::new(FileInbox::new(storage.inbox_dir()));
    let broker = Arc::new(ChallengeBroker::new(
        config.challenge.broker_config(),
        challenge_store,
        inbox,
    ));
    let pool = Arc::new(StaticEgressPool::new(config.concurrency.pool_units));
    let valuer = Arc::new(CompsValuer::new(catalog.clone()));

    let sources: Vec<Arc<dyn ListingSource>> = config
        .sources
        .selected
        .iter()
        .map(|id| {
            Arc::new(DropDirSource::new(id, storage.drop_dir(id), catalog.clone())) as Arc<dyn ListingSource>
        })
        .collect();
    if sources.is_empty() {
        warn!("No sources selected; the daemon will hold the lock and idle");
    }

    let control = SchedulerControl::new();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(4);
    spawn_signal_listener(shutdown_tx, control.clone(), broker.clone())?;

    // Singleton election. Losing is standby, not failure.
    let lock = lock_manager(config);
    let guard = match lock.acquire()? {
        Some(guard) => guard,
        None => {
            let watcher = StandbyWatcher::new(lock.clone(), &config.standby);
            match watcher.wait_for_promotion(&mut shutdown_rx).await? {
                Some(guard) => guard,
                None => {
                    info!("Shutdown during standby, exiting");
                    return Ok(());
                }
            }
        }
    };

    // Primary from here on; now side effects are allowed.
    fs::create_dir_all(storage.data_dir()).context("Failed to create data directory")?;

    let watermark = Watermark::new(storage.watermark_path());
    match watermark.load()? {
        Some(record_id) => info!(last_processed = %record_id, "Resuming incremental scan"),
        None => info!("No watermark found, starting a fresh scan cycle"),
    }

    let scheduler = CycleScheduler::new(
        config.scheduler.clone(),
        config.concurrency.clone(),
        config.retry.clone(),
        SchedulerDeps {
            sources,
            catalog,
            valuer,
            pool,
            broker,
        },
        control,
    );
    let handle = scheduler.handle();

    info!("Daemon running as primary. Send SIGTERM or press Ctrl+C to stop.");
    scheduler.run(shutdown_rx).await?;

    info!(status = ?handle.status().status, "Daemon shutting down");
    guard.release();
    Ok(())
}

/// Forward process signals into scheduler control.
///
/// SIGINT/SIGTERM force-stop the scheduler (abort at the next safe
/// checkpoint, cancel any outstanding challenge) and request shutdown;
/// SIGHUP is acknowledged but configuration reloads on restart only.
fn spawn_signal_listener(
    shutdown_tx: mpsc::Sender<()>,
    control: SchedulerControl,
    broker: Arc<ChallengeBroker>,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        info!("SIGHUP received - configuration reload takes effect on restart");
                    }
                    _ = sigint.recv() => {
                        warn!("SIGINT received");
                        control.force_stop();
                        broker.cancel_active("shutdown");
                        let _ = shutdown_tx.send(()).await;
                    }
                    _ = sigterm.recv() => {
                        warn!("SIGTERM received");
                        control.force_stop();
                        broker.cancel_active("shutdown");
                        let _ = shutdown_tx.send(()).await;
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                control.force_stop();
                broker.cancel_active("shutdown");
                let _ = shutdown_tx.send(()).await;
            }
        });
    }

    Ok(())
}

fn lock_manager(config: &Config) -> LockManager {
    LockManager::new(config.lock_path(), config.lock.stale_after())
}
