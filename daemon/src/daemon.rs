//! Daemon lifecycle: background start, the foreground poll loop, stop, and
//! the `status` / `check` reports.
//!
//! The CLI process and the daemon share nothing in memory. They coordinate
//! through the pid file, POSIX signals, `status.toml` and the SQLite store.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::event::DaemonEvent;
use crate::history::HistoryLog;
use crate::notifier::{self, Notifier};
use crate::paths::{StatePaths, HOME_ENV_VAR};
use crate::pidfile::{self, DaemonError, PidGuard};
use crate::poller::{poll_cycle, CycleReport, PollContext};
use crate::repos::{RepoList, TrackedRepository};
use crate::source::{GhCli, StatusSource};
use crate::status::{read_status, write_status, DaemonState, DaemonStatus};
use crate::store::RunStore;

/// Time `stop` allows beyond the daemon's command timeout before
/// force-killing, so an announcement in progress can still be committed.
const STOP_MARGIN: Duration = Duration::from_secs(5);
/// How long `start` waits for the background child to take the pid file.
const STARTUP_WAIT: Duration = Duration::from_secs(3);

// ── start ─────────────────────────────────────────────────────────────────────

/// Starts the monitor. By default a detached child running
/// `ci-monitor start --foreground` is spawned with output redirected to
/// `daemon.log`; with `foreground` the loop runs inline until signalled.
pub async fn start(paths: &StatePaths, foreground: bool) -> Result<()> {
    let repos = RepoList::new(&paths.repos_file()).list()?;
    if repos.is_empty() {
        bail!("no repositories tracked; add one with `ci-monitor add <owner/repo>` first");
    }
    if !GhCli::is_installed() {
        warn!("GitHub CLI `gh` not found on PATH; every status query will fail until it is installed");
    }
    if let Some(pid) = pidfile::running_pid(&paths.pid_file()) {
        return Err(DaemonError::AlreadyRunning { pid }.into());
    }

    if foreground {
        run(paths).await
    } else {
        spawn_background(paths).await
    }
}

async fn spawn_background(paths: &StatePaths) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate ci-monitor executable")?;
    let log = paths.daemon_log_file();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .with_context(|| format!("failed to open log file {}", log.display()))?;
    let stderr_file = log_file
        .try_clone()
        .context("failed to clone log file handle")?;

    let mut cmd = std::process::Command::new(exe);
    cmd.args(["start", "--foreground"])
        .env(HOME_ENV_VAR, paths.root())
        .stdin(std::process::Stdio::null())
        .stdout(log_file)
        .stderr(stderr_file);

    // Own process group, so the daemon outlives the terminal that started it.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("failed to spawn daemon process")?;
    let pid = child.id();

    let mut confirmed = false;
    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(status) = child.try_wait().context("failed to poll daemon process")? {
            bail!(
                "daemon exited during startup ({status}); see {}",
                log.display()
            );
        }
        if pidfile::read_pid(&paths.pid_file()) == Some(pid) {
            confirmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("{}", startup_report(pid, confirmed));
    println!("Logs: {}", log.display());
    Ok(())
}

fn startup_report(pid: u32, confirmed: bool) -> String {
    if confirmed {
        format!("Monitoring started (PID {pid})")
    } else {
        format!(
            "Daemon spawned (PID {pid}) but it has not confirmed startup after {}s; check the log",
            STARTUP_WAIT.as_secs()
        )
    }
}

// ── run ───────────────────────────────────────────────────────────────────────

/// Status source and notifier for one config generation. Rebuilt whenever the
/// config is reloaded.
pub struct Collaborators {
    pub source: Box<dyn StatusSource>,
    pub notifier: Option<Box<dyn Notifier>>,
}

impl Collaborators {
    pub fn for_config(config: &Config) -> Self {
        Self {
            source: Box::new(GhCli::new(config.effective_command_timeout())),
            notifier: notifier::select(config),
        }
    }
}

/// Long-lived state the control loop works against.
pub struct LoopEnv<'a> {
    pub store: &'a RunStore,
    pub history: &'a HistoryLog,
    pub repo_list: &'a RepoList,
    pub status_path: &'a Path,
}

/// The daemon body: holds the pid file, polls on the configured interval and
/// exits cleanly on SIGTERM / Ctrl+C. Only a Run Store failure is fatal.
pub async fn run(paths: &StatePaths) -> Result<()> {
    let _guard = PidGuard::acquire(&paths.pid_file())?;
    let status_path = paths.status_file();
    let mut status = DaemonStatus::new(std::process::id());
    status.transition(DaemonState::Starting);
    write_status(&status_path, &status);

    let store = match RunStore::open(&paths.store_file()) {
        Ok(store) => store,
        Err(e) => {
            error!("Cannot open run store, refusing to run without dedup: {e}");
            status.last_error = Some(e.to_string());
            status.transition(DaemonState::Stopped);
            write_status(&status_path, &status);
            return Err(e).context("failed to open run store");
        }
    };

    let config = config::load_or_default(&paths.config_file()).unwrap_or_else(|e| {
        warn!("Config error (using defaults): {e}");
        Config::default()
    });

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);
    tokio::spawn(config::watch_config(paths.config_file(), event_tx.clone()));
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(DaemonEvent::Shutdown).await;
        });
    }

    let history = HistoryLog::new(&paths.history_file());
    let repo_list = RepoList::new(&paths.repos_file());
    let env = LoopEnv {
        store: &store,
        history: &history,
        repo_list: &repo_list,
        status_path: &status_path,
    };

    status.transition(DaemonState::Running);
    write_status(&status_path, &status);
    info!("Monitoring started (PID {})", status.pid);

    let outcome = control_loop(
        &env,
        config,
        Collaborators::for_config,
        &mut event_rx,
        &mut status,
    )
    .await;

    status.transition(DaemonState::Stopping);
    write_status(&status_path, &status);
    drop(store);
    status.transition(DaemonState::Stopped);
    write_status(&status_path, &status);
    info!("Monitoring stopped");
    outcome
}

/// Poll, sleep, repeat until a `Shutdown` event arrives.
///
/// A reloaded config takes effect at the start of the next cycle, when
/// `build` turns it into fresh collaborators. Shutdown interrupts the
/// inter-cycle sleep immediately and a cycle at the next repository boundary.
pub async fn control_loop<F>(
    env: &LoopEnv<'_>,
    mut config: Config,
    build: F,
    event_rx: &mut mpsc::Receiver<DaemonEvent>,
    status: &mut DaemonStatus,
) -> Result<()>
where
    F: Fn(&Config) -> Collaborators,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut parts = build(&config);
    let mut pending_config: Option<Config> = None;
    info!(
        "Checking every {}s, notifier: {}",
        config.check_interval,
        describe_notifier(parts.notifier.as_deref())
    );

    loop {
        if let Some(new_config) = pending_config.take() {
            config = new_config;
            parts = build(&config);
            info!(
                "Configuration reloaded (every {}s, notifier: {})",
                config.check_interval,
                describe_notifier(parts.notifier.as_deref())
            );
        }
        status.command_timeout_secs = config.effective_command_timeout().as_secs();

        let repos = env.repo_list.list().unwrap_or_else(|e| {
            warn!("Cannot read repository list: {e}");
            Vec::new()
        });
        status.tracked_repositories = repos.len();

        let result = {
            let ctx = PollContext {
                source: parts.source.as_ref(),
                notifier: parts.notifier.as_deref(),
                store: env.store,
                history: env.history,
            };
            let cycle = poll_cycle(&ctx, &config, &repos, &shutdown_rx);
            tokio::pin!(cycle);
            loop {
                tokio::select! {
                    res = &mut cycle => break res,
                    Some(event) = event_rx.recv() => {
                        record_event(event, &mut pending_config, &shutdown_tx);
                    }
                }
            }
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!("Run store failure, stopping: {e}");
                status.last_error = Some(e.to_string());
                write_status(env.status_path, status);
                return Err(e).context("run store failure");
            }
        };
        status.last_cycle_at = Some(chrono::Local::now().to_rfc3339());
        status.last_error = cycle_problem(&report, &repos);
        write_status(env.status_path, status);

        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let sleep = tokio::time::sleep(config.interval());
        tokio::pin!(sleep);
        while !*shutdown_rx.borrow() {
            tokio::select! {
                _ = &mut sleep => break,
                Some(event) = event_rx.recv() => {
                    record_event(event, &mut pending_config, &shutdown_tx);
                }
            }
        }
        if *shutdown_rx.borrow() {
            return Ok(());
        }
    }
}

fn record_event(
    event: DaemonEvent,
    pending_config: &mut Option<Config>,
    shutdown_tx: &watch::Sender<bool>,
) {
    match event {
        DaemonEvent::ConfigReloaded(config) => *pending_config = Some(config),
        DaemonEvent::Shutdown => {
            info!("Shutdown requested");
            shutdown_tx.send_replace(true);
        }
    }
}

fn cycle_problem(report: &CycleReport, repos: &[TrackedRepository]) -> Option<String> {
    (report.failed > 0).then(|| {
        format!(
            "{} of {} repositories could not be queried",
            report.failed,
            repos.len()
        )
    })
}

fn describe_notifier(notifier: Option<&dyn Notifier>) -> String {
    notifier.map_or_else(|| "log only".to_string(), |n| n.describe())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── stop ──────────────────────────────────────────────────────────────────────

pub async fn stop(paths: &StatePaths) -> Result<()> {
    let pid_path = paths.pid_file();
    let Some(pid) = pidfile::running_pid(&pid_path) else {
        return Err(DaemonError::NotRunning.into());
    };

    let config = config::load_or_default(&paths.config_file()).unwrap_or_else(|e| {
        warn!("Config error (using defaults): {e}");
        Config::default()
    });
    let grace = stop_grace(&config, read_status(&paths.status_file()).as_ref());
    if pidfile::terminate(pid, grace).await {
        // A killed daemon cannot clean up after itself.
        let _ = std::fs::remove_file(&pid_path);
        if let Some(mut status) = read_status(&paths.status_file()) {
            status.transition(DaemonState::Stopping);
            status.transition(DaemonState::Stopped);
            write_status(&paths.status_file(), &status);
        }
        println!("Monitoring killed (PID {pid})");
    } else {
        println!("Monitoring stopped (PID {pid})");
    }
    Ok(())
}

/// How long to wait for a graceful exit. A stop that arrives mid-announcement
/// lets the speech command run out its timeout and the run be committed.
/// The daemon's own timeout (from its status snapshot) is honoured when the
/// config file has changed since it was loaded.
fn stop_grace(config: &Config, snapshot: Option<&DaemonStatus>) -> Duration {
    let daemon_timeout = Duration::from_secs(snapshot.map_or(0, |s| s.command_timeout_secs));
    config.effective_command_timeout().max(daemon_timeout) + STOP_MARGIN
}

// ── status / check ────────────────────────────────────────────────────────────

pub fn status(paths: &StatePaths) -> Result<()> {
    let config = config::load_or_default(&paths.config_file())?;
    let repos = RepoList::new(&paths.repos_file()).list()?;

    match pidfile::running_pid(&paths.pid_file()) {
        Some(pid) => {
            let uptime = pidfile::process_uptime(pid)
                .map(format_uptime)
                .unwrap_or_else(|| "unknown".to_string());
            println!("Status: running (PID {pid}, up {uptime})");
            if let Some(snapshot) = read_status(&paths.status_file()) {
                if let Some(at) = snapshot.last_cycle_at {
                    println!("Last check: {at}");
                }
                if let Some(problem) = snapshot.last_error {
                    println!("Last error: {problem}");
                }
            }
        }
        None => println!("Status: stopped"),
    }

    println!("Check interval: {}s", config.check_interval);
    println!(
        "Speech: {}",
        if config.speech_enabled { "on" } else { "off" }
    );
    let store_path = paths.store_file();
    if store_path.exists() {
        match RunStore::open_read_only(&store_path).and_then(|store| store.count()) {
            Ok(n) => println!("Recorded runs: {n}"),
            Err(e) => println!("Recorded runs: unavailable ({e})"),
        }
    }
    println!("Tracked repositories ({}):", repos.len());
    if repos.is_empty() {
        println!("  (none)");
    }
    for repo in &repos {
        println!("  {repo}");
    }
    Ok(())
}

/// Runs exactly one poll cycle in this process, ignoring any running daemon.
pub async fn check_once(paths: &StatePaths) -> Result<CycleReport> {
    let config = config::load_or_default(&paths.config_file())?;
    let repos = RepoList::new(&paths.repos_file()).list()?;
    if repos.is_empty() {
        println!("No repositories tracked.");
        return Ok(CycleReport::default());
    }

    let store = RunStore::open(&paths.store_file()).context("failed to open run store")?;
    let history = HistoryLog::new(&paths.history_file());
    let parts = Collaborators::for_config(&config);
    let ctx = PollContext {
        source: parts.source.as_ref(),
        notifier: parts.notifier.as_deref(),
        store: &store,
        history: &history,
    };

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = poll_cycle(&ctx, &config, &repos, &shutdown_rx).await?;
    println!(
        "Checked {} repositories: {} new, {} announced, {} in progress, {} already seen, {} failed",
        report.checked,
        report.recorded,
        report.announced,
        report.pending,
        report.already_seen,
        report.failed
    );
    Ok(report)
}

/// `3725s` → `1h 2m 5s`.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
