/// Canonical file paths for ci-monitor state.
///
/// Everything lives under one per-user directory (`~/.ci-monitor` unless
/// `CI_MONITOR_HOME` points elsewhere):
///   - config.toml  Settings, edited with `ci-monitor config`.
///   - repos.txt    Tracked `owner/repo` identifiers, one per line.
///   - history.log  Append-only human-readable record of announced runs.
///   - state.db     SQLite dedup store (runs already announced).
///   - daemon.log   stdout/stderr of the background process.
///   - daemon.pid   PID of the running daemon.
///   - status.toml  Written by the daemon, read by `ci-monitor status`.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = ".ci-monitor";
/// Overrides the state directory; also used to hand the directory to the
/// background process.
pub const HOME_ENV_VAR: &str = "CI_MONITOR_HOME";

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const REPOS_FILE_NAME: &str = "repos.txt";
pub const HISTORY_FILE_NAME: &str = "history.log";
pub const STORE_FILE_NAME: &str = "state.db";
pub const DAEMON_LOG_FILE_NAME: &str = "daemon.log";
pub const PID_FILE_NAME: &str = "daemon.pid";
pub const STATUS_FILE_NAME: &str = "status.toml";

#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the state directory from `CI_MONITOR_HOME`, falling back to
    /// `~/.ci-monitor`.
    pub fn resolve() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().context("Could not determine the home directory")?;
        Ok(Self::new(home.join(APP_DIR_NAME)))
    }

    /// Creates the state directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create state directory {}", self.root.display())
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn repos_file(&self) -> PathBuf {
        self.root.join(REPOS_FILE_NAME)
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(HISTORY_FILE_NAME)
    }

    pub fn store_file(&self) -> PathBuf {
        self.root.join(STORE_FILE_NAME)
    }

    pub fn daemon_log_file(&self) -> PathBuf {
        self.root.join(DAEMON_LOG_FILE_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE_NAME)
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(STATUS_FILE_NAME)
    }
}
