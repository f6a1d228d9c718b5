use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Lifecycle state of the monitor daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stopped,
    /// Pid file held, store and config being opened.
    Starting,
    /// Poll loop active.
    Running,
    /// Shutdown requested; the in-flight repository is being finished.
    Stopping,
}

impl DaemonState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Snapshot written by the daemon to `status.toml` after every state change
/// and poll cycle. `ci-monitor status` reads it (read-only).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    pub version: String,
    pub state: DaemonState,
    pub pid: u32,
    /// RFC 3339 timestamp of daemon start.
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<String>,
    /// Human-readable description of the last cycle-level problem, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub tracked_repositories: usize,
    /// Effective bound on each `gh` query and speech call, so `stop` can wait
    /// long enough for an announcement in progress to be committed.
    #[serde(default)]
    pub command_timeout_secs: u64,
}

impl DaemonStatus {
    pub fn new(pid: u32) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Stopped,
            pid,
            started_at: chrono::Local::now().to_rfc3339(),
            last_cycle_at: None,
            last_error: None,
            tracked_repositories: 0,
            command_timeout_secs: 0,
        }
    }

    /// Moves to `next` if the lifecycle allows it. Illegal transitions are
    /// logged and ignored.
    pub fn transition(&mut self, next: DaemonState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("Ignoring illegal daemon state change {:?} -> {:?}", self.state, next);
            return false;
        }
        self.state = next;
        true
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Errors are logged; a status write failure never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}

/// Reads the last written status, or `None` if absent or unreadable.
pub fn read_status(path: &Path) -> Option<DaemonStatus> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}
