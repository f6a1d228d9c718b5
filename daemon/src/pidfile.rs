//! Single-instance guard and process control for the background daemon.
//!
//! The pid file is created with `create_new`, so two daemons racing to start
//! cannot both win. A file left behind by a dead process is detected and
//! replaced.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("pid file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn inspect(pid: u32) -> Option<(ProcessStatus, u64)> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| (p.status(), p.run_time()))
}

pub fn is_process_alive(pid: u32) -> bool {
    match inspect(pid) {
        Some((status, _)) => !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// How long `pid` has been running.
pub fn process_uptime(pid: u32) -> Option<Duration> {
    inspect(pid).map(|(_, secs)| Duration::from_secs(secs))
}

/// PID of the live daemon recorded in `path`. A stale file is removed.
pub fn running_pid(path: &Path) -> Option<u32> {
    let pid = read_pid(path)?;
    if is_process_alive(pid) {
        return Some(pid);
    }
    info!("Removing stale pid file (PID {pid} is not running)");
    let _ = std::fs::remove_file(path);
    None
}

/// Held by the running daemon for its whole lifetime. Dropping it removes the
/// pid file, unless another process has since taken it over.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
    pid: u32,
}

impl PidGuard {
    /// Takes the pid file for this process.
    ///
    /// A stale file is moved aside under a name unique to this process
    /// before the fresh one is created. If another starter replaced the
    /// stale file first, the moved file holds that starter's live pid; it
    /// is put back and this start fails as `AlreadyRunning`.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let pid = std::process::id();
        let io_err = |source| DaemonError::Io {
            path: path.to_path_buf(),
            source,
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            match Self::create(path, pid) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            let observed = read_pid(path);
            match observed {
                Some(existing) if existing != pid && is_process_alive(existing) => {
                    return Err(DaemonError::AlreadyRunning { pid: existing });
                }
                Some(existing) => warn!("Replacing stale pid file left by PID {existing}"),
                None => warn!("Replacing unreadable pid file {}", path.display()),
            }
            clear_stale(path, observed, pid)?;
        }

        Err(io_err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "pid file kept changing while starting",
        )))
    }

    fn create(path: &Path, pid: u32) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{pid}")?;
        file.sync_all()
    }
}

const ACQUIRE_ATTEMPTS: usize = 3;

/// Moves the pid file believed to hold `observed` out of the way. Fails with
/// `AlreadyRunning`, leaving the file in place, if it turns out to belong to
/// a live daemon that took it over in the meantime.
fn clear_stale(path: &Path, observed: Option<u32>, pid: u32) -> Result<(), DaemonError> {
    let aside = path.with_extension(format!("pid.{pid}.stale"));
    let io_err = |source| DaemonError::Io {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        // Someone else cleared it first; try creating again.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(e)),
    }

    let moved = read_pid(&aside);
    if let Some(owner) = moved.filter(|&p| Some(p) != observed && p != pid && is_process_alive(p)) {
        // `hard_link` refuses to overwrite, so a file created in the
        // meantime is never clobbered.
        let _ = std::fs::hard_link(&aside, path);
        let _ = std::fs::remove_file(&aside);
        return Err(DaemonError::AlreadyRunning { pid: owner });
    }
    std::fs::remove_file(&aside).map_err(io_err)
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Asks `pid` to terminate, then force-kills it if it is still alive after
/// `grace`. Returns `true` if a force kill was needed.
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    let sys_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    if let Some(process) = sys.process(sys_pid) {
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!("PID {pid} ignored termination request, killing");
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    if let Some(process) = sys.process(sys_pid) {
        process.kill();
    }
    true
}
