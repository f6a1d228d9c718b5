//! Tracked repository list, persisted as `repos.txt` (one `owner/repo` per line).
//!
//! The poll loop re-reads the file every cycle, so `add` and `remove` take
//! effect on a running daemon without a restart.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoListError {
    #[error("invalid repository {0:?}: expected owner/repo")]
    InvalidFormat(String),

    #[error("repository '{0}' is not in the watch list")]
    NotFound(String),

    #[error("failed to access repository list {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A validated `owner/repo` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedRepository(String);

impl TrackedRepository {
    pub fn parse(raw: &str) -> Result<Self, RepoListError> {
        let raw = raw.trim();
        let valid = match raw.split_once('/') {
            Some((owner, name)) => {
                !owner.is_empty()
                    && !name.is_empty()
                    && !name.contains('/')
                    && !raw.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(RepoListError::InvalidFormat(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The repository name without its owner, used in spoken messages.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for TrackedRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File-backed, insertion-ordered set of tracked repositories.
pub struct RepoList {
    path: PathBuf,
}

impl RepoList {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Returns the tracked repositories in insertion order. A missing file is
    /// an empty list; blank lines, `#` comments and malformed lines are skipped.
    pub fn list(&self) -> Result<Vec<TrackedRepository>, RepoListError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_err(source)),
        };

        let mut repos: Vec<TrackedRepository> = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match TrackedRepository::parse(line) {
                Ok(repo) if !repos.contains(&repo) => repos.push(repo),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping line in {}: {e}", self.path.display()),
            }
        }
        Ok(repos)
    }

    /// Appends `repo`. Returns `false` (and changes nothing) if it is already tracked.
    pub fn add(&self, repo: &TrackedRepository) -> Result<bool, RepoListError> {
        let mut repos = self.list()?;
        if repos.contains(repo) {
            return Ok(false);
        }
        repos.push(repo.clone());
        self.write_all(&repos)?;
        Ok(true)
    }

    pub fn remove(&self, repo: &TrackedRepository) -> Result<(), RepoListError> {
        let mut repos = self.list()?;
        let before = repos.len();
        repos.retain(|r| r != repo);
        if repos.len() == before {
            return Err(RepoListError::NotFound(repo.to_string()));
        }
        self.write_all(&repos)
    }

    /// Rewrites the whole file via temp file + rename, so the daemon never
    /// reads a truncated list.
    fn write_all(&self, repos: &[TrackedRepository]) -> Result<(), RepoListError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let content: String = repos.iter().map(|r| format!("{r}\n")).collect();
        let tmp = self.path.with_extension("txt.tmp");
        std::fs::write(&tmp, content).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: std::io::Error) -> RepoListError {
        RepoListError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
