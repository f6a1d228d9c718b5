//! Status source: where the latest workflow run of a repository comes from.
//!
//! The production implementation shells out to the GitHub CLI (`gh run list`),
//! which reuses the user's existing `gh auth login` session instead of
//! handling tokens here. Every call is bounded by a timeout and the child is
//! killed if it overruns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::repos::TrackedRepository;
use crate::run::{Conclusion, RunStatus};

/// Every variant is transient from the poll loop's point of view: the
/// repository is skipped this cycle and retried on the next.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("GitHub authentication failed for {repo}: {detail}")]
    Auth { repo: String, detail: String },

    #[error("network error querying {repo}: {detail}")]
    Network { repo: String, detail: String },

    #[error("{repo} not found or has no workflow runs: {detail}")]
    NotFound { repo: String, detail: String },

    #[error("unexpected response for {repo}: {detail}")]
    InvalidResponse { repo: String, detail: String },
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn latest_run(&self, repo: &TrackedRepository) -> Result<RunStatus, AdapterError>;
}

/// Row of `gh run list --json databaseId,status,conclusion,name,updatedAt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRun {
    database_id: u64,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    name: Option<String>,
    updated_at: DateTime<Utc>,
}

pub struct GhCli {
    gh_bin: String,
    timeout: Duration,
}

impl GhCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            gh_bin: "gh".to_owned(),
            timeout,
        }
    }

    /// `true` if the `gh` binary can be found on `PATH`.
    pub fn is_installed() -> bool {
        which::which("gh").is_ok()
    }
}

#[async_trait]
impl StatusSource for GhCli {
    async fn latest_run(&self, repo: &TrackedRepository) -> Result<RunStatus, AdapterError> {
        let mut cmd = tokio::process::Command::new(&self.gh_bin);
        cmd.args([
            "run", "list",
            "--repo", repo.as_str(),
            "--limit", "1",
            "--json", "databaseId,status,conclusion,name,updatedAt",
        ])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AdapterError::Network {
                    repo: repo.to_string(),
                    detail: format!("failed to run {}: {e}", self.gh_bin),
                })
            }
            Err(_) => {
                return Err(AdapterError::Network {
                    repo: repo.to_string(),
                    detail: format!("gh run list timed out after {}s", self.timeout.as_secs()),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(repo, stderr.trim()));
        }

        parse_latest_run(repo, &output.stdout)
    }
}

/// Sorts a failed `gh` invocation into the adapter error taxonomy based on
/// its stderr.
fn classify_failure(repo: &TrackedRepository, stderr: &str) -> AdapterError {
    let lower = stderr.to_lowercase();
    let repo = repo.to_string();
    let detail = stderr.to_string();
    if lower.contains("gh auth login")
        || lower.contains("authentication")
        || lower.contains("http 401")
        || lower.contains("bad credentials")
    {
        AdapterError::Auth { repo, detail }
    } else if lower.contains("could not resolve to a repository")
        || lower.contains("http 404")
        || lower.contains("not found")
    {
        AdapterError::NotFound { repo, detail }
    } else {
        AdapterError::Network { repo, detail }
    }
}

fn parse_latest_run(repo: &TrackedRepository, stdout: &[u8]) -> Result<RunStatus, AdapterError> {
    let runs: Vec<GhRun> =
        serde_json::from_slice(stdout).map_err(|e| AdapterError::InvalidResponse {
            repo: repo.to_string(),
            detail: e.to_string(),
        })?;

    let Some(run) = runs.into_iter().next() else {
        return Err(AdapterError::NotFound {
            repo: repo.to_string(),
            detail: "no workflow runs".to_string(),
        });
    };

    Ok(RunStatus {
        repo: repo.clone(),
        run_id: run.database_id.to_string(),
        workflow: run
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Workflow".to_string()),
        conclusion: Conclusion::from_gh(&run.status, run.conclusion.as_deref().unwrap_or("")),
        timestamp: run.updated_at,
    })
}
