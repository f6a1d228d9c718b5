use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::repos::TrackedRepository;

/// Outcome classification of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    /// Queued or running; the final outcome is not known yet.
    InProgress,
    /// Completed with an outcome we do not announce (skipped, neutral, ...).
    Unknown,
}

#[derive(Debug, Error)]
#[error("unrecognised conclusion {0:?}")]
pub struct ParseConclusionError(String);

impl Conclusion {
    /// Maps the `status` / `conclusion` pair reported by `gh run list`.
    pub fn from_gh(status: &str, conclusion: &str) -> Self {
        if status != "completed" {
            return Conclusion::InProgress;
        }
        match conclusion {
            "success" => Conclusion::Success,
            "failure" | "timed_out" | "startup_failure" => Conclusion::Failure,
            "cancelled" => Conclusion::Cancelled,
            _ => Conclusion::Unknown,
        }
    }

    /// Terminal runs are announced and marked seen; the rest are re-checked
    /// next cycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Conclusion::Success | Conclusion::Failure | Conclusion::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::InProgress => "in_progress",
            Conclusion::Unknown => "unknown",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Conclusion::Success => "✅",
            Conclusion::Failure => "❌",
            _ => "⚠️",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Conclusion {
    type Err = ParseConclusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Conclusion::Success),
            "failure" => Ok(Conclusion::Failure),
            "cancelled" => Ok(Conclusion::Cancelled),
            "in_progress" => Ok(Conclusion::InProgress),
            "unknown" => Ok(Conclusion::Unknown),
            other => Err(ParseConclusionError(other.to_string())),
        }
    }
}

/// One observation of the latest workflow run of a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub repo: TrackedRepository,
    /// Opaque identifier, unique per repository.
    pub run_id: String,
    pub workflow: String,
    pub conclusion: Conclusion,
    /// When the run was last updated upstream.
    pub timestamp: DateTime<Utc>,
}

impl RunStatus {
    pub fn succeeded(&self) -> bool {
        self.conclusion == Conclusion::Success
    }

    /// The sentence handed to the notifier.
    pub fn announcement(&self) -> String {
        let repo = self.repo.name();
        let workflow = &self.workflow;
        match self.conclusion {
            Conclusion::Success => format!("{repo}: {workflow} passed"),
            Conclusion::Failure => format!("Attention! {repo}: {workflow} failed"),
            other => format!("{repo}: {workflow} completed with {other}"),
        }
    }
}
