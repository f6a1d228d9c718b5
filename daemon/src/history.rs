//! Append-only, human-readable record of every new terminal run, written
//! whether or not an announcement was spoken.
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::run::RunStatus;

pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn append(&self, run: &RunStatus) -> std::io::Result<()> {
        let line = format_line(run, Local::now());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// `YYYY-MM-DD HH:MM:SS | repo                 | workflow        | ✅ success`
fn format_line(run: &RunStatus, at: DateTime<Local>) -> String {
    format!(
        "{} | {:20} | {:15} | {} {}\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        run.repo.name(),
        run.workflow,
        run.conclusion.icon(),
        run.conclusion,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::TrackedRepository;
    use crate::run::Conclusion;
    use chrono::{TimeZone, Utc};

    fn run(conclusion: Conclusion) -> RunStatus {
        RunStatus {
            repo: TrackedRepository::parse("owner/repo").unwrap(),
            run_id: "1".to_string(),
            workflow: "Tests".to_string(),
            conclusion,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn line_layout() {
        let at = Local.with_ymd_and_hms(2026, 10, 18, 9, 5, 0).unwrap();
        let line = format_line(&run(Conclusion::Success), at);
        assert_eq!(
            line,
            "2026-10-18 09:05:00 | repo                 | Tests           | ✅ success\n"
        );
    }

    #[test]
    fn failure_uses_cross_icon() {
        let line = format_line(&run(Conclusion::Failure), Local::now());
        assert!(line.ends_with("| ❌ failure\n"));
    }

    #[test]
    fn append_creates_and_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::new(&dir.path().join("history.log"));
        log.append(&run(Conclusion::Success)).unwrap();
        log.append(&run(Conclusion::Failure)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("history.log")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("repo"));
        assert!(lines[0].contains("Tests"));
        assert!(lines[0].contains("success"));
        assert!(lines[1].contains("failure"));
    }
}
