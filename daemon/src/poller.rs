//! One poll cycle: query every tracked repository, announce runs that are
//! new and terminal, and record them so they are never announced again.
//!
//! Ordering per new terminal run is notify → `mark_seen` → history line.
//! If the process dies between the announcement and the commit, the run is
//! announced once more after restart; it is never silently dropped.
//!
//! A shutdown request abandons a status query that is still in flight, since
//! nothing has been committed for it yet. An announcement that has already
//! started is always carried through to its commit.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::history::HistoryLog;
use crate::notifier::Notifier;
use crate::repos::TrackedRepository;
use crate::run::{Conclusion, RunStatus};
use crate::source::StatusSource;
use crate::store::{RunStore, StoreError};

/// Collaborators of a poll cycle. The daemon and `ci-monitor check` build
/// one from real implementations; tests inject fakes.
pub struct PollContext<'a> {
    pub source: &'a dyn StatusSource,
    /// `None` when speech is disabled or unavailable: announcements are logged only.
    pub notifier: Option<&'a dyn Notifier>,
    pub store: &'a RunStore,
    pub history: &'a HistoryLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOutcome {
    /// The status query failed; retried next cycle.
    QueryFailed,
    /// Shutdown was requested while the status query was in flight.
    Abandoned,
    AlreadySeen,
    /// Not terminal yet (`in_progress` / `unknown`); re-checked next cycle.
    Pending,
    /// New terminal run, now recorded. `announced` is false when the notify
    /// flags suppressed it or no notifier was available.
    Recorded { announced: bool },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub failed: usize,
    pub already_seen: usize,
    pub pending: usize,
    pub recorded: usize,
    pub announced: usize,
    /// Shutdown was requested before every repository was checked.
    pub interrupted: bool,
}

impl CycleReport {
    fn add(&mut self, outcome: RepoOutcome) {
        self.checked += 1;
        match outcome {
            RepoOutcome::QueryFailed => self.failed += 1,
            RepoOutcome::Abandoned => {}
            RepoOutcome::AlreadySeen => self.already_seen += 1,
            RepoOutcome::Pending => self.pending += 1,
            RepoOutcome::Recorded { announced } => {
                self.recorded += 1;
                if announced {
                    self.announced += 1;
                }
            }
        }
    }
}

/// Whether the notify flags allow announcing `conclusion`.
pub fn should_announce(conclusion: Conclusion, config: &Config) -> bool {
    match conclusion {
        Conclusion::Success => config.notify_success,
        Conclusion::Failure => config.notify_failure,
        Conclusion::Cancelled => true,
        Conclusion::InProgress | Conclusion::Unknown => false,
    }
}

/// Runs one cycle over `repos`, in order. Per-repository failures are logged
/// and skipped; only a Run Store failure aborts the cycle, since continuing
/// would lose the dedup guarantee.
///
/// `shutdown` is checked between repositories and abandons a status query
/// still in flight. It never interrupts an announcement before its commit.
pub async fn poll_cycle(
    ctx: &PollContext<'_>,
    config: &Config,
    repos: &[TrackedRepository],
    shutdown: &watch::Receiver<bool>,
) -> Result<CycleReport, StoreError> {
    let mut report = CycleReport::default();
    for repo in repos {
        if *shutdown.borrow() {
            report.interrupted = true;
            break;
        }
        let outcome = check_repository(ctx, config, repo, shutdown).await?;
        if outcome == RepoOutcome::Abandoned {
            report.interrupted = true;
            break;
        }
        report.add(outcome);
    }
    debug!(?report, "Poll cycle finished");
    Ok(report)
}

pub async fn check_repository(
    ctx: &PollContext<'_>,
    config: &Config,
    repo: &TrackedRepository,
    shutdown: &watch::Receiver<bool>,
) -> Result<RepoOutcome, StoreError> {
    let queried = tokio::select! {
        res = ctx.source.latest_run(repo) => res,
        _ = shutdown_requested(shutdown) => {
            debug!("{repo}: status query abandoned for shutdown");
            return Ok(RepoOutcome::Abandoned);
        }
    };
    let run = match queried {
        Ok(run) => run,
        Err(e) => {
            warn!("Skipping {repo} this cycle: {e}");
            return Ok(RepoOutcome::QueryFailed);
        }
    };

    if !ctx.store.is_new(repo, &run.run_id)? {
        return Ok(RepoOutcome::AlreadySeen);
    }

    if !run.conclusion.is_terminal() {
        debug!(
            "{repo}: run {} is {}, checking again next cycle",
            run.run_id, run.conclusion
        );
        return Ok(RepoOutcome::Pending);
    }

    let announced = announce(ctx, config, &run).await;
    ctx.store.mark_seen(&run)?;

    if let Err(e) = ctx.history.append(&run) {
        warn!("Failed to append history for {repo}: {e}");
    }
    info!(
        "{} {repo} - {}: {} (run {})",
        run.conclusion.icon(),
        run.workflow,
        run.conclusion,
        run.run_id
    );

    Ok(RepoOutcome::Recorded { announced })
}

/// Resolves once shutdown has been requested. Never resolves if the sender
/// is gone, so a dropped controller does not read as a stop request.
async fn shutdown_requested(shutdown: &watch::Receiver<bool>) {
    let mut rx = shutdown.clone();
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Returns `true` if the notifier was invoked and reported success. A
/// failing notifier is logged but does not stop the run from being recorded,
/// so a broken speech setup cannot cause repeated announcements.
async fn announce(ctx: &PollContext<'_>, config: &Config, run: &RunStatus) -> bool {
    if !should_announce(run.conclusion, config) {
        debug!(
            "{}: {} suppressed by notify_{} = false",
            run.repo, run.conclusion, run.conclusion
        );
        return false;
    }

    let message = run.announcement();
    let notifier = match ctx.notifier {
        Some(n) if config.speech_enabled => n,
        _ => {
            info!("Announcement (speech off): {message}");
            return false;
        }
    };

    match notifier.announce(&message, run.succeeded()).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to announce {message:?} via {}: {e}", notifier.describe());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifierError;
    use crate::source::AdapterError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    // ── fakes ─────────────────────────────────────────────────────────────────

    /// Serves a fixed answer per repository; repositories without an entry fail.
    #[derive(Default)]
    struct FakeSource {
        runs: Mutex<HashMap<String, (String, Conclusion)>>,
    }

    impl FakeSource {
        fn set(&self, repo: &str, run_id: &str, conclusion: Conclusion) {
            self.runs
                .lock()
                .unwrap()
                .insert(repo.to_string(), (run_id.to_string(), conclusion));
        }
    }

    #[async_trait]
    impl StatusSource for FakeSource {
        async fn latest_run(&self, repo: &TrackedRepository) -> Result<RunStatus, AdapterError> {
            let runs = self.runs.lock().unwrap();
            match runs.get(repo.as_str()) {
                Some((run_id, conclusion)) => Ok(RunStatus {
                    repo: repo.clone(),
                    run_id: run_id.clone(),
                    workflow: "CI".to_string(),
                    conclusion: *conclusion,
                    timestamp: Utc::now(),
                }),
                None => Err(AdapterError::Network {
                    repo: repo.to_string(),
                    detail: "connection refused".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, bool)>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn announce(&self, message: &str, succeeded: bool) -> Result<(), NotifierError> {
            self.calls
                .lock()
                .unwrap()
                .push((message.to_string(), succeeded));
            if self.fail {
                return Err(NotifierError::Failed("speaker unplugged".to_string()));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    /// Records the call, then never returns: the process "dies" mid-announcement.
    #[derive(Default)]
    struct HangingNotifier {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Notifier for HangingNotifier {
        async fn announce(&self, _message: &str, _succeeded: bool) -> Result<(), NotifierError> {
            *self.calls.lock().unwrap() += 1;
            std::future::pending::<()>().await;
            Ok(())
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    /// Answers only after `delay`; `None` never answers.
    struct SlowSource {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl StatusSource for SlowSource {
        async fn latest_run(&self, repo: &TrackedRepository) -> Result<RunStatus, AdapterError> {
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
            Ok(RunStatus {
                repo: repo.clone(),
                run_id: "1".to_string(),
                workflow: "CI".to_string(),
                conclusion: Conclusion::Failure,
                timestamp: Utc::now(),
            })
        }
    }

    /// Takes `delay` to speak, like a real TTS engine reading a sentence.
    struct SlowNotifier {
        delay: Duration,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn announce(&self, _message: &str, _succeeded: bool) -> Result<(), NotifierError> {
            *self.calls.lock().unwrap() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        fn describe(&self) -> String {
            "slow".to_string()
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        store: RunStore,
        history: HistoryLog,
        source: FakeSource,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = RunStore::open(&dir.path().join("state.db")).unwrap();
            let history = HistoryLog::new(&dir.path().join("history.log"));
            Self {
                dir,
                store,
                history,
                source: FakeSource::default(),
            }
        }

        /// Simulates a process restart: same files, fresh store handle.
        fn restart(&mut self) {
            self.store = RunStore::open(&self.dir.path().join("state.db")).unwrap();
        }

        fn ctx<'a>(&'a self, notifier: &'a dyn Notifier) -> PollContext<'a> {
            PollContext {
                source: &self.source,
                notifier: Some(notifier),
                store: &self.store,
                history: &self.history,
            }
        }

        fn history_lines(&self) -> usize {
            std::fs::read_to_string(self.dir.path().join("history.log"))
                .map(|c| c.lines().count())
                .unwrap_or(0)
        }
    }

    fn repos(names: &[&str]) -> Vec<TrackedRepository> {
        names
            .iter()
            .map(|n| TrackedRepository::parse(n).unwrap())
            .collect()
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    // ── dedup ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn new_success_is_announced_recorded_and_then_deduplicated() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let config = Config::default();
        let tracked = repos(&["acme/widgets"]);
        h.source.set("acme/widgets", "123", Conclusion::Success);

        let first = poll_cycle(&h.ctx(&notifier), &config, &tracked, &rx).await.unwrap();
        assert_eq!(first.announced, 1);
        assert_eq!(notifier.calls(), vec![("widgets: CI passed".to_string(), true)]);
        assert_eq!(h.history_lines(), 1);
        assert!(!h.store.is_new(&tracked[0], "123").unwrap());

        let second = poll_cycle(&h.ctx(&notifier), &config, &tracked, &rx).await.unwrap();
        assert_eq!(second.already_seen, 1);
        assert_eq!(second.announced, 0);
        assert_eq!(notifier.calls().len(), 1);
        assert_eq!(h.history_lines(), 1);
    }

    #[tokio::test]
    async fn failure_is_announced_with_succeeded_false() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        h.source.set("acme/widgets", "9", Conclusion::Failure);

        poll_cycle(&h.ctx(&notifier), &Config::default(), &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();
        assert_eq!(
            notifier.calls(),
            vec![("Attention! widgets: CI failed".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn dedup_survives_restart() {
        let mut h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let tracked = repos(&["acme/widgets"]);
        h.source.set("acme/widgets", "123", Conclusion::Success);

        poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx).await.unwrap();
        h.restart();
        poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx).await.unwrap();

        assert_eq!(notifier.calls().len(), 1);
    }

    // ── crash window ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn crash_between_announce_and_commit_repeats_exactly_once() {
        let mut h = Harness::new();
        let (_tx, rx) = no_shutdown();
        let config = Config::default();
        let tracked = repos(&["acme/widgets"]);
        h.source.set("acme/widgets", "123", Conclusion::Failure);

        // The announcement starts, then the process is killed before mark_seen.
        let hanging = HangingNotifier::default();
        let crashed = tokio::time::timeout(
            Duration::from_millis(100),
            poll_cycle(&h.ctx(&hanging), &config, &tracked, &rx),
        )
        .await;
        assert!(crashed.is_err());
        assert_eq!(*hanging.calls.lock().unwrap(), 1);
        assert!(h.store.is_new(&tracked[0], "123").unwrap());

        h.restart();
        let notifier = RecordingNotifier::default();
        for _ in 0..3 {
            poll_cycle(&h.ctx(&notifier), &config, &tracked, &rx).await.unwrap();
        }

        // One duplicate after the crash, never more.
        assert_eq!(notifier.calls().len(), 1);
        assert!(!h.store.is_new(&tracked[0], "123").unwrap());
    }

    // ── isolation ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failing_repository_does_not_block_the_next() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        // acme/broken has no entry in the fake source, so its query fails.
        h.source.set("acme/widgets", "5", Conclusion::Success);

        let report = poll_cycle(
            &h.ctx(&notifier),
            &Config::default(),
            &repos(&["acme/broken", "acme/widgets"]),
            &rx,
        )
        .await
        .unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.announced, 1);
        assert_eq!(notifier.calls().len(), 1);
    }

    // ── gating ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn notify_success_false_records_without_announcing() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let config = Config {
            notify_success: false,
            ..Config::default()
        };
        let tracked = repos(&["acme/widgets"]);
        h.source.set("acme/widgets", "1", Conclusion::Success);

        let report = poll_cycle(&h.ctx(&notifier), &config, &tracked, &rx).await.unwrap();

        assert!(notifier.calls().is_empty());
        assert_eq!(report.recorded, 1);
        assert_eq!(h.history_lines(), 1);
        assert!(!h.store.is_new(&tracked[0], "1").unwrap());
    }

    #[tokio::test]
    async fn notify_failure_false_records_without_announcing() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let config = Config {
            notify_failure: false,
            ..Config::default()
        };
        h.source.set("acme/widgets", "1", Conclusion::Failure);

        poll_cycle(&h.ctx(&notifier), &config, &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();

        assert!(notifier.calls().is_empty());
        assert_eq!(h.history_lines(), 1);
    }

    #[tokio::test]
    async fn speech_disabled_never_invokes_notifier() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let config = Config {
            speech_enabled: false,
            ..Config::default()
        };
        h.source.set("acme/widgets", "1", Conclusion::Failure);

        let report = poll_cycle(&h.ctx(&notifier), &config, &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();

        assert!(notifier.calls().is_empty());
        assert_eq!(report.recorded, 1);
    }

    #[tokio::test]
    async fn missing_notifier_still_records() {
        let h = Harness::new();
        let (_tx, rx) = no_shutdown();
        h.source.set("acme/widgets", "1", Conclusion::Cancelled);
        let ctx = PollContext {
            source: &h.source,
            notifier: None,
            store: &h.store,
            history: &h.history,
        };

        let report = poll_cycle(&ctx, &Config::default(), &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();

        assert_eq!(report.recorded, 1);
        assert_eq!(report.announced, 0);
    }

    #[tokio::test]
    async fn broken_notifier_still_marks_seen() {
        let h = Harness::new();
        let notifier = RecordingNotifier::failing();
        let (_tx, rx) = no_shutdown();
        let tracked = repos(&["acme/widgets"]);
        h.source.set("acme/widgets", "1", Conclusion::Failure);

        for _ in 0..2 {
            poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx)
                .await
                .unwrap();
        }

        assert_eq!(notifier.calls().len(), 1);
        assert_eq!(h.history_lines(), 1);
        assert!(!h.store.is_new(&tracked[0], "1").unwrap());
    }

    #[test]
    fn cancelled_is_always_announced() {
        let config = Config {
            notify_success: false,
            notify_failure: false,
            ..Config::default()
        };
        assert!(should_announce(Conclusion::Cancelled, &config));
        assert!(!should_announce(Conclusion::Success, &config));
        assert!(!should_announce(Conclusion::Failure, &config));
    }

    // ── in-progress suppression ───────────────────────────────────────────────

    #[tokio::test]
    async fn in_progress_run_is_rechecked_until_it_finishes() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        let tracked = repos(&["acme/widgets"]);

        h.source.set("acme/widgets", "77", Conclusion::InProgress);
        for _ in 0..2 {
            let report = poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx)
                .await
                .unwrap();
            assert_eq!(report.pending, 1);
        }
        assert!(h.store.is_new(&tracked[0], "77").unwrap());
        assert_eq!(h.history_lines(), 0);

        h.source.set("acme/widgets", "77", Conclusion::Success);
        let report = poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx)
            .await
            .unwrap();
        assert_eq!(report.announced, 1);
        assert!(!h.store.is_new(&tracked[0], "77").unwrap());
    }

    #[tokio::test]
    async fn unknown_conclusion_is_not_recorded() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (_tx, rx) = no_shutdown();
        h.source.set("acme/widgets", "3", Conclusion::Unknown);

        let report = poll_cycle(&h.ctx(&notifier), &Config::default(), &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();

        assert_eq!(report.pending, 1);
        assert!(notifier.calls().is_empty());
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_during_announcement_still_commits() {
        let h = Harness::new();
        let notifier = SlowNotifier {
            delay: Duration::from_millis(300),
            calls: Mutex::new(0),
        };
        let (tx, rx) = watch::channel(false);
        let tracked = repos(&["acme/widgets", "acme/gadgets"]);
        h.source.set("acme/widgets", "123", Conclusion::Failure);
        h.source.set("acme/gadgets", "9", Conclusion::Failure);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });
        let report = poll_cycle(&h.ctx(&notifier), &Config::default(), &tracked, &rx)
            .await
            .unwrap();
        let _tx = stopper.await.unwrap();

        // The announcement in flight finished and was committed; the next
        // repository was not started.
        assert_eq!(*notifier.calls.lock().unwrap(), 1);
        assert!(!h.store.is_new(&tracked[0], "123").unwrap());
        assert_eq!(h.history_lines(), 1);
        assert!(report.interrupted);
        assert!(h.store.is_new(&tracked[1], "9").unwrap());
    }

    #[tokio::test]
    async fn shutdown_abandons_a_hung_status_query() {
        let h = Harness::new();
        let source = SlowSource { delay: None };
        let notifier = RecordingNotifier::default();
        let ctx = PollContext {
            source: &source,
            notifier: Some(&notifier),
            store: &h.store,
            history: &h.history,
        };
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            poll_cycle(&ctx, &Config::default(), &repos(&["acme/widgets"]), &rx),
        )
        .await
        .expect("cycle must return promptly after shutdown")
        .unwrap();
        let _tx = stopper.await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.checked, 0);
        assert!(notifier.calls().is_empty());
        assert_eq!(h.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_query_completes_without_shutdown() {
        let h = Harness::new();
        let source = SlowSource {
            delay: Some(Duration::from_millis(20)),
        };
        let notifier = RecordingNotifier::default();
        let ctx = PollContext {
            source: &source,
            notifier: Some(&notifier),
            store: &h.store,
            history: &h.history,
        };
        let (_tx, rx) = no_shutdown();

        let report = poll_cycle(&ctx, &Config::default(), &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();
        assert_eq!(report.announced, 1);
    }


    #[tokio::test]
    async fn shutdown_request_stops_before_next_repository() {
        let h = Harness::new();
        let notifier = RecordingNotifier::default();
        let (tx, rx) = watch::channel(false);
        h.source.set("acme/widgets", "1", Conclusion::Success);
        tx.send(true).unwrap();

        let report = poll_cycle(&h.ctx(&notifier), &Config::default(), &repos(&["acme/widgets"]), &rx)
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.checked, 0);
        assert!(notifier.calls().is_empty());
    }
}
