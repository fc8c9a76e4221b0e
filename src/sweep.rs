//! Auto-close monitor: a periodic sweep that closes windows by title keyword.
//!
//! Once armed, the job ticks on a fixed interval, lists closeable windows,
//! matches titles case-insensitively against the keyword and invokes the
//! close primitive on every match. At most one job runs at a time. Job state
//! and the capped activity log share one mutex; a tick only commits its
//! results if the job it belongs to is still the armed one, so nothing is
//! appended after [`SweepJob::disarm`] returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collab::{CollaboratorError, Collaborators, ScreenProvider, WindowCloser};

/// Maximum number of retained log lines.
pub const LOG_CAPACITY: usize = 100;

/// Default tick period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("auto-close monitor is already running for keyword '{0}'")]
    AlreadyRunning(String),
    #[error("auto-close monitor is not running")]
    NotRunning,
    #[error("keyword must not be empty")]
    EmptyKeyword,
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStatus {
    pub running: bool,
    pub keyword: Option<String>,
    pub force_close: bool,
    pub check_count: u64,
    pub started_at: Option<String>,
    pub interval_secs: u64,
}

struct ArmedJob {
    keyword: String,
    force_close: bool,
    check_count: u64,
    started_at: DateTime<Local>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Shared {
    job: Option<ArmedJob>,
    generation: u64,
    log: VecDeque<String>,
}

impl Shared {
    fn push_log(&mut self, line: impl Into<String>) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log
            .push_back(format!("[{}] {}", Local::now().format("%H:%M:%S"), line.into()));
    }
}

#[derive(Clone)]
pub struct SweepJob {
    shared: Arc<Mutex<Shared>>,
    collaborators: Collaborators,
    interval: Duration,
}

impl SweepJob {
    pub fn new(collaborators: Collaborators, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            collaborators,
            interval,
        }
    }

    /// Arm the job. Rejected while another job is armed.
    pub fn arm(&self, keyword: &str, force_close: bool) -> Result<(), SweepError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(SweepError::EmptyKeyword);
        }
        let screen = self.collaborators.screen()?;
        let closer = self.collaborators.closer()?;

        let mut shared = self.shared.lock();
        if let Some(job) = &shared.job {
            return Err(SweepError::AlreadyRunning(job.keyword.clone()));
        }
        shared.generation += 1;
        let generation = shared.generation;
        let cancel = CancellationToken::new();
        shared.log.clear();
        shared.push_log(format!(
            "started monitoring for '{keyword}' (force close: {force_close})"
        ));
        shared.job = Some(ArmedJob {
            keyword: keyword.to_string(),
            force_close,
            check_count: 0,
            started_at: Local::now(),
            cancel: cancel.clone(),
        });
        drop(shared);

        tracing::info!(%keyword, force_close, interval = ?self.interval, "auto-close monitor armed");
        tokio::spawn(run_ticks(
            self.shared.clone(),
            generation,
            cancel,
            self.interval,
            keyword.to_string(),
            force_close,
            screen,
            closer,
        ));
        Ok(())
    }

    /// Disarm the job and stop its timer.
    pub fn disarm(&self) -> Result<(), SweepError> {
        let mut shared = self.shared.lock();
        let job = shared.job.take().ok_or(SweepError::NotRunning)?;
        job.cancel.cancel();
        shared.generation += 1;
        shared.push_log(format!(
            "stopped monitoring for '{}' after {} check(s)",
            job.keyword, job.check_count
        ));
        tracing::info!(keyword = %job.keyword, checks = job.check_count, "auto-close monitor disarmed");
        Ok(())
    }

    pub fn status(&self) -> SweepStatus {
        let shared = self.shared.lock();
        match &shared.job {
            Some(job) => SweepStatus {
                running: true,
                keyword: Some(job.keyword.clone()),
                force_close: job.force_close,
                check_count: job.check_count,
                started_at: Some(job.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                interval_secs: self.interval.as_secs(),
            },
            None => SweepStatus {
                running: false,
                keyword: None,
                force_close: false,
                check_count: 0,
                started_at: None,
                interval_secs: self.interval.as_secs(),
            },
        }
    }

    pub fn recent_log(&self) -> Vec<String> {
        self.shared.lock().log.iter().cloned().collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_ticks(
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    cancel: CancellationToken,
    interval: Duration,
    keyword: String,
    force_close: bool,
    screen: Arc<dyn ScreenProvider>,
    closer: Arc<dyn WindowCloser>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let lines = {
            let keyword = keyword.clone();
            let screen = screen.clone();
            let closer = closer.clone();
            tokio::task::spawn_blocking(move || {
                sweep_once(&keyword, force_close, screen.as_ref(), closer.as_ref())
            })
            .await
            .unwrap_or_else(|e| vec![format!("sweep failed: {e}")])
        };

        let mut guard = shared.lock();
        if guard.generation != generation {
            break;
        }
        if let Some(job) = guard.job.as_mut() {
            job.check_count += 1;
        }
        for line in lines {
            guard.push_log(line);
        }
    }
    tracing::debug!(%keyword, "auto-close tick loop exited");
}

/// One sweep: list, filter, close. Returns one log line per outcome.
pub fn sweep_once(
    keyword: &str,
    force_close: bool,
    screen: &dyn ScreenProvider,
    closer: &dyn WindowCloser,
) -> Vec<String> {
    let windows = match screen.list_windows() {
        Ok(windows) => windows,
        Err(e) => return vec![format!("failed to list windows: {e}")],
    };
    let needle = keyword.to_lowercase();
    let matches: Vec<_> = windows
        .into_iter()
        .filter(|w| w.is_closeable() && w.title.to_lowercase().contains(&needle))
        .collect();

    if matches.is_empty() {
        return vec![format!("no window matching '{keyword}'")];
    }

    matches
        .iter()
        .map(|w| match closer.close_window(w.handle, force_close) {
            Ok(outcome) if outcome.ok => {
                tracing::info!(title = %w.title, method = %outcome.method, "auto-closed window");
                format!("closed '{}' ({}) via {}", w.title, w.process_name, outcome.method)
            }
            Ok(outcome) => format!(
                "could not close '{}' ({}) via {}",
                w.title, w.process_name, outcome.method
            ),
            Err(e) => {
                tracing::warn!(title = %w.title, error = %e, "auto-close failed");
                format!("error closing '{}': {e}", w.title)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CloseOutcome, Screenshot, WindowInfo};

    struct FakeDesktop {
        windows: Vec<WindowInfo>,
        closed: Mutex<Vec<(u64, bool)>>,
    }

    impl FakeDesktop {
        fn new(windows: Vec<WindowInfo>) -> Arc<Self> {
            Arc::new(Self {
                windows,
                closed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ScreenProvider for FakeDesktop {
        fn capture_screen(&self) -> Result<Screenshot, CollaboratorError> {
            Err(CollaboratorError::Failed("unused".into()))
        }
        fn capture_window(&self, _handle: u64) -> Result<Screenshot, CollaboratorError> {
            Err(CollaboratorError::Failed("unused".into()))
        }
        fn list_windows(&self) -> Result<Vec<WindowInfo>, CollaboratorError> {
            Ok(self.windows.clone())
        }
    }

    impl WindowCloser for FakeDesktop {
        fn close_window(&self, handle: u64, force: bool) -> Result<CloseOutcome, CollaboratorError> {
            self.closed.lock().push((handle, force));
            Ok(CloseOutcome {
                ok: true,
                title: String::new(),
                process_name: String::new(),
                method: if force { "terminate".into() } else { "close message".into() },
            })
        }
    }

    fn window(handle: u64, title: &str) -> WindowInfo {
        WindowInfo {
            handle,
            title: title.into(),
            process_name: "app".into(),
            process_id: Some(1),
            system_critical: false,
        }
    }

    fn desktop() -> Arc<FakeDesktop> {
        let mut critical = window(3, "Game Bar");
        critical.system_critical = true;
        let mut own = window(4, "my game console");
        own.process_id = Some(std::process::id());
        FakeDesktop::new(vec![
            window(1, "Fun GAME window"),
            window(2, "game launcher"),
            critical,
            own,
            window(5, "Text Editor"),
        ])
    }

    fn job_for(desk: &Arc<FakeDesktop>, interval: Duration) -> SweepJob {
        let collabs = Collaborators {
            screen: Some(desk.clone()),
            closer: Some(desk.clone()),
            ..Default::default()
        };
        SweepJob::new(collabs, interval)
    }

    #[test]
    fn sweep_matches_case_insensitively_and_skips_protected() {
        let desk = desktop();
        let lines = sweep_once("game", true, desk.as_ref(), desk.as_ref());
        assert_eq!(lines.len(), 2);
        let closed = desk.closed.lock().clone();
        assert_eq!(closed, vec![(1, true), (2, true)]);
    }

    #[test]
    fn sweep_without_match_logs_once_and_closes_nothing() {
        let desk = desktop();
        let lines = sweep_once("browser", false, desk.as_ref(), desk.as_ref());
        assert_eq!(lines, vec!["no window matching 'browser'".to_string()]);
        assert!(desk.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn arming_twice_is_rejected() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_secs(60));
        job.arm("game", false).unwrap();
        assert!(matches!(
            job.arm("other", false),
            Err(SweepError::AlreadyRunning(k)) if k == "game"
        ));
        assert_eq!(job.status().keyword.as_deref(), Some("game"));
        job.disarm().unwrap();
    }

    #[tokio::test]
    async fn disarm_when_idle_fails() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_secs(60));
        assert!(matches!(job.disarm(), Err(SweepError::NotRunning)));
    }

    #[tokio::test]
    async fn empty_keyword_rejected() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_secs(60));
        assert!(matches!(job.arm("   ", false), Err(SweepError::EmptyKeyword)));
        assert!(!job.status().running);
    }

    #[tokio::test]
    async fn arm_without_window_collaborators_is_unavailable() {
        let job = SweepJob::new(Collaborators::default(), Duration::from_secs(60));
        assert!(matches!(
            job.arm("x", false),
            Err(SweepError::Collaborator(CollaboratorError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn ticks_close_each_match_once_per_tick() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_millis(30));
        job.arm("GAME", false).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        job.disarm().unwrap();

        let closed_lines = job
            .recent_log()
            .iter()
            .filter(|l| l.contains("closed '"))
            .count();
        assert!(closed_lines >= 4, "expected at least two ticks");

        let closed = desk.closed.lock().clone();
        assert!(closed.iter().all(|(h, force)| (*h == 1 || *h == 2) && !force));
        let ones = closed.iter().filter(|(h, _)| *h == 1).count();
        let twos = closed.iter().filter(|(h, _)| *h == 2).count();
        assert!(ones.abs_diff(twos) <= 1);
    }

    #[tokio::test]
    async fn no_log_growth_after_disarm() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_millis(20));
        job.arm("game", false).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        job.disarm().unwrap();

        let frozen = job.recent_log().len();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(job.recent_log().len(), frozen);
        assert!(!job.status().running);
    }

    #[test]
    fn log_is_capped() {
        let mut shared = Shared::default();
        for i in 0..(LOG_CAPACITY + 25) {
            shared.push_log(format!("line {i}"));
        }
        assert_eq!(shared.log.len(), LOG_CAPACITY);
        assert!(shared.log.front().unwrap().ends_with("line 25"));
    }

    #[tokio::test]
    async fn status_reports_armed_job() {
        let desk = desktop();
        let job = job_for(&desk, Duration::from_secs(30));
        assert!(!job.status().running);
        job.arm("game", true).unwrap();
        let status = job.status();
        assert!(status.running);
        assert!(status.force_close);
        assert_eq!(status.interval_secs, 30);
        assert!(status.started_at.is_some());
        job.disarm().unwrap();
    }
}
