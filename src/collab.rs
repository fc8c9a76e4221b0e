//! Narrow interfaces to the collaborators the control server drives.
//!
//! The server never renders notifications, reads timetables, captures the
//! screen or kills processes itself. Each of those lives behind one of the
//! traits below so an embedding application can plug in its own
//! implementation. All trait methods are synchronous; handlers call them on
//! the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Errors surfaced by a collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator is not installed in this process.
    #[error("{0} is not available")]
    Unavailable(&'static str),
    /// The collaborator ran and reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// Visual and audio effects requested alongside a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEffects {
    pub sound: bool,
    pub emphasis: bool,
    pub topmost: bool,
}

impl Default for NotificationEffects {
    fn default() -> Self {
        Self {
            sound: true,
            emphasis: false,
            topmost: true,
        }
    }
}

/// A single on-screen notification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub duration: Duration,
    pub speech: bool,
    pub effects: NotificationEffects,
}

/// Presentation layer that renders notifications.
pub trait Notifier: Send + Sync {
    fn show_notification(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// One period of the timetable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub subject: String,
}

impl ClassPeriod {
    pub fn contains(&self, at: NaiveTime) -> bool {
        self.start <= at && at < self.end
    }
}

/// Schedule data provider.
pub trait ScheduleProvider: Send + Sync {
    /// Today's periods in order.
    fn current_plan(&self) -> Result<Vec<ClassPeriod>, CollaboratorError>;
    /// The next period that has not started yet, if any.
    fn upcoming_period(&self) -> Result<Option<ClassPeriod>, CollaboratorError>;
    /// Time of day used to mark the current period.
    fn now(&self) -> NaiveTime {
        local_time()
    }
}

/// A top-level window as reported by the window collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub handle: u64,
    pub title: String,
    pub process_name: String,
    #[serde(skip)]
    pub process_id: Option<u32>,
    /// Shell, compositor and other windows that must never be closed.
    #[serde(skip)]
    pub system_critical: bool,
}

impl WindowInfo {
    pub fn is_current_process(&self) -> bool {
        self.process_id == Some(std::process::id())
    }

    pub fn is_closeable(&self) -> bool {
        !self.system_critical && !self.is_current_process()
    }
}

/// Encoded image returned by a capture call.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub extension: &'static str,
}

impl Screenshot {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "image/png",
            extension: "png",
        }
    }
}

/// Screenshot and window-enumeration provider.
pub trait ScreenProvider: Send + Sync {
    fn capture_screen(&self) -> Result<Screenshot, CollaboratorError>;
    fn capture_window(&self, handle: u64) -> Result<Screenshot, CollaboratorError>;
    fn list_windows(&self) -> Result<Vec<WindowInfo>, CollaboratorError>;
}

/// Result of the process-termination primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub ok: bool,
    pub title: String,
    pub process_name: String,
    pub method: String,
}

/// Process-termination primitive.
pub trait WindowCloser: Send + Sync {
    fn close_window(&self, handle: u64, force: bool) -> Result<CloseOutcome, CollaboratorError>;
}

/// The set of collaborators available to the server. Any of them may be
/// missing; routes that need a missing one answer 503.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub notifier: Option<Arc<dyn Notifier>>,
    pub schedule: Option<Arc<dyn ScheduleProvider>>,
    pub screen: Option<Arc<dyn ScreenProvider>>,
    pub closer: Option<Arc<dyn WindowCloser>>,
}

impl Collaborators {
    pub fn notifier(&self) -> Result<Arc<dyn Notifier>, CollaboratorError> {
        self.notifier
            .clone()
            .ok_or(CollaboratorError::Unavailable("notification service"))
    }

    pub fn schedule(&self) -> Result<Arc<dyn ScheduleProvider>, CollaboratorError> {
        self.schedule
            .clone()
            .ok_or(CollaboratorError::Unavailable("schedule provider"))
    }

    pub fn screen(&self) -> Result<Arc<dyn ScreenProvider>, CollaboratorError> {
        self.screen
            .clone()
            .ok_or(CollaboratorError::Unavailable("screen capture provider"))
    }

    pub fn closer(&self) -> Result<Arc<dyn WindowCloser>, CollaboratorError> {
        self.closer
            .clone()
            .ok_or(CollaboratorError::Unavailable("window control service"))
    }
}

// ── Built-in implementations ───────────────────────────────────────

/// Notifier that only records the request in the log. Used when the binary
/// runs without a presentation layer attached.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_notification(&self, n: &Notification) -> Result<(), CollaboratorError> {
        tracing::info!(
            message = %n.message,
            duration_secs = n.duration.as_secs(),
            speech = n.speech,
            sound = n.effects.sound,
            emphasis = n.effects.emphasis,
            topmost = n.effects.topmost,
            "notification requested"
        );
        Ok(())
    }
}

/// Fixed daily timetable, usually loaded from the config file.
pub struct StaticSchedule {
    periods: Vec<ClassPeriod>,
    clock: fn() -> NaiveTime,
}

fn local_time() -> NaiveTime {
    chrono::Local::now().time()
}

impl StaticSchedule {
    pub fn new(mut periods: Vec<ClassPeriod>) -> Self {
        periods.sort_by_key(|p| p.start);
        Self {
            periods,
            clock: local_time,
        }
    }

    /// Replace the wall clock, for deterministic tests.
    pub fn with_clock(mut self, clock: fn() -> NaiveTime) -> Self {
        self.clock = clock;
        self
    }
}

impl ScheduleProvider for StaticSchedule {
    fn current_plan(&self) -> Result<Vec<ClassPeriod>, CollaboratorError> {
        Ok(self.periods.clone())
    }

    fn upcoming_period(&self) -> Result<Option<ClassPeriod>, CollaboratorError> {
        let now = (self.clock)();
        Ok(self.periods.iter().find(|p| p.start > now).cloned())
    }

    fn now(&self) -> NaiveTime {
        (self.clock)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn period(start: NaiveTime, end: NaiveTime, subject: &str) -> ClassPeriod {
        ClassPeriod {
            start,
            end,
            subject: subject.into(),
        }
    }

    #[test]
    fn period_contains_is_half_open() {
        let p = period(t(8, 0), t(8, 45), "Math");
        assert!(p.contains(t(8, 0)));
        assert!(p.contains(t(8, 44)));
        assert!(!p.contains(t(8, 45)));
        assert!(!p.contains(t(7, 59)));
    }

    #[test]
    fn static_schedule_sorts_and_finds_upcoming() {
        let schedule = StaticSchedule::new(vec![
            period(t(10, 0), t(10, 45), "History"),
            period(t(8, 0), t(8, 45), "Math"),
        ])
        .with_clock(|| NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        let plan = schedule.current_plan().unwrap();
        assert_eq!(plan[0].subject, "Math");
        assert_eq!(plan[1].subject, "History");

        let next = schedule.upcoming_period().unwrap().unwrap();
        assert_eq!(next.subject, "History");
    }

    #[test]
    fn static_schedule_no_upcoming_after_last_period() {
        let schedule = StaticSchedule::new(vec![period(t(8, 0), t(8, 45), "Math")])
            .with_clock(|| NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert!(schedule.upcoming_period().unwrap().is_none());
    }

    #[test]
    fn missing_collaborator_reports_unavailable() {
        let collabs = Collaborators::default();
        let err = collabs.schedule().err().unwrap();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
        assert_eq!(err.to_string(), "schedule provider is not available");
    }

    #[test]
    fn own_process_window_is_not_closeable() {
        let w = WindowInfo {
            handle: 1,
            title: "me".into(),
            process_name: "deskgate".into(),
            process_id: Some(std::process::id()),
            system_critical: false,
        };
        assert!(w.is_current_process());
        assert!(!w.is_closeable());
    }

    #[test]
    fn critical_window_is_not_closeable() {
        let w = WindowInfo {
            handle: 2,
            title: "Taskbar".into(),
            process_name: "explorer".into(),
            process_id: None,
            system_critical: true,
        };
        assert!(!w.is_closeable());
    }
}
