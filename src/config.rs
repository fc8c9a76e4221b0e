use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::collab::{ClassPeriod, NotificationEffects};
use crate::monitor::HealthConfig;

pub const DEFAULT_PORT: u16 = 8088;

/// Top-level config, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// Where the token store and message logs live.
    pub data_dir: Option<PathBuf>,
    /// Login/setup attempts allowed per peer in a burst, refilled at one per
    /// second. 0 disables limiting.
    pub login_rate_limit: u32,
    pub health: HealthSection,
    pub sweep: SweepSection,
    pub notification: NotificationSection,
    /// Static timetable served by the built-in schedule provider.
    pub schedule: Vec<ScheduleEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: None,
            login_rate_limit: 5,
            health: HealthSection::default(),
            sweep: SweepSection::default(),
            notification: NotificationSection::default(),
            schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub cooldown_secs: u64,
    pub backoff_ms: u64,
    pub max_retries: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            cooldown_secs: 30,
            backoff_ms: 500,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweepSection {
    pub interval_secs: u64,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationSection {
    pub default_duration_secs: u64,
    pub sound: bool,
    pub emphasis: bool,
    pub topmost: bool,
}

impl Default for NotificationSection {
    fn default() -> Self {
        let effects = NotificationEffects::default();
        Self {
            default_duration_secs: 10,
            sound: effects.sound,
            emphasis: effects.emphasis,
            topmost: effects.topmost,
        }
    }
}

/// One `[[schedule]]` entry. Times are `HH:MM` or `HH:MM:SS`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub start: String,
    pub end: String,
    pub subject: String,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid("health.interval_secs must be > 0".into()));
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep.interval_secs must be > 0".into()));
        }
        if !(1..=3600).contains(&self.notification.default_duration_secs) {
            return Err(ConfigError::Invalid(
                "notification.default_duration_secs must be between 1 and 3600".into(),
            ));
        }
        self.class_periods().map(|_| ())
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health.interval_secs),
            cooldown: Duration::from_secs(self.health.cooldown_secs),
            backoff: Duration::from_millis(self.health.backoff_ms),
            max_retries: self.health.max_retries,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    pub fn notification_defaults(&self) -> (Duration, NotificationEffects) {
        let n = &self.notification;
        (
            Duration::from_secs(n.default_duration_secs),
            NotificationEffects {
                sound: n.sound,
                emphasis: n.emphasis,
                topmost: n.topmost,
            },
        )
    }

    pub fn class_periods(&self) -> Result<Vec<ClassPeriod>, ConfigError> {
        self.schedule
            .iter()
            .map(|entry| {
                let start = parse_time(&entry.start)?;
                let end = parse_time(&entry.end)?;
                if end <= start {
                    return Err(ConfigError::Invalid(format!(
                        "schedule entry '{}' ends before it starts",
                        entry.subject
                    )));
                }
                Ok(ClassPeriod {
                    start,
                    end,
                    subject: entry.subject.clone(),
                })
            })
            .collect()
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("invalid time '{value}', expected HH:MM")))
}

/// `<config dir>/deskgate/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("deskgate").join("config.toml"))
}

/// `<data dir>/deskgate`, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("deskgate"))
        .unwrap_or_else(|| PathBuf::from(".deskgate"))
}

#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}); consider restricting it to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 8088);
        assert_eq!(config.login_rate_limit, 5);
        assert_eq!(config.health_config(), HealthConfig::default());
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            port = 9090
            data_dir = "/var/lib/deskgate"
            login_rate_limit = 0

            [health]
            interval_secs = 5
            cooldown_secs = 15
            backoff_ms = 250
            max_retries = 5

            [sweep]
            interval_secs = 60

            [notification]
            default_duration_secs = 20
            sound = false
            emphasis = true

            [[schedule]]
            start = "09:00"
            end = "09:45"
            subject = "Physics"

            [[schedule]]
            start = "08:00"
            end = "08:45:00"
            subject = "Math"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.data_dir.as_deref(), Some(Path::new("/var/lib/deskgate")));
        assert_eq!(config.health_config().max_retries, 5);
        assert_eq!(config.health_config().backoff, Duration::from_millis(250));

        let (duration, effects) = config.notification_defaults();
        assert_eq!(duration, Duration::from_secs(20));
        assert!(!effects.sound);
        assert!(effects.emphasis);
        assert!(effects.topmost);

        let periods = config.class_periods().unwrap();
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[1].subject, "Math");
        assert_eq!(periods[1].end, NaiveTime::from_hms_opt(8, 45, 0).unwrap());
    }

    #[test]
    fn bad_schedule_time_is_rejected() {
        let toml = r#"
            [[schedule]]
            start = "8am"
            end = "09:00"
            subject = "Art"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("8am"));
    }

    #[test]
    fn inverted_period_is_rejected() {
        let config = Config {
            schedule: vec![ScheduleEntry {
                start: "10:00".into(),
                end: "09:00".into(),
                subject: "History".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_duration_default_is_rejected() {
        let mut config = Config::default();
        config.notification.default_duration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_bit_detection() {
        assert!(is_world_readable(0o644));
        assert!(!is_world_readable(0o600));
        assert!(!is_world_readable(0o700));
    }
}
