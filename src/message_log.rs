//! Append-only record of every notification send attempt, one file per day.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One line of the daily log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLogEntry {
    pub timestamp: String,
    pub message: String,
    pub success: bool,
    pub source_address: String,
}

impl MessageLogEntry {
    pub fn new(at: DateTime<Local>, message: &str, success: bool, source: &str) -> Self {
        Self {
            timestamp: at.format("%Y-%m-%d %H:%M:%S").to_string(),
            message: message.to_string(),
            success,
            source_address: source.to_string(),
        }
    }
}

pub struct MessageLog {
    dir: Option<PathBuf>,
    // Serializes appends so concurrent requests never interleave lines.
    write_lock: Mutex<()>,
}

impl MessageLog {
    /// Log into `<data_dir>/message/`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: Some(data_dir.join("message")),
            write_lock: Mutex::new(()),
        }
    }

    /// A log that discards entries.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn file_for(&self, at: DateTime<Local>) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("message_log_{}.json", at.format("%Y%m%d"))))
    }

    pub async fn append(&self, at: DateTime<Local>, entry: &MessageLogEntry) -> std::io::Result<()> {
        let (Some(dir), Some(path)) = (self.dir.as_ref(), self.file_for(at)) else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path());
        let now = Local::now();

        log.append(now, &MessageLogEntry::new(now, "hello", true, "10.0.0.2"))
            .await
            .unwrap();
        log.append(now, &MessageLogEntry::new(now, "again", false, "10.0.0.3"))
            .await
            .unwrap();

        let path = log.file_for(now).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("message_log_"));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<MessageLogEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "hello");
        assert!(lines[0].success);
        assert_eq!(lines[1].source_address, "10.0.0.3");
        assert!(!lines[1].success);
    }

    #[test]
    fn entry_uses_camel_case_fields() {
        let entry = MessageLogEntry::new(Local::now(), "m", true, "127.0.0.1");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("sourceAddress").is_some());
        assert_eq!(json["timestamp"].as_str().unwrap().len(), 19);
    }

    #[tokio::test]
    async fn disabled_log_is_a_no_op() {
        let log = MessageLog::disabled();
        let now = Local::now();
        assert!(log.file_for(now).is_none());
        log.append(now, &MessageLogEntry::new(now, "x", true, "y"))
            .await
            .unwrap();
    }
}
