//! Per-instance backup status and its JSON persistence.
//!
//! The status file is a small JSON object with up to five keys. A missing file
//! means "no backups yet". Unreadable values are dropped with a warning rather
//! than failing the run, and saves go through a temporary file so a crash never
//! leaves a half-written status behind.

use crate::utils::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const LAST_JIRA_BACKUP: &str = "last_jira_backup";
const JIRA_TASK_ID: &str = "jira_task_id";
const JIRA_FILE: &str = "jira_file";
const LAST_CONFLUENCE_BACKUP: &str = "last_confluence_backup";
const CONFLUENCE_FILE: &str = "confluence_file";

/// Last known backup of each service for one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupStatus {
    pub last_jira_backup: Option<DateTime<Utc>>,
    pub jira_task_id: Option<i64>,
    pub jira_file: Option<PathBuf>,
    pub last_confluence_backup: Option<DateTime<Utc>>,
    pub confluence_file: Option<PathBuf>,
}

/// Partial status produced by one service; only the fields it sets are applied.
pub type StatusDelta = BackupStatus;

impl BackupStatus {
    pub fn is_empty(&self) -> bool {
        self.last_jira_backup.is_none()
            && self.jira_task_id.is_none()
            && self.jira_file.is_none()
            && self.last_confluence_backup.is_none()
            && self.confluence_file.is_none()
    }

    /// Overlay every field set in `delta`.
    pub fn merge(&mut self, delta: StatusDelta) {
        if delta.last_jira_backup.is_some() {
            self.last_jira_backup = delta.last_jira_backup;
        }
        if delta.jira_task_id.is_some() {
            self.jira_task_id = delta.jira_task_id;
        }
        if delta.jira_file.is_some() {
            self.jira_file = delta.jira_file;
        }
        if delta.last_confluence_backup.is_some() {
            self.last_confluence_backup = delta.last_confluence_backup;
        }
        if delta.confluence_file.is_some() {
            self.confluence_file = delta.confluence_file;
        }
    }

    fn from_json(object: &Map<String, Value>) -> Self {
        let mut status = BackupStatus {
            last_jira_backup: timestamp_field(object, LAST_JIRA_BACKUP),
            jira_task_id: task_id_field(object),
            jira_file: path_field(object, JIRA_FILE),
            last_confluence_backup: timestamp_field(object, LAST_CONFLUENCE_BACKUP),
            confluence_file: path_field(object, CONFLUENCE_FILE),
        };

        // A file is only meaningful together with the time it was taken
        if status.last_jira_backup.is_none() && status.jira_file.is_some() {
            warn!("Ignoring {} without {}", JIRA_FILE, LAST_JIRA_BACKUP);
            status.jira_file = None;
        }
        if status.last_confluence_backup.is_none() && status.confluence_file.is_some() {
            warn!("Ignoring {} without {}", CONFLUENCE_FILE, LAST_CONFLUENCE_BACKUP);
            status.confluence_file = None;
        }
        status
    }

    fn to_json(&self) -> Value {
        let mut object = Map::new();

        if let Some(last) = self.last_jira_backup {
            object.insert(LAST_JIRA_BACKUP.into(), Value::String(last.to_rfc3339()));
            if let Some(task_id) = self.jira_task_id {
                object.insert(JIRA_TASK_ID.into(), Value::from(task_id));
            }
            if let Some(file) = &self.jira_file {
                object.insert(JIRA_FILE.into(), path_value(file));
            }
        }
        if let Some(last) = self.last_confluence_backup {
            object.insert(LAST_CONFLUENCE_BACKUP.into(), Value::String(last.to_rfc3339()));
            if let Some(file) = &self.confluence_file {
                object.insert(CONFLUENCE_FILE.into(), path_value(file));
            }
        }

        Value::Object(object)
    }
}

fn timestamp_field(object: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    match object.get(key)? {
        Value::Null => None,
        Value::String(raw) => match parse_timestamp(raw) {
            Some(ts) => Some(ts),
            None => {
                warn!("Ignoring malformed {} value '{}'", key, raw);
                None
            }
        },
        other => {
            warn!("Ignoring malformed {} value {}", key, other);
            None
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn task_id_field(object: &Map<String, Value>) -> Option<i64> {
    match object.get(JIRA_TASK_ID)? {
        Value::Null => None,
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        other => {
            warn!("Ignoring malformed {} value {}", JIRA_TASK_ID, other);
            None
        }
    }
}

fn path_field(object: &Map<String, Value>, key: &str) -> Option<PathBuf> {
    object
        .get(key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

/// Reads and writes the status file of one instance.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the status, treating a missing file as empty.
    pub async fn load(&self) -> Result<BackupStatus> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No status file at {}", self.path.display());
                return Ok(BackupStatus::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Value>(&content)? {
            Value::Object(object) => Ok(BackupStatus::from_json(&object)),
            other => {
                warn!(
                    "Status file {} does not hold an object ({}), starting fresh",
                    self.path.display(),
                    other
                );
                Ok(BackupStatus::default())
            }
        }
    }

    /// Replace the status file atomically.
    pub async fn save(&self, status: &BackupStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(&status.to_json())?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("Saved backup status to {}", self.path.display());
        Ok(())
    }
}
