//! Configuration management for the backup agent.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides. An environment variable always wins over the file value.

use crate::download::RetryPolicy;
use crate::utils::{BackupError, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_STATUS_FILE: &str = "backup_status.json";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URLs of the Atlassian Cloud instances to back up, in order.
    pub instances: Vec<String>,
    pub credentials: Credentials,
    pub settings: BackupSettings,
    pub log: LogConfig,
}

/// The single basic-auth credential pair used for every request.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub api_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// Knobs threaded into the transport, downloader and export state machines.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Sleep between two export progress checks
    pub poll_interval: Duration,

    /// Give up on an export after this long (`None` waits forever)
    pub max_poll_wait: Option<Duration>,

    /// Include attachments in the exports
    pub cb_attachments: bool,

    /// Base name of the per-instance status file
    pub status_file: String,

    /// Directory that holds one sub-folder per instance
    pub backup_target_directory: PathBuf,

    pub retry: RetryPolicy,

    /// Read size used when streaming archives to disk
    pub chunk_size: usize,

    /// Emit a progress line every time this many bytes have been written
    pub log_threshold: u64,

    pub connect_timeout: Duration,

    /// Maximum idle time between two reads of a response body
    pub read_timeout: Duration,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_poll_wait: None,
            cb_attachments: true,
            status_file: DEFAULT_STATUS_FILE.to_string(),
            backup_target_directory: PathBuf::from("."),
            retry: RetryPolicy::default(),
            chunk_size: 8 * 1024,
            log_threshold: 100 * 1024 * 1024,
            connect_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// On-disk shape of the TOML configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub atlassian: AtlassianSection,
    pub log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AtlassianSection {
    pub instances: Option<InstanceList>,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub max_poll_wait_seconds: Option<u64>,
    pub cb_attachments: Option<bool>,
    pub status_file: Option<String>,
    pub backup_target_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: Option<String>,
}

/// Instances may be given as a TOML array or as a comma separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstanceList {
    Csv(String),
    List(Vec<String>),
}

impl InstanceList {
    fn entries(&self) -> Vec<String> {
        match self {
            InstanceList::Csv(csv) => split_instances(csv),
            InstanceList::List(list) => list
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file values with environment lookups; `env` wins on every key.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let section = file.atlassian;

        let instances = match env("ATLASSIAN_INSTANCES") {
            Some(csv) => split_instances(&csv),
            None => section
                .instances
                .as_ref()
                .map(InstanceList::entries)
                .unwrap_or_default(),
        };
        let instances: Vec<String> = instances.iter().map(|i| instance_url(i)).collect();
        if instances.is_empty() {
            return Err(BackupError::Config(
                "No valid Atlassian instances provided. Set ATLASSIAN_INSTANCES.".to_string(),
            ));
        }

        let username = env("ATLASSIAN_USERNAME").or(section.username);
        let api_token = env("ATLASSIAN_API_TOKEN").or(section.api_token);
        let credentials = match (username, api_token) {
            (Some(username), Some(api_token)) => Credentials { username, api_token },
            _ => {
                return Err(BackupError::Config(
                    "Missing one of ATLASSIAN_USERNAME or ATLASSIAN_API_TOKEN.".to_string(),
                ))
            }
        };

        let mut settings = BackupSettings::default();
        if let Some(secs) = parse_env_u64(&env, "POLL_INTERVAL_SECONDS")?
            .or(section.poll_interval_seconds)
        {
            settings.poll_interval = Duration::from_secs(secs);
        }
        settings.max_poll_wait = parse_env_u64(&env, "MAX_POLL_WAIT_SECONDS")?
            .or(section.max_poll_wait_seconds)
            .map(Duration::from_secs);
        if let Some(flag) = env("CB_ATTACHMENTS")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .or(section.cb_attachments)
        {
            settings.cb_attachments = flag;
        }
        if let Some(status_file) = env("STATUS_FILE").or(section.status_file) {
            settings.status_file = status_file;
        }
        if let Some(dir) = env("BACKUP_TARGET_DIRECTORY")
            .map(PathBuf::from)
            .or(section.backup_target_directory)
        {
            settings.backup_target_directory = dir;
        }

        let level = env("LOG_LEVEL")
            .or(file.log.level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Config {
            instances,
            credentials,
            settings,
            log: LogConfig { level },
        })
    }
}

impl FileConfig {
    /// Load a configuration file from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("Invalid {}: {}", path.display(), e)))
    }
}

/// Expand a bare instance name to its Atlassian Cloud URL.
///
/// Entries that already carry a scheme are used verbatim.
pub fn instance_url(entry: &str) -> String {
    let entry = entry.trim();
    if entry.contains("://") {
        entry.trim_end_matches('/').to_string()
    } else {
        format!("https://{}.atlassian.net", entry)
    }
}

fn split_instances(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env_u64<F>(env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| BackupError::Config(format!("{} must be an integer, got '{}'", key, raw)))
        })
        .transpose()
}
