//! Custom error types for the backup agent.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: StatusCode,
        url: String,
        body: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Stream interrupted: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Download of {service} backup failed after {attempts} attempts: {source}")]
    Download {
        service: String,
        attempts: u32,
        #[source]
        source: Box<BackupError>,
    },

    #[error("{service} export did not finish within {}s", waited.as_secs())]
    PollTimeout { service: String, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup failed for: {}", services.join(", "))]
    ServicesFailed { services: Vec<String> },
}

impl BackupError {
    /// Status code of an HTTP error, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            BackupError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transient network failures that the downloader recovers from locally.
    ///
    /// HTTP error statuses and local disk failures are never retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            BackupError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() || e.is_decode()
            }
            BackupError::Stream(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
