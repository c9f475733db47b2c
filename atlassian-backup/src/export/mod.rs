//! Server-side export state machines.
//!
//! Each Atlassian product exposes its own export API, but both follow the
//! same shape: find an existing export, decide whether it can be reused,
//! otherwise trigger a new one, poll until it finishes and download the
//! archive. A state machine never writes the status file itself; it returns
//! the fields it wants changed and leaves persistence to the orchestrator.

pub mod confluence;
pub mod jira;

pub use confluence::{ConfluenceBackupDescriptor, ConfluenceExport};
pub use jira::JiraExport;

use crate::config::{BackupSettings, Credentials};
use crate::download::Downloader;
use crate::layout::BackupLayout;
use crate::status::{BackupStatus, StatusDelta};
use crate::transport::Transport;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupService {
    Jira,
    Confluence,
}

impl BackupService {
    /// Lowercase name used in archive file names.
    pub fn file_stem(&self) -> &'static str {
        match self {
            BackupService::Jira => "jira",
            BackupService::Confluence => "confluence",
        }
    }
}

impl fmt::Display for BackupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupService::Jira => write!(f, "Jira"),
            BackupService::Confluence => write!(f, "Confluence"),
        }
    }
}

/// Reconciles the local status of one service with the server's exports.
#[async_trait]
pub trait ExportStateMachine: Send + Sync {
    fn service(&self) -> BackupService;

    /// Bring the local backup up to date and return the status fields that changed.
    ///
    /// An empty delta means nothing new was downloaded.
    async fn reconcile(&self, status: &BackupStatus, now: DateTime<Utc>) -> Result<StatusDelta>;
}

/// Result of one progress check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Pending,
    Complete(T),
    Failed(String),
}

/// Fixed-interval polling with an optional deadline.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    max_wait: Option<Duration>,
}

impl Poller {
    pub fn new(interval: Duration, max_wait: Option<Duration>) -> Self {
        Self { interval, max_wait }
    }

    /// Call `check` until it reports a terminal outcome.
    ///
    /// Errors from `check` abort the loop. Exceeding the deadline yields
    /// [`BackupError::PollTimeout`].
    pub async fn poll_until<T, F, Fut>(&self, service: BackupService, mut check: F) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome<T>>>,
    {
        let started = Instant::now();
        loop {
            match check().await? {
                PollOutcome::Pending => {}
                terminal => return Ok(terminal),
            }

            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    return Err(BackupError::PollTimeout {
                        service: service.to_string(),
                        waited,
                    });
                }
            }

            debug!("{} export still running, checking again in {:?}", service, self.interval);
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Everything an export state machine needs to talk to one instance.
#[derive(Clone)]
pub struct ExportContext {
    pub transport: Transport,
    pub downloader: Downloader,
    pub layout: BackupLayout,
    pub poller: Poller,
    pub cb_attachments: bool,
}

impl ExportContext {
    pub fn new(instance_url: &str, credentials: &Credentials, settings: &BackupSettings) -> Result<Self> {
        let transport = Transport::new(instance_url, credentials.clone(), settings)?;
        let downloader = Downloader::new(transport.clone(), settings);

        Ok(Self {
            layout: BackupLayout::new(
                &settings.backup_target_directory,
                instance_url,
                &settings.status_file,
            ),
            poller: Poller::new(settings.poll_interval, settings.max_poll_wait),
            cb_attachments: settings.cb_attachments,
            transport,
            downloader,
        })
    }

    /// Download `url` into the dated archive for `service` and return its path.
    pub async fn download_archive(
        &self,
        service: BackupService,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let destination = self.layout.backup_path(service, now);
        let report = self
            .downloader
            .download(url, &destination, &service.to_string())
            .await?;
        Ok(report.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_service_names() {
        assert_eq!(BackupService::Jira.to_string(), "Jira");
        assert_eq!(BackupService::Confluence.file_stem(), "confluence");
    }

    #[tokio::test]
    async fn test_poll_until_returns_terminal_outcome() {
        let poller = Poller::new(Duration::from_millis(1), None);
        let calls = AtomicUsize::new(0);

        let outcome = poller
            .poll_until(BackupService::Jira, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(PollOutcome::Pending)
                } else {
                    Ok(PollOutcome::Complete("done"))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Complete("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let poller = Poller::new(Duration::from_millis(5), Some(Duration::from_millis(20)));

        let err = poller
            .poll_until(BackupService::Confluence, || async {
                Ok(PollOutcome::<()>::Pending)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::PollTimeout { ref service, .. } if service == "Confluence"));
    }

    #[tokio::test]
    async fn test_poll_until_propagates_errors() {
        let poller = Poller::new(Duration::from_millis(1), None);
        let result = poller
            .poll_until(BackupService::Jira, || async {
                Err::<PollOutcome<()>, _>(BackupError::Protocol("bad".into()))
            })
            .await;
        assert!(matches!(result, Err(BackupError::Protocol(_))));
    }
}
