//! Confluence Cloud export.
//!
//! Confluence exposes a single backup slot per site. A recent, complete,
//! non-outdated backup is downloaded as is; anything else starts a new one.

use super::{BackupService, ExportContext, ExportStateMachine, PollOutcome};
use crate::status::{BackupStatus, StatusDelta};
use crate::transport::RequestOptions;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use reqwest::header::HeaderName;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

const PROGRESS_PATH: &str = "/wiki/rest/obm/1.0/getprogress.json";
const RUN_BACKUP_PATH: &str = "/wiki/rest/obm/1.0/runbackup";

const STATUS_COMPLETE: &str = "COMPLETE";

fn freshness_window() -> TimeDelta {
    TimeDelta::days(7)
}

/// Body of `getprogress.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfluenceBackupDescriptor {
    /// Epoch milliseconds, as a number or numeric string
    pub time: Option<Value>,
    pub is_outdated: Option<bool>,
    pub current_status: Option<String>,
    pub alternative_percentage: Option<Value>,
    pub filename: Option<String>,
}

impl ConfluenceBackupDescriptor {
    pub fn remote_timestamp(&self) -> Option<DateTime<Utc>> {
        let millis = match self.time.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Utc.timestamp_millis_opt(millis).single()
    }

    /// A descriptor that does not say otherwise is outdated.
    pub fn is_outdated(&self) -> bool {
        self.is_outdated.unwrap_or(true)
    }

    pub fn status(&self) -> &str {
        self.current_status.as_deref().unwrap_or_default()
    }

    /// Whether the backup on the server can be downloaded instead of creating one.
    pub fn is_reusable(&self, now: DateTime<Utc>) -> bool {
        let Some(remote) = self.remote_timestamp() else {
            warn!("Confluence backup has no usable timestamp ({:?})", self.time);
            return false;
        };
        !self.is_outdated() && remote > now - freshness_window() && self.status() == STATUS_COMPLETE
    }

    fn outcome(&self) -> PollOutcome<()> {
        match self.status() {
            STATUS_COMPLETE => PollOutcome::Complete(()),
            "FAILED" | "ERROR" => PollOutcome::Failed(self.status().to_string()),
            _ => PollOutcome::Pending,
        }
    }

    fn percentage(&self) -> String {
        match &self.alternative_percentage {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "?".to_string(),
        }
    }
}

/// Statuses that mean the backup manager is not available for these credentials.
fn is_unavailable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    )
}

pub struct ConfluenceExport {
    ctx: ExportContext,
}

impl ConfluenceExport {
    pub fn new(ctx: ExportContext) -> Self {
        Self { ctx }
    }

    /// Current backup descriptor, or `None` when Confluence backups are unavailable.
    pub async fn fetch_descriptor(&self) -> Result<Option<ConfluenceBackupDescriptor>> {
        let url = self.ctx.transport.url(PROGRESS_PATH);
        match self.ctx.transport.get(&url).await {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                info!("Confluence backup is not available for this instance (204)");
                Ok(None)
            }
            Ok(response) => response.json().await.map(Some).map_err(|e| {
                BackupError::Protocol(format!("Unreadable Confluence backup status: {}", e))
            }),
            Err(e) if e.status().is_some_and(is_unavailable) => {
                info!("Confluence backup is not available for this instance: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_progress(&self) -> Result<ConfluenceBackupDescriptor> {
        let url = self.ctx.transport.url(PROGRESS_PATH);
        self.ctx
            .transport
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| BackupError::Protocol(format!("Unreadable Confluence progress: {}", e)))
    }

    /// Start a new site backup.
    pub async fn trigger(&self) -> Result<()> {
        let url = self.ctx.transport.url(RUN_BACKUP_PATH);
        let options = RequestOptions::new()
            .header(HeaderName::from_static("x-atlassian-token"), "no-check")
            .header(HeaderName::from_static("x-requested-with"), "XMLHttpRequest")
            .json(json!({ "cbAttachments": self.ctx.cb_attachments }));

        info!("Triggering new Confluence backup (attachments: {})", self.ctx.cb_attachments);
        self.ctx.transport.request(Method::POST, &url, options).await?;
        Ok(())
    }

    /// Poll until the backup finishes; the final descriptor when it completed.
    async fn wait_for_completion(&self) -> Result<Option<ConfluenceBackupDescriptor>> {
        let outcome = self
            .ctx
            .poller
            .poll_until(BackupService::Confluence, || async {
                let descriptor = self.fetch_progress().await?;
                info!(
                    "Confluence backup {} ({}%)",
                    descriptor.status(),
                    descriptor.percentage()
                );
                Ok::<_, BackupError>(match descriptor.outcome() {
                    PollOutcome::Complete(()) => PollOutcome::Complete(descriptor),
                    PollOutcome::Failed(status) => PollOutcome::Failed(status),
                    PollOutcome::Pending => PollOutcome::Pending,
                })
            })
            .await?;

        match outcome {
            PollOutcome::Complete(descriptor) => Ok(Some(descriptor)),
            PollOutcome::Failed(status) => {
                error!("Confluence backup finished with status {}", status);
                Ok(None)
            }
            PollOutcome::Pending => Ok(None),
        }
    }

    /// Absolute download URL of a finished backup, `None` when it failed.
    pub async fn resolve_download_url(&self) -> Result<Option<String>> {
        let Some(descriptor) = self.wait_for_completion().await? else {
            return Ok(None);
        };
        let filename = descriptor
            .filename
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                BackupError::Protocol("Completed Confluence backup has no filename".to_string())
            })?;
        Ok(Some(self.ctx.transport.url(&filename)))
    }

    async fn download(&self, now: DateTime<Utc>) -> Result<Option<std::path::PathBuf>> {
        let Some(url) = self.resolve_download_url().await? else {
            return Ok(None);
        };
        let file = self
            .ctx
            .download_archive(BackupService::Confluence, &url, now)
            .await?;
        Ok(Some(file))
    }
}

#[async_trait]
impl ExportStateMachine for ConfluenceExport {
    fn service(&self) -> BackupService {
        BackupService::Confluence
    }

    async fn reconcile(&self, status: &BackupStatus, now: DateTime<Utc>) -> Result<StatusDelta> {
        let Some(descriptor) = self.fetch_descriptor().await? else {
            return Ok(StatusDelta::default());
        };

        let (last_backup, file) = match descriptor.remote_timestamp() {
            Some(remote) if descriptor.is_reusable(now) => {
                if already_downloaded(status, remote).await {
                    info!("Confluence backup created at {} is already downloaded, nothing to do", remote);
                    return Ok(StatusDelta::default());
                }
                info!("Reusing Confluence backup created at {}", remote);
                (remote, self.download(now).await?)
            }
            _ => {
                info!(
                    "No reusable Confluence backup (status {}, outdated {}, time {:?})",
                    descriptor.status(),
                    descriptor.is_outdated(),
                    descriptor.remote_timestamp()
                );
                self.trigger().await?;
                (now, self.download(now).await?)
            }
        };

        Ok(match file {
            Some(file) => StatusDelta {
                last_confluence_backup: Some(last_backup),
                confluence_file: Some(file),
                ..StatusDelta::default()
            },
            None => StatusDelta::default(),
        })
    }
}

/// The recorded archive belongs to the backup created at `remote` and is still on disk.
async fn already_downloaded(status: &BackupStatus, remote: DateTime<Utc>) -> bool {
    if status.last_confluence_backup != Some(remote) {
        return false;
    }
    match &status.confluence_file {
        Some(file) => tokio::fs::try_exists(file).await.unwrap_or(false),
        None => false,
    }
}
