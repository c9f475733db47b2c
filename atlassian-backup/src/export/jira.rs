//! Jira Cloud export.
//!
//! Jira keeps the id of the most recent export task. A task younger than the
//! reuse window is waited on and downloaded instead of starting a new export,
//! since Jira rate-limits export creation.

use super::{BackupService, ExportContext, ExportStateMachine, PollOutcome};
use crate::status::{BackupStatus, StatusDelta};
use crate::transport::RequestOptions;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

const LAST_TASK_ID_PATH: &str = "/rest/backup/1/export/lastTaskId";
const RUN_BACKUP_PATH: &str = "/rest/backup/1/export/runbackup";
const PROGRESS_PATH: &str = "/rest/backup/1/export/getProgress";
const TASK_PATH: &str = "/rest/api/3/task";
const DOWNLOAD_PREFIX: &str = "/plugins/servlet";

fn reuse_window() -> TimeDelta {
    TimeDelta::hours(24)
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    submitted: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct JiraProgress {
    status: Option<String>,
    progress: Option<Value>,
    result: Option<String>,
}

impl JiraProgress {
    fn outcome(&self) -> PollOutcome<()> {
        let status = self.status.as_deref().unwrap_or_default().to_ascii_uppercase();
        match status.as_str() {
            "COMPLETE" | "DONE" | "SUCCESSFUL" => PollOutcome::Complete(()),
            _ if self.percent() == Some(100) => PollOutcome::Complete(()),
            "FAILED" | "ERROR" => PollOutcome::Failed(status),
            _ => PollOutcome::Pending,
        }
    }

    /// Progress percentage, reported either as a number or a string.
    fn percent(&self) -> Option<i64> {
        match self.progress.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

pub struct JiraExport {
    ctx: ExportContext,
}

impl JiraExport {
    pub fn new(ctx: ExportContext) -> Self {
        Self { ctx }
    }

    /// Id of the newest export task on the server, if there is one.
    pub async fn fetch_last_task_id(&self) -> Result<Option<i64>> {
        let url = self.ctx.transport.url(LAST_TASK_ID_PATH);
        let body = self.ctx.transport.get(&url).await?.text().await?;
        let body = body.trim();
        if body.is_empty() {
            return Ok(None);
        }
        body.parse()
            .map(Some)
            .map_err(|_| BackupError::Protocol(format!("lastTaskId is not an integer: '{}'", body)))
    }

    /// Submission time of `task_id`.
    pub async fn fetch_task_submitted(&self, task_id: i64) -> Result<DateTime<Utc>> {
        let url = self.ctx.transport.url(&format!("{}/{}", TASK_PATH, task_id));
        let info: TaskInfo = self
            .ctx
            .transport
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| BackupError::Protocol(format!("Unreadable Jira task {}: {}", task_id, e)))?;

        let millis = info
            .submitted
            .as_ref()
            .and_then(epoch_millis)
            .filter(|ms| *ms != 0)
            .ok_or_else(|| {
                BackupError::Protocol(format!("Jira task {} has no submission time", task_id))
            })?;
        Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            BackupError::Protocol(format!("Jira task {} has invalid submission time {}", task_id, millis))
        })
    }

    /// Start a new export and return its task id.
    pub async fn trigger(&self) -> Result<i64> {
        let url = self.ctx.transport.url(RUN_BACKUP_PATH);
        let body = json!({
            "cbAttachments": self.ctx.cb_attachments.to_string(),
            "exportToCloud": "true",
        });
        info!("Triggering new Jira export (attachments: {})", self.ctx.cb_attachments);

        let response: Value = self
            .ctx
            .transport
            .request(Method::POST, &url, RequestOptions::new().json(body))
            .await?
            .json()
            .await
            .map_err(|e| BackupError::Protocol(format!("Unreadable Jira runbackup response: {}", e)))?;

        let task_id = response
            .get("taskId")
            .or_else(|| response.get("task_id"))
            .and_then(task_id_value)
            .ok_or_else(|| {
                BackupError::Protocol(format!("Jira runbackup response has no task id: {}", response))
            })?;
        info!("Jira export started with task ID {}", task_id);
        Ok(task_id)
    }

    async fn fetch_progress(&self, task_id: i64) -> Result<JiraProgress> {
        let url = self.ctx.transport.url(PROGRESS_PATH);
        let options = RequestOptions::new().param("taskId", task_id.to_string());
        self.ctx
            .transport
            .request(Method::GET, &url, options)
            .await?
            .json()
            .await
            .map_err(|e| BackupError::Protocol(format!("Unreadable Jira progress for task {}: {}", task_id, e)))
    }

    /// Poll `task_id` until it finishes; `true` when it succeeded.
    pub async fn wait_for_completion(&self, task_id: i64) -> Result<bool> {
        let outcome = self
            .ctx
            .poller
            .poll_until(BackupService::Jira, || async {
                let progress = self.fetch_progress(task_id).await?;
                debug!(
                    "Jira task {} status {:?}, progress {:?}",
                    task_id, progress.status, progress.progress
                );
                Ok::<_, BackupError>(progress.outcome())
            })
            .await?;

        match outcome {
            PollOutcome::Complete(()) => {
                info!("Jira task {} completed", task_id);
                Ok(true)
            }
            PollOutcome::Failed(status) => {
                error!("Jira task {} finished with status {}", task_id, status);
                Ok(false)
            }
            PollOutcome::Pending => Ok(false),
        }
    }

    /// Absolute download URL of a completed task.
    pub async fn download_url(&self, task_id: i64) -> Result<String> {
        let progress = self.fetch_progress(task_id).await?;
        let result = progress
            .result
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                BackupError::Protocol(format!("Jira task {} has no download result", task_id))
            })?;
        Ok(self.ctx.transport.url(&format!(
            "{}/{}",
            DOWNLOAD_PREFIX,
            result.trim_start_matches('/')
        )))
    }

    async fn download(&self, task_id: i64, now: DateTime<Utc>) -> Result<std::path::PathBuf> {
        let url = self.download_url(task_id).await?;
        self.ctx
            .download_archive(BackupService::Jira, &url, now)
            .await
    }

    /// Wait for and download a recent server task. `None` when it is stale or failed.
    async fn reuse_existing(&self, task_id: i64, now: DateTime<Utc>) -> Result<Option<StatusDelta>> {
        let submitted = self.fetch_task_submitted(task_id).await?;
        if now - submitted > reuse_window() {
            info!(
                "Jira task {} was submitted at {}, older than 24h; a new export is needed",
                task_id, submitted
            );
            return Ok(None);
        }

        info!("Reusing Jira task {} submitted at {}", task_id, submitted);
        match self.wait_for_completion(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Jira task {} did not complete; triggering a new export", task_id);
                return Ok(None);
            }
            Err(e @ BackupError::PollTimeout { .. }) => {
                warn!("Gave up waiting on Jira task {} ({}); triggering a new export", task_id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let file = self.download(task_id, now).await?;
        Ok(Some(StatusDelta {
            last_jira_backup: Some(submitted),
            jira_task_id: Some(task_id),
            jira_file: Some(file),
            ..StatusDelta::default()
        }))
    }

    async fn create_new(&self, now: DateTime<Utc>) -> Result<StatusDelta> {
        let task_id = self.trigger().await?;
        if !self.wait_for_completion(task_id).await? {
            return Ok(StatusDelta::default());
        }

        let file = self.download(task_id, now).await?;
        Ok(StatusDelta {
            last_jira_backup: Some(now),
            jira_task_id: Some(task_id),
            jira_file: Some(file),
            ..StatusDelta::default()
        })
    }
}

#[async_trait]
impl ExportStateMachine for JiraExport {
    fn service(&self) -> BackupService {
        BackupService::Jira
    }

    async fn reconcile(&self, status: &BackupStatus, now: DateTime<Utc>) -> Result<StatusDelta> {
        let server_task_id = match self.fetch_last_task_id().await {
            Ok(task_id) => task_id,
            Err(e @ BackupError::Http { .. }) => return Err(e),
            Err(e) => {
                error!("Could not fetch last Jira task ID: {}", e);
                return Ok(StatusDelta::default());
            }
        };

        if let Some(task_id) = server_task_id {
            if Some(task_id) == status.jira_task_id && status.jira_file.is_some() {
                info!("Jira task {} is already downloaded, nothing to do", task_id);
                return Ok(StatusDelta::default());
            }
            info!(
                "Using server Jira task ID {} (local was {:?})",
                task_id, status.jira_task_id
            );
            if let Some(delta) = self.reuse_existing(task_id, now).await? {
                return Ok(delta);
            }
        } else {
            info!("No previous Jira export found on the server");
        }

        self.create_new(now).await
    }
}

fn epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn task_id_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
