//! Runs every export state machine of an instance and persists the result.

use crate::config::{BackupSettings, Config, Credentials};
use crate::export::{ConfluenceExport, ExportContext, ExportStateMachine, JiraExport};
use crate::status::{BackupStatus, StatusDelta, StatusStore};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{error, info};

/// Backs up one Atlassian instance.
pub struct BackupOrchestrator {
    instance_url: String,
    store: StatusStore,
    services: Vec<Box<dyn ExportStateMachine>>,
}

impl BackupOrchestrator {
    pub fn new(
        instance_url: impl Into<String>,
        store: StatusStore,
        services: Vec<Box<dyn ExportStateMachine>>,
    ) -> Self {
        Self {
            instance_url: instance_url.into(),
            store,
            services,
        }
    }

    /// Jira then Confluence, sharing one transport and layout.
    pub fn for_instance(
        instance_url: &str,
        credentials: &Credentials,
        settings: &BackupSettings,
    ) -> Result<Self> {
        let ctx = ExportContext::new(instance_url, credentials, settings)?;
        info!("Using Atlassian Cloud URL: {}", instance_url);
        info!("Backup target directory: {}", ctx.layout.instance_dir().display());

        let store = StatusStore::new(ctx.layout.status_file());
        let services: Vec<Box<dyn ExportStateMachine>> = vec![
            Box::new(JiraExport::new(ctx.clone())),
            Box::new(ConfluenceExport::new(ctx)),
        ];
        Ok(Self::new(instance_url, store, services))
    }

    pub async fn orchestrate(&self) -> Result<bool> {
        self.orchestrate_at(Utc::now()).await
    }

    /// Reconcile every service against the persisted status.
    ///
    /// Returns whether anything new was recorded. A failing service does not
    /// stop the others; its failure is reported after the other services'
    /// results have been saved.
    pub async fn orchestrate_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let status = self.store.load().await?;
        log_last_backups(&status);

        let mut delta = StatusDelta::default();
        let mut failed = Vec::new();

        for service in &self.services {
            match service.reconcile(&status, now).await {
                Ok(service_delta) => {
                    if service_delta.is_empty() {
                        info!("No new {} backup for {}", service.service(), self.instance_url);
                    }
                    delta.merge(service_delta);
                }
                Err(e) => {
                    error!(
                        "{} backup failed for {}: {}",
                        service.service(),
                        self.instance_url,
                        e
                    );
                    failed.push(service.service().to_string());
                }
            }
        }

        let changed = !delta.is_empty();
        if changed {
            let mut merged = status;
            merged.merge(delta);
            self.store.save(&merged).await?;
            info!("Backup status updated at {}", self.store.path().display());
        }

        if !failed.is_empty() {
            return Err(BackupError::ServicesFailed { services: failed });
        }
        Ok(changed)
    }
}

fn log_last_backups(status: &BackupStatus) {
    let local = |ts: Option<DateTime<Utc>>| {
        ts.map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string())
            .unwrap_or_else(|| "never".to_string())
    };
    info!("Last Jira backup: {}", local(status.last_jira_backup));
    info!("Last Confluence backup: {}", local(status.last_confluence_backup));
}

/// Outcome of a run over all configured instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub total: usize,
}

/// Back up every configured instance in turn, isolating failures.
pub async fn backup_instances(config: &Config) -> RunSummary {
    let total = config.instances.len();
    let mut succeeded = 0;

    for instance_url in &config.instances {
        info!("Starting backup for {}", instance_url);
        let result = match BackupOrchestrator::for_instance(
            instance_url,
            &config.credentials,
            &config.settings,
        ) {
            Ok(orchestrator) => orchestrator.orchestrate().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(changed) => {
                succeeded += 1;
                if changed {
                    info!("Backup finished for {}", instance_url);
                } else {
                    info!("Backups for {} are already up to date", instance_url);
                }
            }
            Err(e) => error!("Backup failed for {}: {}", instance_url, e),
        }
    }

    info!(
        "Backup completed for {} of {} Atlassian instances",
        succeeded, total
    );
    RunSummary { succeeded, total }
}
