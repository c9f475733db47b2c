//! On-disk layout of one instance's backups.

use crate::export::BackupService;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};

/// Turn an instance URL into a folder name.
///
/// Strips the scheme, replaces characters that are unsafe in file names with
/// `_`, and trims leading and trailing underscores.
pub fn sanitize_folder_name(instance_url: &str) -> String {
    let stripped = instance_url
        .strip_prefix("https://")
        .or_else(|| instance_url.strip_prefix("http://"))
        .unwrap_or(instance_url);

    let replaced: String = stripped
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    replaced.trim_matches('_').to_string()
}

/// Paths derived from the target directory and an instance URL.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupLayout {
    instance_dir: PathBuf,
    status_file: PathBuf,
}

impl BackupLayout {
    pub fn new(backup_target_directory: &Path, instance_url: &str, status_file: &str) -> Self {
        let instance_dir = backup_target_directory.join(sanitize_folder_name(instance_url));
        // Only the base name of the configured status file is honoured
        let file_name = Path::new(status_file)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(status_file));
        let status_file = instance_dir.join(file_name);

        Self {
            instance_dir,
            status_file,
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn status_file(&self) -> &Path {
        &self.status_file
    }

    /// `<instance_dir>/<service>-backup-<YYYY-MM-DD>.zip`, dated in local time.
    pub fn backup_path(&self, service: BackupService, now: DateTime<Utc>) -> PathBuf {
        let date = now.with_timezone(&Local).format("%Y-%m-%d");
        self.instance_dir
            .join(format!("{}-backup-{}.zip", service.file_stem(), date))
    }
}
