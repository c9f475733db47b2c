//! Atlassian Cloud backup library
//!
//! Keeps a local copy of the latest Jira and Confluence site exports for a
//! set of Atlassian Cloud instances, reusing recent server-side exports and
//! resuming interrupted downloads.

pub mod config;
pub mod download;
pub mod export;
pub mod layout;
pub mod orchestrator;
pub mod status;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{backup_instances, BackupOrchestrator, RunSummary};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
