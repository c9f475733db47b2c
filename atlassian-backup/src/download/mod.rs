//! Resumable, retrying archive download.
//!
//! The size of the destination file is the single source of truth for resume
//! position. It is read from disk before every attempt, so a partially written
//! archive left behind by an earlier run is resumed the same way as one left
//! behind by a failed attempt of this run.

pub mod progress;
pub mod retry;

pub use retry::RetryPolicy;

use crate::config::BackupSettings;
use crate::transport::{RequestOptions, Transport};
use crate::utils::{BackupError, Result};
use futures_util::TryStreamExt;
use progress::{bytes_to_mb, format_bytes, ProgressTracker};
use reqwest::header::RANGE;
use reqwest::{Method, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes_on_disk: u64,
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_backoff: Duration,
}

/// How the body of a response is written to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Server honoured the range; keep the prefix on disk
    Append,
    /// Full body; discard whatever is on disk
    Overwrite,
}

struct DownloadSession<'a> {
    url: &'a str,
    destination: &'a Path,
    service: &'a str,
    started: Instant,
    attempt_count: u32,
    bytes_on_disk: u64,
}

#[derive(Clone)]
pub struct Downloader {
    transport: Transport,
    retry: RetryPolicy,
    chunk_size: usize,
    log_threshold: u64,
}

impl Downloader {
    pub fn new(transport: Transport, settings: &BackupSettings) -> Self {
        Self {
            transport,
            retry: settings.retry,
            chunk_size: settings.chunk_size.max(1),
            log_threshold: settings.log_threshold,
        }
    }

    /// Stream `url` into `destination`, resuming and retrying on transient failures.
    ///
    /// HTTP error statuses and local write failures abort immediately. Transient
    /// network failures are retried with exponential backoff until the retry
    /// policy is exhausted, which yields [`BackupError::Download`].
    pub async fn download(&self, url: &str, destination: &Path, service: &str) -> Result<DownloadReport> {
        info!("Starting {} backup download from {}", service, url);
        info!("Saving to {}", destination.display());

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut session = DownloadSession {
            url,
            destination,
            service,
            started: Instant::now(),
            attempt_count: 0,
            bytes_on_disk: file_len(destination).await?,
        };
        if session.bytes_on_disk > 0 {
            info!(
                "Found existing partial file ({}), will attempt to resume",
                format_bytes(session.bytes_on_disk)
            );
        }

        let max_attempts = self.retry.max_attempts();
        let mut total_backoff = Duration::ZERO;

        loop {
            session.attempt_count += 1;
            session.bytes_on_disk = file_len(destination).await?;

            match self.attempt(&session).await {
                Ok(bytes_on_disk) => {
                    let elapsed = session.started.elapsed().as_secs_f64();
                    let total_mb = bytes_to_mb(bytes_on_disk);
                    let average = if elapsed > 0.0 { total_mb / elapsed } else { 0.0 };
                    info!(
                        "{} backup download completed: {:.2} MB in {:.1}s ({:.2} MB/s)",
                        service, total_mb, elapsed, average
                    );
                    return Ok(DownloadReport {
                        path: destination.to_path_buf(),
                        bytes_on_disk,
                        attempts: session.attempt_count,
                        total_backoff,
                    });
                }
                Err(e) if e.is_retriable() => {
                    let on_disk = file_len(destination).await?;
                    warn!(
                        "{} download attempt {}/{} failed: {}",
                        service, session.attempt_count, max_attempts, e
                    );

                    if session.attempt_count >= max_attempts {
                        error!(
                            "Max retries ({}) reached for {} backup download",
                            self.retry.max_retries, service
                        );
                        return Err(BackupError::Download {
                            service: service.to_string(),
                            attempts: session.attempt_count,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.retry.delay_for_retry(session.attempt_count - 1);
                    info!(
                        "Retrying in {:.1}s... Current progress: {}",
                        delay.as_secs_f64(),
                        format_bytes(on_disk)
                    );
                    tokio::time::sleep(delay).await;
                    total_backoff += delay;
                }
                Err(e) => {
                    error!("{} backup download failed: {}", service, e);
                    return Err(e);
                }
            }
        }
    }

    /// One request/stream cycle. Returns the size on disk when the body ended cleanly.
    async fn attempt(&self, session: &DownloadSession<'_>) -> Result<u64> {
        let offset = session.bytes_on_disk;
        let mut range_requested = offset > 0;

        let options = if range_requested {
            debug!("Resuming {} download from byte {}", session.service, offset);
            RequestOptions::new().header(RANGE, format!("bytes={}-", offset))
        } else {
            RequestOptions::new()
        };

        let response = match self.transport.request(Method::GET, session.url, options).await {
            Ok(response) => response,
            Err(e) if range_requested && e.status() == Some(StatusCode::RANGE_NOT_SATISFIABLE) => {
                warn!(
                    "Server rejected resume from byte {}; restarting {} download from the beginning",
                    offset, session.service
                );
                range_requested = false;
                self.transport.get(session.url).await?
            }
            Err(e) => return Err(e),
        };

        let (mode, start) = write_mode(range_requested, response.status(), offset);
        if range_requested && mode == WriteMode::Overwrite {
            info!(
                "Server ignored range request for {} download; starting from the beginning",
                session.service
            );
        }

        self.stream_to_file(response, session, mode, start).await
    }

    async fn stream_to_file(
        &self,
        response: Response,
        session: &DownloadSession<'_>,
        mode: WriteMode,
        start: u64,
    ) -> Result<u64> {
        let mut file = match mode {
            WriteMode::Append => OpenOptions::new().create(true).append(true).open(session.destination).await?,
            WriteMode::Overwrite => {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(session.destination)
                    .await?
            }
        };

        let body = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(body);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut tracker = ProgressTracker::new(session.started, start, self.log_threshold);
        let mut written = start;

        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    // Settle what was written so the next attempt sees the real size
                    file.flush().await?;
                    return Err(BackupError::Stream(e));
                }
            };

            file.write_all(&buffer[..read]).await?;
            written += read as u64;

            if let Some(report) = tracker.update(written) {
                info!(
                    "{} download progress: {:.2} MB (avg {:.2} MB/s, recent {:.2} MB/s)",
                    session.service,
                    report.megabytes(),
                    report.average_mbps,
                    report.recent_mbps
                );
            }
        }

        file.flush().await?;
        debug!(
            "{} attempt {} finished after {:.1}s",
            session.service,
            session.attempt_count,
            tracker.elapsed().as_secs_f64()
        );
        Ok(written)
    }
}

/// Only a 206 to a ranged request keeps the bytes already on disk.
fn write_mode(range_requested: bool, status: StatusCode, offset: u64) -> (WriteMode, u64) {
    if range_requested && status == StatusCode::PARTIAL_CONTENT {
        (WriteMode::Append, offset)
    } else {
        (WriteMode::Overwrite, 0)
    }
}

async fn file_len(path: &Path) -> Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{credentials, patterned_bytes, spawn_flaky_server, test_settings};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader_for(base_url: &str, settings: &BackupSettings) -> Downloader {
        let transport = Transport::new(base_url, credentials(), settings).unwrap();
        Downloader::new(transport, settings)
    }

    #[test]
    fn test_write_mode_selection() {
        assert_eq!(
            write_mode(true, StatusCode::PARTIAL_CONTENT, 40),
            (WriteMode::Append, 40)
        );
        assert_eq!(write_mode(true, StatusCode::OK, 40), (WriteMode::Overwrite, 0));
        assert_eq!(write_mode(false, StatusCode::OK, 0), (WriteMode::Overwrite, 0));
        assert_eq!(
            write_mode(false, StatusCode::PARTIAL_CONTENT, 0),
            (WriteMode::Overwrite, 0)
        );
    }

    #[tokio::test]
    async fn test_fresh_download_writes_whole_body() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let server = MockServer::start().await;
        let payload = patterned_bytes(50_000);

        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let destination = dir.path().join("nested").join("jira-backup.zip");
        let downloader = downloader_for(&server.uri(), &settings);
        let report = downloader
            .download(&format!("{}/export.zip", server.uri()), &destination, "Jira")
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.bytes_on_disk, payload.len() as u64);
        assert_eq!(report.total_backoff, Duration::ZERO);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_resume_appends_on_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let server = MockServer::start().await;
        let payload = patterned_bytes(1000);

        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .and(header("range", "bytes=400-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 400-999/1000")
                    .set_body_bytes(payload[400..].to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let destination = dir.path().join("confluence-backup.zip");
        std::fs::write(&destination, &payload[..400]).unwrap();

        let downloader = downloader_for(&server.uri(), &settings);
        let report = downloader
            .download(&format!("{}/export.zip", server.uri()), &destination, "Confluence")
            .await
            .unwrap();

        assert_eq!(report.bytes_on_disk, 1000);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_full_response_to_range_request_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let server = MockServer::start().await;
        let payload = patterned_bytes(1000);

        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let destination = dir.path().join("jira-backup.zip");
        std::fs::write(&destination, vec![0xFFu8; 400]).unwrap();

        let downloader = downloader_for(&server.uri(), &settings);
        let report = downloader
            .download(&format!("{}/export.zip", server.uri()), &destination, "Jira")
            .await
            .unwrap();

        assert_eq!(report.bytes_on_disk, 1000);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let server = MockServer::start().await;
        let payload = patterned_bytes(300);

        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .and(header("range", "bytes=500-"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let destination = dir.path().join("jira-backup.zip");
        std::fs::write(&destination, vec![0u8; 500]).unwrap();

        let downloader = downloader_for(&server.uri(), &settings);
        let report = downloader
            .download(&format!("{}/export.zip", server.uri()), &destination, "Jira")
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/export.zip"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let destination = dir.path().join("jira-backup.zip");
        let downloader = downloader_for(&server.uri(), &settings);
        let err = downloader
            .download(&format!("{}/export.zip", server.uri()), &destination, "Jira")
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_interrupted_stream_resumes_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let payload = patterned_bytes(64 * 1024);
        let server = spawn_flaky_server(payload.clone(), 3, 10 * 1024).await;

        let destination = dir.path().join("jira-backup.zip");
        let downloader = downloader_for(&server.base_url, &settings);
        let report = downloader
            .download(&server.url, &destination, "Jira")
            .await
            .unwrap();

        assert_eq!(report.attempts, 4);
        assert_eq!(report.total_backoff, Duration::from_millis(70));
        assert_eq!(report.bytes_on_disk, payload.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);

        let offsets = server.requested_offsets();
        assert_eq!(offsets.len(), 4);
        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(offsets.iter().any(|&offset| offset > 0));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let payload = patterned_bytes(64 * 1024);
        let server = spawn_flaky_server(payload, usize::MAX, 1024).await;

        let destination = dir.path().join("jira-backup.zip");
        let downloader = downloader_for(&server.base_url, &settings);
        let err = downloader
            .download(&server.url, &destination, "Jira")
            .await
            .unwrap_err();

        match err {
            BackupError::Download { service, attempts, source } => {
                assert_eq!(service, "Jira");
                assert_eq!(attempts, 6);
                assert!(source.is_retriable());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(server.requested_offsets().len(), 6);
    }
}
