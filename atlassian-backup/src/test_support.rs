//! Shared fixtures for unit tests.

use crate::config::{BackupSettings, Credentials};
use crate::download::RetryPolicy;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) fn credentials() -> Credentials {
    Credentials {
        username: "ops@example.com".to_string(),
        api_token: "api-token".to_string(),
    }
}

/// Settings with millisecond timings so polling and backoff stay fast.
pub(crate) fn test_settings(target: &Path) -> BackupSettings {
    BackupSettings {
        poll_interval: Duration::from_millis(10),
        max_poll_wait: Some(Duration::from_secs(10)),
        backup_target_directory: target.to_path_buf(),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        ..BackupSettings::default()
    }
}

/// Deterministic, non-repeating-looking payload.
pub(crate) fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Raw HTTP server that cuts the connection mid-body for the first few requests.
pub(crate) struct FlakyServer {
    pub base_url: String,
    pub url: String,
    offsets: Arc<Mutex<Vec<u64>>>,
}

impl FlakyServer {
    /// Range start of every request received so far, in arrival order.
    pub fn requested_offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

/// Serve `payload`, truncating the first `failing` responses after `cut` body bytes.
///
/// Truncated responses still announce the full `Content-Length`, so the client
/// sees the connection close before the body is complete.
pub(crate) async fn spawn_flaky_server(payload: Vec<u8>, failing: usize, cut: usize) -> FlakyServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let recorded = offsets.clone();

    tokio::spawn(async move {
        let mut served = 0usize;
        while let Ok((mut socket, _)) = listener.accept().await {
            let offset = read_range_offset(&mut socket).await.min(payload.len() as u64);
            recorded.lock().unwrap().push(offset);

            let body = &payload[offset as usize..];
            let head = if offset > 0 {
                format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                    body.len(),
                    offset,
                    payload.len() - 1,
                    payload.len()
                )
            } else {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
            };

            let _ = socket.write_all(head.as_bytes()).await;
            if served < failing {
                let sent = cut.min(body.len().saturating_sub(1));
                let _ = socket.write_all(&body[..sent]).await;
            } else {
                let _ = socket.write_all(body).await;
            }
            let _ = socket.flush().await;
            let _ = socket.shutdown().await;
            served = served.saturating_add(1);
        }
    });

    let base_url = format!("http://{}", addr);
    FlakyServer {
        url: format!("{}/export.zip", base_url),
        base_url,
        offsets,
    }
}

/// Read request headers and return the `Range: bytes=N-` start, or 0.
async fn read_range_offset(socket: &mut TcpStream) -> u64 {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    String::from_utf8_lossy(&request)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| {
            value
                .trim()
                .strip_prefix("bytes=")
                .and_then(|range| range.trim_end_matches('-').parse().ok())
        })
        .unwrap_or(0)
}
