//! Authenticated HTTP access to one Atlassian Cloud instance.

use crate::config::{BackupSettings, Credentials};
use crate::utils::{BackupError, Result};
use reqwest::header::HeaderName;
use reqwest::{Client, Method, Response};
use tracing::debug;

/// Error bodies longer than this are cut before they end up in logs.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Extra request parts on top of method and URL.
#[derive(Debug, Default, Clone)]
pub struct RequestOptions {
    headers: Vec<(HeaderName, String)>,
    json: Option<serde_json::Value>,
    params: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// Basic-auth client bound to one instance base URL.
///
/// Every request carries the credentials, and any response with a status of
/// 400 or above is turned into [`BackupError::Http`].
#[derive(Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl Transport {
    pub fn new(base_url: &str, credentials: Credentials, settings: &BackupSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .user_agent(concat!("atlassian-backup/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path relative to the instance base.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, RequestOptions::default()).await
    }

    /// Send one authenticated request.
    pub async fn request(&self, method: Method, url: &str, options: RequestOptions) -> Result<Response> {
        debug!("{} {}", method, url);

        let mut builder = self
            .client
            .request(method, url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.api_token));
        for (name, value) in options.headers {
            builder = builder.header(name, value);
        }
        if !options.params.is_empty() {
            builder = builder.query(&options.params);
        }
        if let Some(body) = options.json {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackupError::Http {
                status,
                url: url.to_string(),
                body: truncate(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        Ok(response)
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
