//! Shared store file I/O + HTTP fetch utilities for matchday.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use matchday_core::StoreEntry;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreLoadError {
    #[error("store file {path} does not exist")]
    Missing { path: PathBuf },
    #[error("reading store file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store file {path} holds a JSON {found}, expected an array")]
    NotAnArray { path: PathBuf, found: &'static str },
}

impl StoreLoadError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreLoadError::Missing { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("serializing store snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub entries: Vec<StoreEntry>,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub path: PathBuf,
    pub entries: usize,
    pub byte_size: usize,
    pub sha256: String,
}

/// The shared JSON array file that every producer reads and overwrites whole.
///
/// There is no locking: two producers persisting at the same time race and the
/// last rename wins.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<LoadedSnapshot, StoreLoadError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreLoadError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(source) => {
                return Err(StoreLoadError::Unreadable {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let value: JsonValue =
            serde_json::from_slice(&bytes).map_err(|source| StoreLoadError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let items = match value {
            JsonValue::Array(items) => items,
            other => {
                return Err(StoreLoadError::NotAnArray {
                    path: self.path.clone(),
                    found: json_kind(&other),
                })
            }
        };

        let entries = items
            .into_iter()
            .map(StoreEntry::from_json)
            .collect();

        Ok(LoadedSnapshot {
            entries,
            sha256: sha256_hex(&bytes),
        })
    }

    /// Overwrite the store through a sibling temp file and an atomic rename, so a
    /// failed write never leaves a truncated store behind.
    pub async fn persist(&self, entries: &[StoreEntry]) -> Result<PersistedSnapshot, StoreWriteError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let sha256 = sha256_hex(&bytes);

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StoreWriteError::Io {
                action: "creating store directory",
                path: parent.clone(),
                source,
            })?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(PersistedSnapshot {
                path: self.path.clone(),
                entries: entries.len(),
                byte_size: bytes.len(),
                sha256,
            }),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreWriteError::Io {
                    action: "renaming temp store file onto",
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), StoreWriteError> {
    let io_err = |action: &'static str| {
        let path = path.to_path_buf();
        move |source| StoreWriteError::Io {
            action,
            path,
            source,
        }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err("opening temp store file"))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp store file"))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp store file"))?;
    file.sync_all()
        .await
        .map_err(io_err("syncing temp store file"))?;
    Ok(())
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// True when the error's cause chain reports a TLS negotiation or certificate
/// problem. The top-level reqwest message is skipped since it embeds the URL.
pub fn is_tls_failure(err: &reqwest::Error) -> bool {
    cause_chain_mentions_tls(err.source())
}

pub fn cause_chain_mentions_tls(mut current: Option<&(dyn StdError + 'static)>) -> bool {
    const MARKERS: [&str; 4] = ["certificate", "tls", "ssl", "handshake"];
    while let Some(cause) = current {
        let text = cause.to_string().to_ascii_lowercase();
        if MARKERS.iter().any(|m| text.contains(m)) {
            return true;
        }
        current = cause.source();
    }
    false
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total tries, the first one included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// What to do when the TLS handshake with the upstream fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsFallbackPolicy {
    /// Give up on TLS failures.
    Strict,
    /// Make exactly one more request with certificate verification disabled.
    #[default]
    RelaxedOnce,
}

impl FromStr for TlsFallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "off" | "false" | "0" => Ok(Self::Strict),
            "relaxed-once" | "relaxed_once" | "relaxed" | "on" | "true" | "1" => {
                Ok(Self::RelaxedOnce)
            }
            other => Err(format!("unknown TLS fallback policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub tls_fallback: TlsFallbackPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            tls_fallback: TlsFallbackPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    relaxed_client: Option<reqwest::Client>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
    pub tls_fallback_used: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        tls_fallback_used: bool,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
        tls_fallback_used: bool,
    },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } | FetchError::HttpStatus { attempts, .. } => *attempts,
        }
    }

    pub fn tls_fallback_used(&self) -> bool {
        match self {
            FetchError::Request {
                tls_fallback_used, ..
            }
            | FetchError::HttpStatus {
                tls_fallback_used, ..
            } => *tls_fallback_used,
        }
    }
}

fn build_client(config: &HttpClientConfig, relaxed: bool) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if relaxed {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> reqwest::Result<Self> {
        let client = build_client(&config, false)?;
        let relaxed_client = match config.tls_fallback {
            TlsFallbackPolicy::Strict => None,
            TlsFallbackPolicy::RelaxedOnce => Some(build_client(&config, true)?),
        };

        Ok(Self {
            client,
            relaxed_client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts: attempt,
                                    tls_fallback_used: false,
                                })
                            }
                            // A timeout mid-body is a failed attempt like any other.
                            Err(err)
                                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                                    && attempt < max_attempts =>
                            {
                                let delay = self.backoff.delay_for_attempt(attempt - 1);
                                warn!(attempt, ?delay, error = %err, "reading upstream body failed, retrying");
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            Err(source) => {
                                return Err(FetchError::Request {
                                    url: final_url,
                                    attempts: attempt,
                                    tls_fallback_used: false,
                                    source,
                                })
                            }
                        }
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        warn!(status = status.as_u16(), attempt, ?delay, "transient upstream status, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        attempts: attempt,
                        tls_fallback_used: false,
                    });
                }
                Err(err) if is_tls_failure(&err) => {
                    let Some(relaxed) = &self.relaxed_client else {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            attempts: attempt,
                            tls_fallback_used: false,
                            source: err,
                        });
                    };
                    warn!(
                        attempt,
                        error = %err,
                        "TLS negotiation failed; retrying once without certificate verification"
                    );
                    return fetch_once_relaxed(relaxed, url, attempt + 1).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && attempt < max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        warn!(attempt, ?delay, error = %err, "upstream request failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt,
                        tls_fallback_used: false,
                        source: err,
                    });
                }
            }
        }
    }
}

async fn fetch_once_relaxed(
    client: &reqwest::Client,
    url: &str,
    attempts: usize,
) -> Result<FetchedResponse, FetchError> {
    let request_error = |url: String, source| FetchError::Request {
        url,
        attempts,
        tls_fallback_used: true,
        source,
    };

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|source| request_error(url.to_string(), source))?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            attempts,
            tls_fallback_used: true,
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(|source| request_error(final_url.clone(), source))?;
    Ok(FetchedResponse {
        status,
        final_url,
        body: body.to_vec(),
        attempts,
        tls_fallback_used: true,
    })
}
