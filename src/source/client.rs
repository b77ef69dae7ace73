//! Source RPC boundary
//!
//! The relay talks to the authorization platform through the
//! [`SourceClient`] trait: paginated audit search, per-session event
//! streams, and lock upserts. Tests substitute scripted implementations;
//! production uses [`HttpSourceClient`], which speaks JSON over mutually
//! authenticated HTTPS and reads session streams as NDJSON.

use crate::config::SourceConfig;
use crate::error::{RelayError, Result};
use crate::event::RawEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Certificate, Identity, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

const SESSION_STREAM_BUFFER: usize = 64;

/// Errors from source operations.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Transport-level failure: refused connection, reset, timeout, TLS,
    /// or a stream that broke mid-flight.
    #[error("Connection problem: {0}")]
    Connection(String),

    /// The source answered with a non-success status.
    #[error("Source responded with HTTP status {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, when readable
        message: String,
    },

    /// A record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether the affected loop should reconnect instead of failing.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Page order for audit search. The relay only ever reads ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchOrder {
    /// Oldest first
    Asc,
}

/// One paginated audit search call.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    /// Inclusive lower bound of the search window
    pub start_time: DateTime<Utc>,
    /// Exclusive upper bound of the search window
    pub end_time: DateTime<Utc>,
    /// Namespace to search
    pub namespace: String,
    /// Record kind allowlist; empty means all kinds
    pub types: Vec<String>,
    /// Page size
    pub limit: usize,
    /// Resume token of the page to fetch; empty for the first page
    pub cursor: String,
    /// Server-assigned ordering
    pub order: SearchOrder,
}

/// One page of audit records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPage {
    /// Records in server-assigned ascending order
    #[serde(default)]
    pub events: Vec<RawEvent>,
    /// Token of the next page; empty when this page is the last
    #[serde(default)]
    pub next_cursor: String,
}

/// A lock resource written back to the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSpec {
    /// Platform user to lock
    pub user: String,
    /// Login identity that kept failing
    pub login: String,
    /// Human-readable reason shown by the platform
    pub message: String,
    /// Expiry; `None` means the lock never expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// RPC boundary to the source platform.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch one page of the main audit stream.
    async fn search_events(
        &self,
        request: &SearchRequest,
    ) -> std::result::Result<EventPage, SourceError>;

    /// Open a session event stream starting at `start_index`.
    ///
    /// The channel closing without an error is the end-of-session signal.
    async fn stream_session_events(
        &self,
        session_id: &str,
        start_index: i64,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<RawEvent, SourceError>>, SourceError>;

    /// Create or refresh a lock resource.
    async fn upsert_lock(&self, lock: &LockSpec) -> std::result::Result<(), SourceError>;
}

/// JSON-over-HTTPS implementation of [`SourceClient`].
pub struct HttpSourceClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpSourceClient {
    /// Build the client from source configuration.
    ///
    /// Authentication is either a combined identity PEM or a CA+cert+key
    /// triple; `Config::validate` rejects configurations carrying both.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base = Url::parse(&config.addr)
            .map_err(|e| RelayError::Config(format!("invalid source addr: {e}")))?;

        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(identity_path) = &config.identity {
            let pem = std::fs::read(identity_path).map_err(|e| {
                RelayError::Config(format!(
                    "cannot read source identity {}: {e}",
                    identity_path.display()
                ))
            })?;
            let identity = Identity::from_pem(&pem)
                .map_err(|e| RelayError::Config(format!("invalid source identity: {e}")))?;
            builder = builder.identity(identity);
        } else if let (Some(ca), Some(cert), Some(key)) = (&config.ca, &config.cert, &config.key) {
            let mut pem = std::fs::read(cert).map_err(|e| {
                RelayError::Config(format!("cannot read source cert {}: {e}", cert.display()))
            })?;
            pem.extend(std::fs::read(key).map_err(|e| {
                RelayError::Config(format!("cannot read source key {}: {e}", key.display()))
            })?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| RelayError::Config(format!("invalid source client identity: {e}")))?;
            builder = builder.identity(identity);

            let ca_pem = std::fs::read(ca).map_err(|e| {
                RelayError::Config(format!("cannot read source CA {}: {e}", ca.display()))
            })?;
            let certificate = Certificate::from_pem(&ca_pem)
                .map_err(|e| RelayError::Config(format!("invalid source CA: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build source client: {e}")))?;

        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, SourceError> {
        self.base
            .join(path)
            .map_err(|e| SourceError::Decode(format!("invalid endpoint {path}: {e}")))
    }

    async fn check(
        response: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, SourceError> {
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SourceError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn search_events(
        &self,
        request: &SearchRequest,
    ) -> std::result::Result<EventPage, SourceError> {
        let url = self.endpoint("v1/audit/events/search")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let response = Self::check(response).await?;

        response
            .json::<EventPage>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    async fn stream_session_events(
        &self,
        session_id: &str,
        start_index: i64,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<RawEvent, SourceError>>, SourceError>
    {
        let mut url = self.endpoint(&format!("v1/sessions/{session_id}/events"))?;
        url.query_pairs_mut()
            .append_pair("start_index", &start_index.to_string());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let response = Self::check(response).await?;

        debug!(session_id = %session_id, start_index = start_index, "session stream opened");

        let (tx, rx) = mpsc::channel(SESSION_STREAM_BUFFER);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                    Err(e) => {
                        let _ = tx.send(Err(SourceError::Connection(e.to_string()))).await;
                        return;
                    }
                }

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RawEvent>(&line) {
                        Ok(record) => {
                            if tx.send(Ok(record)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(SourceError::Decode(e.to_string()))).await;
                            return;
                        }
                    }
                }
            }

            // Stream ended; a trailing line without a newline still counts.
            let tail = buffer.trim();
            if !tail.is_empty() {
                match serde_json::from_str::<RawEvent>(tail) {
                    Ok(record) => {
                        let _ = tx.send(Ok(record)).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(SourceError::Decode(e.to_string()))).await;
                    }
                }
            }
            // Dropping the sender closes the channel: end of session.
        });

        Ok(rx)
    }

    async fn upsert_lock(&self, lock: &LockSpec) -> std::result::Result<(), SourceError> {
        let url = self.endpoint("v1/locks")?;
        let response = self
            .http
            .put(url)
            .json(lock)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
