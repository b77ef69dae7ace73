//! HTTPS sink delivery client
//!
//! One JSON POST per event. The client authenticates with a client
//! certificate when configured, optionally pins a private CA, and treats
//! exactly HTTP 200 as success. Retrying is the caller's concern (see
//! [`crate::backoff`]); the client reports each attempt's outcome.

use crate::config::SinkConfig;
use crate::error::{RelayError, Result};
use reqwest::{Certificate, Identity, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a single delivery attempt.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transport-level failure: refused connection, reset, timeout, TLS.
    #[error("Connection problem: {0}")]
    Connection(String),

    /// The sink answered with a status other than 200.
    #[error("Sink responded with HTTP status {0}")]
    Status(u16),
}

impl SinkError {
    /// Whether this failure is a connection problem (as opposed to the
    /// sink rejecting the request). Session workers re-run their stream on
    /// connection problems and drop the task on anything else.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// HTTP client for the downstream log sink.
#[derive(Clone, Debug)]
pub struct SinkClient {
    http: reqwest::Client,
}

impl SinkClient {
    /// Build the client from sink configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when only one of certificate and key
    /// is provided, or when any of the PEM files cannot be read or parsed.
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();

        match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert).map_err(|e| {
                    RelayError::Config(format!("cannot read sink cert {}: {e}", cert.display()))
                })?;
                pem.extend(std::fs::read(key).map_err(|e| {
                    RelayError::Config(format!("cannot read sink key {}: {e}", key.display()))
                })?);
                let identity = Identity::from_pem(&pem).map_err(|e| {
                    RelayError::Config(format!("invalid sink client identity: {e}"))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(RelayError::Config(
                    "sink cert and key must be provided together".to_string(),
                )
                .into());
            }
        }

        if let Some(ca) = &config.ca {
            let pem = std::fs::read(ca).map_err(|e| {
                RelayError::Config(format!("cannot read sink CA {}: {e}", ca.display()))
            })?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|e| RelayError::Config(format!("invalid sink CA: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build sink client: {e}")))?;

        Ok(Self { http })
    }

    /// POST `body` as JSON to `url`.
    ///
    /// Success iff the sink answers 200. Other statuses and transport
    /// failures are returned for the caller's retry policy to judge.
    pub async fn send(&self, url: &str, body: &Value) -> std::result::Result<(), SinkError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(SinkError::Status(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn plain_config() -> SinkConfig {
        SinkConfig {
            url: "http://127.0.0.1:1/events".to_string(),
            session_url: "http://127.0.0.1:1/session".to_string(),
            ca: None,
            cert: None,
            key: None,
        }
    }

    #[test]
    fn test_new_without_tls_material() {
        assert!(SinkClient::new(&plain_config()).is_ok());
    }

    #[test]
    fn test_new_rejects_cert_without_key() {
        let config = SinkConfig {
            cert: Some(PathBuf::from("/tmp/client.crt")),
            ..plain_config()
        };
        let err = SinkClient::new(&config).unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn test_new_rejects_key_without_cert() {
        let config = SinkConfig {
            key: Some(PathBuf::from("/tmp/client.key")),
            ..plain_config()
        };
        assert!(SinkClient::new(&config).is_err());
    }

    #[test]
    fn test_new_rejects_unreadable_ca() {
        let config = SinkConfig {
            ca: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..plain_config()
        };
        let err = SinkClient::new(&config).unwrap_err();
        assert!(err.to_string().contains("cannot read sink CA"));
    }

    #[test]
    fn test_error_classification() {
        assert!(SinkError::Connection("reset".to_string()).is_connection());
        assert!(!SinkError::Status(503).is_connection());
    }

    #[tokio::test]
    async fn test_send_to_unreachable_host_is_connection_problem() {
        let client = SinkClient::new(&plain_config()).unwrap();
        let err = client
            .send("http://127.0.0.1:1/events", &serde_json::json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }
}
