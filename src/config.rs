//! Configuration management for the audit relay
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from a YAML file with CLI overrides applied on top.

use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main configuration structure for the relay
///
/// Holds everything the process needs: the sink endpoints and TLS
/// material, the source address and credentials, ingestion tuning, and
/// the auto-lock policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Downstream sink endpoints and TLS material
    pub sink: SinkConfig,

    /// Source platform address and credentials
    pub source: SourceConfig,

    /// Ingestion pipeline tuning
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Failed-login auto-lock policy
    #[serde(default)]
    pub lock: LockConfig,
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Endpoint receiving main-stream events
    pub url: String,

    /// Base endpoint for session events; each session posts to
    /// `<session_url>.<sid>.log`
    pub session_url: String,

    /// CA certificate used to verify the sink; system roots when absent
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Client certificate presented to the sink
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Private key for the client certificate
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Source configuration
///
/// Credentials are either a single combined identity PEM or a
/// CA+cert+key triple; supplying both is a configuration error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the source platform API
    pub addr: String,

    /// Combined identity PEM (key + certificate chain)
    #[serde(default)]
    pub identity: Option<PathBuf>,

    /// CA certificate used to verify the source
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Client certificate presented to the source
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Private key for the client certificate
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Storage directory for durable state; defaults to the user data dir
    #[serde(default)]
    pub storage: Option<PathBuf>,

    /// Audit search page size
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Namespace to search
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Record kind allowlist; empty means all kinds
    #[serde(default)]
    pub types: Vec<String>,

    /// Session event kinds dropped instead of delivered
    #[serde(default = "default_skip_session_types")]
    pub skip_session_types: Vec<String>,

    /// Ingestion window start (RFC3339); defaults to "now" on first run
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// Idle poll interval in seconds when the stream is drained
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Concurrent session replay workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Stop once the stream is drained instead of polling forever
    #[serde(default)]
    pub exit_on_last_event: bool,

    /// Skip deliveries; state still advances
    #[serde(default)]
    pub dry_run: bool,
}

fn default_batch() -> usize {
    20
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_skip_session_types() -> Vec<String> {
    vec!["print".to_string()]
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_concurrency() -> usize {
    5
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage: None,
            batch: default_batch(),
            namespace: default_namespace(),
            types: Vec::new(),
            skip_session_types: default_skip_session_types(),
            start_time: None,
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            exit_on_last_event: false,
            dry_run: false,
        }
    }
}

impl IngestConfig {
    /// The storage directory to open, falling back to the user data dir.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("com", "xbcsmith", "audit-relay")
            .ok_or_else(|| RelayError::Config("could not determine data directory".into()))?;
        Ok(dirs.data_dir().join("state"))
    }

    /// Idle poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Failed-login auto-lock policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Whether exhausted login budgets lock the account
    #[serde(default)]
    pub enabled: bool,

    /// Failed attempts tolerated per login and period
    #[serde(default = "default_failed_attempts")]
    pub failed_attempts_count: u32,

    /// Length of the counting window in seconds
    #[serde(default = "default_lock_period_secs")]
    pub period_secs: u64,

    /// Lock TTL in seconds; zero or negative means no expiry
    #[serde(default)]
    pub lock_for_secs: i64,
}

fn default_failed_attempts() -> u32 {
    3
}

fn default_lock_period_secs() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failed_attempts_count: default_failed_attempts(),
            period_secs: default_lock_period_secs(),
            lock_for_secs: 0,
        }
    }
}

impl LockConfig {
    /// Counting window as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Lock TTL as a [`Duration`]; zero means no expiry.
    pub fn lock_for(&self) -> Duration {
        if self.lock_for_secs > 0 {
            Duration::from_secs(self.lock_for_secs as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("cannot parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Validate the configuration, returning a human-readable error for
    /// the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.sink.url.is_empty() {
            return Err(RelayError::Config("sink url is required".into()).into());
        }
        Url::parse(&self.sink.url)
            .map_err(|e| RelayError::Config(format!("invalid sink url: {e}")))?;

        if self.sink.session_url.is_empty() {
            return Err(RelayError::Config("sink session-url is required".into()).into());
        }
        Url::parse(&self.sink.session_url)
            .map_err(|e| RelayError::Config(format!("invalid sink session-url: {e}")))?;

        if self.sink.cert.is_some() != self.sink.key.is_some() {
            return Err(RelayError::Config(
                "sink cert and key must be provided together".into(),
            )
            .into());
        }

        if self.source.addr.is_empty() {
            return Err(RelayError::Config("source addr is required".into()).into());
        }
        Url::parse(&self.source.addr)
            .map_err(|e| RelayError::Config(format!("invalid source addr: {e}")))?;

        let triple = [&self.source.ca, &self.source.cert, &self.source.key];
        let triple_count = triple.iter().filter(|p| p.is_some()).count();
        if self.source.identity.is_some() && triple_count > 0 {
            return Err(RelayError::Config(
                "source identity and ca/cert/key are mutually exclusive".into(),
            )
            .into());
        }
        if self.source.identity.is_none() && triple_count != 3 {
            return Err(RelayError::Config(
                "source credentials required: either identity or all of ca, cert, key".into(),
            )
            .into());
        }

        if self.ingest.batch == 0 {
            return Err(RelayError::Config("ingest batch must be at least 1".into()).into());
        }
        if self.ingest.concurrency == 0 {
            return Err(
                RelayError::Config("ingest concurrency must be at least 1".into()).into(),
            );
        }

        if self.lock.enabled {
            if self.lock.failed_attempts_count == 0 {
                return Err(RelayError::Config(
                    "lock failed-attempts-count must be at least 1".into(),
                )
                .into());
            }
            if self.lock.period_secs == 0 {
                return Err(
                    RelayError::Config("lock period must be at least 1 second".into()).into(),
                );
            }
        }

        Ok(())
    }
}
