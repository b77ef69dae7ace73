//! Audit relay library
//!
//! This library provides the core functionality for the audit relay: a
//! durable, restartable, at-least-once pipeline that pulls audit events
//! from a source platform and pushes them to an HTTPS log sink, replaying
//! recorded sessions as they end.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `source`: the source RPC boundary and the paginated main-stream watcher
//! - `event`: the normalized event model and classification rules
//! - `jobs`: the main events job and the session replay job
//! - `sink`: the HTTPS delivery client
//! - `state`: durable cursor and checkpoint storage
//! - `backoff`: decorrelated-jitter retry policies
//! - `limiter`: the failed-login token bucket
//! - `app`: the process supervisor tying everything together
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use audit_relay::{App, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml")?;
//!     config.validate()?;
//!     App::run(config).await
//! }
//! ```

pub mod app;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod jobs;
pub mod limiter;
pub mod sink;
pub mod source;
pub mod state;

// Re-export commonly used types
pub use app::App;
pub use config::Config;
pub use error::{RelayError, Result};
pub use event::{Event, FailedLoginData, RawEvent};
pub use jobs::SessionTask;
