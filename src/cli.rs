//! Command-line interface definition for the audit relay
//!
//! This module defines the CLI structure using clap's derive API. The
//! `start` command runs the forwarder; its flags override the
//! corresponding configuration file entries.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Audit relay - durable at-least-once audit event forwarder
///
/// Continuously pulls audit events from the source platform and pushes
/// them to an HTTPS log sink, replaying recorded sessions as they end.
#[derive(Parser, Debug, Clone)]
#[command(name = "audit-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml", env = "AUDIT_RELAY_CONFIG")]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the forwarder
    Start {
        /// Storage directory for durable state
        #[arg(long)]
        storage: Option<PathBuf>,

        /// Ingestion window start, RFC3339 (defaults to "now" on first run)
        #[arg(long)]
        start_time: Option<String>,

        /// Audit search page size
        #[arg(long)]
        batch: Option<usize>,

        /// Namespace to search
        #[arg(long)]
        namespace: Option<String>,

        /// Concurrent session replay workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip deliveries; state still advances
        #[arg(long)]
        dry_run: bool,

        /// Stop once the stream is drained instead of polling forever
        #[arg(long)]
        exit_on_last_event: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            debug: false,
            json_logs: false,
            command: Commands::Start {
                storage: None,
                start_time: None,
                batch: None,
                namespace: None,
                concurrency: None,
                dry_run: false,
                exit_on_last_event: false,
            },
        }
    }
}
