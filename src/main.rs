//! Audit relay - durable audit event forwarder
//!
#![doc = "Main entry point for the audit relay process."]

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audit_relay::cli::{Cli, Commands};
use audit_relay::error::RelayError;
use audit_relay::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.debug, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let mut config = Config::load(config_path)?;

    match cli.command {
        Commands::Start {
            storage,
            start_time,
            batch,
            namespace,
            concurrency,
            dry_run,
            exit_on_last_event,
        } => {
            if let Some(storage) = storage {
                config.ingest.storage = Some(storage);
            }
            if let Some(start_time) = &start_time {
                let parsed = DateTime::parse_from_rfc3339(start_time).map_err(|e| {
                    RelayError::Config(format!("invalid --start-time {start_time}: {e}"))
                })?;
                config.ingest.start_time = Some(parsed.with_timezone(&Utc));
            }
            if let Some(batch) = batch {
                config.ingest.batch = batch;
            }
            if let Some(namespace) = namespace {
                config.ingest.namespace = namespace;
            }
            if let Some(concurrency) = concurrency {
                config.ingest.concurrency = concurrency;
            }
            if dry_run {
                config.ingest.dry_run = true;
            }
            if exit_on_last_event {
                config.ingest.exit_on_last_event = true;
            }

            // Validate configuration
            config.validate()?;

            tracing::info!("starting audit relay");
            if let Err(error) = App::run(config).await {
                tracing::error!(error = %error, "relay terminated");
                return Err(error);
            }
            tracing::info!("audit relay stopped");
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing(debug: bool, json_logs: bool) {
    let default_filter = if debug {
        "audit_relay=debug"
    } else {
        "audit_relay=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);

    if json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
