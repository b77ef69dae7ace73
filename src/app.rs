//! Process supervisor
//!
//! Builds every collaborator from configuration, spawns the two jobs as
//! critical siblings, wires Ctrl-C into the cancellation token, and joins
//! their results. A fatal failure in either job cancels the other; a
//! clean end of the main stream lets the session job drain its in-flight
//! replays before the process exits.

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::jobs::{MainEventsJob, MainJobConfig, SessionEventsJob, SessionJobConfig};
use crate::limiter::LoginRateLimiter;
use crate::sink::SinkClient;
use crate::source::client::{HttpSourceClient, SourceClient};
use crate::source::watcher::{EventWatcher, WatcherConfig};
use crate::state::{SledStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SESSION_QUEUE_DEPTH: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The assembled forwarder process.
pub struct App;

impl App {
    /// Run the pipeline until the stream ends (`exit-on-last-event`), the
    /// process is signalled, or a fatal error occurs.
    pub async fn run(config: Config) -> Result<()> {
        let storage_dir = config.ingest.storage_dir()?;
        let state = SledStateStore::open(&storage_dir, config.ingest.start_time)?;
        let start_time = state.start_time();
        info!(
            storage = %storage_dir.display(),
            start_time = %start_time,
            "storage opened"
        );
        let state: Arc<dyn StateStore> = Arc::new(state);

        let sink = Arc::new(SinkClient::new(&config.sink)?);
        let source: Arc<dyn SourceClient> = Arc::new(HttpSourceClient::new(&config.source)?);

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    cancel.cancel();
                }
            });
        }

        let watcher = Arc::new(EventWatcher::new(
            source,
            WatcherConfig {
                start_time,
                namespace: config.ingest.namespace.clone(),
                types: config.ingest.types.clone(),
                batch_size: config.ingest.batch,
                poll_interval: config.ingest.poll_interval(),
                exit_on_last_event: config.ingest.exit_on_last_event,
            },
            cancel.clone(),
        ));

        let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (main_ready_tx, main_ready_rx) = watch::channel(false);
        let (session_ready_tx, session_ready_rx) = watch::channel(false);

        let main_job = MainEventsJob::new(
            watcher.clone(),
            sink.clone(),
            state.clone(),
            LoginRateLimiter::new(config.lock.failed_attempts_count, config.lock.period()),
            session_tx,
            MainJobConfig {
                sink_url: config.sink.url.clone(),
                dry_run: config.ingest.dry_run,
                lock_enabled: config.lock.enabled,
                lock_for: config.lock.lock_for(),
                retry: RetryPolicy::sink(),
                reconnect_delay: RECONNECT_DELAY,
            },
            cancel.clone(),
            main_ready_tx,
        );

        let session_job = SessionEventsJob::new(
            watcher,
            sink,
            state,
            session_rx,
            SessionJobConfig {
                session_url: config.sink.session_url.clone(),
                skip_kinds: config.ingest.skip_session_types.iter().cloned().collect(),
                concurrency: config.ingest.concurrency,
                dry_run: config.ingest.dry_run,
                retry: RetryPolicy::session(),
                delivery_retry: RetryPolicy::sink(),
            },
            cancel.clone(),
            session_ready_tx,
        );

        // Process readiness is the conjunction of both jobs' readiness.
        tokio::spawn(async move {
            if wait_ready(main_ready_rx).await && wait_ready(session_ready_rx).await {
                info!("pipeline ready");
            }
        });

        let mut main_handle = tokio::spawn(main_job.run());
        let mut session_handle = tokio::spawn(session_job.run());

        let (main_result, session_result) = tokio::select! {
            main_result = &mut main_handle => {
                if !matches!(&main_result, Ok(Ok(()))) {
                    // Fatal main-stream failure: stop session workers too.
                    cancel.cancel();
                }
                // The main job dropped the task queue sender; the session
                // job drains its queue and in-flight workers, then ends.
                let session_result = session_handle.await;
                (main_result, session_result)
            }
            session_result = &mut session_handle => {
                if !matches!(&session_result, Ok(Ok(()))) {
                    cancel.cancel();
                }
                let main_result = main_handle.await;
                (main_result, session_result)
            }
        };
        cancel.cancel();

        let main_err = flatten("main events job", main_result).err();
        let session_err = flatten("session events job", session_result).err();

        match (main_err, session_err) {
            (None, None) => Ok(()),
            (Some(error), None) | (None, Some(error)) => Err(error),
            (Some(main), Some(session)) => {
                Err(main.context(format!("session events job also failed: {session}")))
            }
        }
    }
}

async fn wait_ready(mut ready: watch::Receiver<bool>) -> bool {
    loop {
        if *ready.borrow() {
            return true;
        }
        if ready.changed().await.is_err() {
            return false;
        }
    }
}

fn flatten(job: &str, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(|e| e.context(format!("{job} failed"))),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(RelayError::Internal(format!("{job} panicked: {e}")).into()),
    }
}
