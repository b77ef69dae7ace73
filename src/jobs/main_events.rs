//! Main events job
//!
//! Consumes the watcher's main-stream channel. Every event is delivered
//! to the sink under the retry policy, then the `{id, cursor}` checkpoint
//! is persisted — in that order, so the store never acknowledges an
//! undelivered event. Session terminators are handed to the session job
//! after their own delivery is durable; failed logins feed the rate
//! limiter and may trigger an account lock on the source.

use crate::backoff::{retry, RetryOutcome, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::event::{Event, FailedLoginData};
use crate::jobs::SessionTask;
use crate::limiter::LoginRateLimiter;
use crate::sink::SinkClient;
use crate::source::watcher::{EventWatcher, ResumePoint};
use crate::state::StateStore;
use metrics::increment_counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main job tuning.
#[derive(Debug, Clone)]
pub struct MainJobConfig {
    /// Sink endpoint for main-stream events
    pub sink_url: String,
    /// Skip deliveries (state still advances)
    pub dry_run: bool,
    /// Whether exhausted login budgets lock the account
    pub lock_enabled: bool,
    /// Lock TTL; non-positive means the lock never expires
    pub lock_for: Duration,
    /// Per-delivery retry policy
    pub retry: RetryPolicy,
    /// Pause before reopening the stream after a connection problem
    pub reconnect_delay: Duration,
}

/// The job driving the main audit stream.
pub struct MainEventsJob {
    watcher: Arc<EventWatcher>,
    sink: Arc<SinkClient>,
    state: Arc<dyn StateStore>,
    limiter: LoginRateLimiter,
    session_tx: mpsc::Sender<SessionTask>,
    config: MainJobConfig,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
}

impl MainEventsJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watcher: Arc<EventWatcher>,
        sink: Arc<SinkClient>,
        state: Arc<dyn StateStore>,
        limiter: LoginRateLimiter,
        session_tx: mpsc::Sender<SessionTask>,
        config: MainJobConfig,
        cancel: CancellationToken,
        ready: watch::Sender<bool>,
    ) -> Self {
        Self {
            watcher,
            sink,
            state,
            limiter,
            session_tx,
            config,
            cancel,
            ready,
        }
    }

    /// Run until the stream ends, the process is cancelled, or a fatal
    /// error occurs. Connection problems reopen the stream from the
    /// persisted checkpoint instead of terminating.
    ///
    /// Dropping `self` on return closes the session task queue, which
    /// lets the session job drain and finish.
    pub async fn run(self) -> Result<()> {
        loop {
            let resume = ResumePoint {
                cursor: self.state.cursor()?.unwrap_or_default(),
                id: self.state.last_id()?.unwrap_or_default(),
            };
            info!(
                cursor = %resume.cursor,
                id = %resume.id,
                "opening main event stream"
            );
            let (mut events, mut errors) = self.watcher.events(resume);
            self.ready.send_replace(true);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    next = events.recv() => match next {
                        Some(event) => self.handle_event(event).await?,
                        None => match errors.recv().await {
                            Some(error) if error.is_connection() => {
                                warn!(error = %error, "source connection problem, reconnecting");
                                break;
                            }
                            Some(error) => {
                                return Err(RelayError::Source(error.to_string()).into());
                            }
                            None => {
                                info!("main event stream ended");
                                return Ok(());
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        debug!(id = %event.id, kind = %event.kind, "main stream event");

        if !self.config.dry_run {
            let outcome = retry(self.config.retry, &self.cancel, || {
                self.sink.send(&self.config.sink_url, &event.payload)
            })
            .await
            .map_err(|e| RelayError::Delivery(format!("event {}: {e}", event.id)))?;
            if outcome == RetryOutcome::Cancelled {
                return Ok(());
            }
            increment_counter!("audit_events_forwarded_total");
        }

        self.state.save_checkpoint(&event.id, &event.cursor)?;

        if event.is_session_end {
            // Persist the zero checkpoint before handoff so a crash between
            // the two still resumes this session on restart.
            self.state.set_session_index(&event.session_id, 0)?;
            let task = SessionTask {
                id: event.session_id.clone(),
                index: 0,
            };
            debug!(session_id = %event.session_id, "session ended, queueing replay");
            if self.session_tx.send(task).await.is_err() {
                return Err(
                    RelayError::Internal("session task queue closed".to_string()).into(),
                );
            }
        }

        if let Some(failed) = &event.failed_login {
            self.observe_failed_login(failed).await;
        }

        Ok(())
    }

    async fn observe_failed_login(&self, failed: &FailedLoginData) {
        if !self.limiter.register_failure(&failed.login) {
            return;
        }
        if !self.config.lock_enabled || self.config.dry_run {
            debug!(login = %failed.login, "failed-login budget exhausted, locking disabled");
            return;
        }
        match self
            .watcher
            .upsert_lock(&failed.user, &failed.login, self.config.lock_for)
            .await
        {
            Ok(()) => {
                warn!(
                    user = %failed.user,
                    login = %failed.login,
                    "account locked after repeated failed logins"
                );
                increment_counter!("account_locks_total");
            }
            Err(error) => {
                warn!(error = %error, login = %failed.login, "lock upsert failed");
            }
        }
    }
}
