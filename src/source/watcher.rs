//! Main-stream watcher
//!
//! Pulls the audit stream page by page, resumes strictly after the last
//! delivered event id, and emits normalized events over a bounded channel.
//! The producer closes both channels on exit; at most one error is drained
//! into the error channel first. Consumers detect end-of-stream by the
//! event channel closing.

use crate::event::{normalize, record_id, Event};
use crate::source::client::{LockSpec, SearchOrder, SearchRequest, SourceClient, SourceError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SESSION_CHANNEL_BUFFER: usize = 64;

/// Reason shown by the platform on auto-created locks.
pub const LOCK_MESSAGE: &str = "User is locked due to too many failed login attempts";

/// Watcher tuning, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Lower bound of the ingestion window (immutable per storage dir)
    pub start_time: DateTime<Utc>,
    /// Namespace to search
    pub namespace: String,
    /// Record kind allowlist; empty means all kinds
    pub types: Vec<String>,
    /// Page size for audit search
    pub batch_size: usize,
    /// Sleep between polls when the stream is drained
    pub poll_interval: Duration,
    /// Stop producing once the stream is drained instead of polling
    pub exit_on_last_event: bool,
}

/// Where to resume the main stream: the page token and the last event id
/// that was already delivered (skipped on the re-fetched page).
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    /// Page token persisted with the last delivery
    pub cursor: String,
    /// Id of the last delivered event; empty on a fresh start
    pub id: String,
}

/// Paginated puller over the source's audit stream.
pub struct EventWatcher {
    client: Arc<dyn SourceClient>,
    config: WatcherConfig,
    cancel: CancellationToken,
}

impl EventWatcher {
    /// Create a watcher over `client`.
    pub fn new(
        client: Arc<dyn SourceClient>,
        config: WatcherConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            cancel,
        }
    }

    /// Open the main-stream pipeline from `resume`.
    ///
    /// Returns the bounded event channel and a one-slot error channel. The
    /// producer task owns both senders and drops them on exit.
    pub fn events(
        &self,
        resume: ResumePoint,
    ) -> (mpsc::Receiver<Event>, mpsc::Receiver<SourceError>) {
        let (tx, rx) = mpsc::channel(self.config.batch_size.max(1));
        let (err_tx, err_rx) = mpsc::channel(1);

        let producer = Producer {
            client: self.client.clone(),
            config: self.config.clone(),
            cursor: resume.cursor,
            next_cursor: String::new(),
            batch: Vec::new(),
            pos: 0,
            id: resume.id,
            tx,
            err_tx,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(producer.run());

        (rx, err_rx)
    }

    /// Open one session's event stream at `start_index`, normalized.
    ///
    /// The channel closing without an error is the end-of-session signal.
    pub async fn stream_session_events(
        &self,
        session_id: &str,
        start_index: i64,
    ) -> Result<mpsc::Receiver<Result<Event, SourceError>>, SourceError> {
        let mut records = self
            .client
            .stream_session_events(session_id, start_index)
            .await?;

        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = records.recv() => match next {
                        None => return,
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        Some(Ok(record)) => {
                            // Session events carry no page cursor.
                            let result = normalize(&record, "")
                                .map_err(|e| SourceError::Decode(e.to_string()));
                            let failed = result.is_err();
                            if tx.send(result).await.is_err() || failed {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Write a lock resource for `user`/`login`.
    ///
    /// A non-positive `lock_for` produces a lock without expiry.
    pub async fn upsert_lock(
        &self,
        user: &str,
        login: &str,
        lock_for: Duration,
    ) -> Result<(), SourceError> {
        let expires = if lock_for > Duration::ZERO {
            Some(Utc::now() + chrono::Duration::from_std(lock_for).unwrap_or_default())
        } else {
            None
        };
        let lock = LockSpec {
            user: user.to_string(),
            login: login.to_string(),
            message: LOCK_MESSAGE.to_string(),
            expires,
        };
        self.client.upsert_lock(&lock).await
    }
}

/// Producer task state for one `events()` pipeline.
struct Producer {
    client: Arc<dyn SourceClient>,
    config: WatcherConfig,
    cursor: String,
    next_cursor: String,
    batch: Vec<crate::event::RawEvent>,
    pos: usize,
    id: String,
    tx: mpsc::Sender<Event>,
    err_tx: mpsc::Sender<SourceError>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(mut self) {
        loop {
            if self.batch.is_empty() {
                if let Err(e) = self.fetch().await {
                    return self.fail(e).await;
                }
                if self.batch.is_empty() {
                    if self.config.exit_on_last_event {
                        debug!("stream drained, exiting");
                        return;
                    }
                    if !self.idle_sleep().await {
                        return;
                    }
                    continue;
                }
            }

            if self.pos >= self.batch.len() {
                if !self.flip_page() {
                    // No next page: re-poll the current one, skipping past
                    // the last delivered id, until it grows.
                    if let Err(e) = self.fetch().await {
                        return self.fail(e).await;
                    }
                    if self.pos >= self.batch.len() {
                        if self.config.exit_on_last_event {
                            debug!("stream drained, exiting");
                            return;
                        }
                        if !self.idle_sleep().await {
                            return;
                        }
                    }
                }
                continue;
            }

            let record = self.batch[self.pos].clone();
            self.pos += 1;

            let event = match normalize(&record, &self.cursor) {
                Ok(event) => event,
                Err(e) => return self.fail(SourceError::Decode(e.to_string())).await,
            };
            self.id = event.id.clone();

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.tx.send(event) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Fetch the page at `cursor` and position strictly after the last
    /// delivered id when it appears on the page.
    async fn fetch(&mut self) -> Result<(), SourceError> {
        let request = SearchRequest {
            start_time: self.config.start_time,
            end_time: Utc::now(),
            namespace: self.config.namespace.clone(),
            types: self.config.types.clone(),
            limit: self.config.batch_size,
            cursor: self.cursor.clone(),
            order: SearchOrder::Asc,
        };

        let page = self.client.search_events(&request).await?;
        debug!(
            cursor = %self.cursor,
            next_cursor = %page.next_cursor,
            events = page.events.len(),
            "fetched audit page"
        );

        self.next_cursor = page.next_cursor;
        self.batch = page.events;
        self.pos = 0;

        if !self.id.is_empty() {
            for (i, record) in self.batch.iter().enumerate() {
                let candidate =
                    record_id(record).map_err(|e| SourceError::Decode(e.to_string()))?;
                if candidate == self.id {
                    self.pos = i + 1;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Advance to the next page token, if the source announced one.
    fn flip_page(&mut self) -> bool {
        if self.next_cursor.is_empty() {
            return false;
        }
        self.cursor = std::mem::take(&mut self.next_cursor);
        self.batch.clear();
        self.pos = 0;
        true
    }

    /// Returns false when cancelled during the idle wait.
    async fn idle_sleep(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }

    async fn fail(self, error: SourceError) {
        let _ = self.err_tx.send(error).await;
    }
}
