//! Session events job
//!
//! Owns the queue of session replay tasks and a bounded worker pool. Each
//! worker streams one completed session from its checkpointed index,
//! delivers every non-skipped event to the per-session sink endpoint, and
//! erases the session's state entry on clean end-of-stream. Failures stay
//! confined to their task: connection problems re-run the stream under
//! backoff, anything else drops the task with a warning. Only storage
//! errors escalate to the process.

use crate::backoff::{retry, Backoff, RetryOutcome, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::jobs::SessionTask;
use crate::sink::SinkClient;
use crate::source::client::SourceError;
use crate::source::watcher::EventWatcher;
use crate::state::StateStore;
use anyhow::anyhow;
use metrics::increment_counter;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

/// Session job tuning.
#[derive(Debug, Clone)]
pub struct SessionJobConfig {
    /// Base sink endpoint; each session posts to `<base>.<sid>.log`
    pub session_url: String,
    /// Event kinds dropped instead of delivered
    pub skip_kinds: HashSet<String>,
    /// Maximum concurrently ingesting sessions
    pub concurrency: usize,
    /// Skip deliveries (state still advances)
    pub dry_run: bool,
    /// Whole-stream retry policy (re-runs from the checkpointed index)
    pub retry: RetryPolicy,
    /// Per-delivery retry policy
    pub delivery_retry: RetryPolicy,
}

/// The job replaying completed sessions.
pub struct SessionEventsJob {
    watcher: Arc<EventWatcher>,
    sink: Arc<SinkClient>,
    state: Arc<dyn StateStore>,
    tasks: mpsc::Receiver<SessionTask>,
    config: SessionJobConfig,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
}

impl SessionEventsJob {
    pub fn new(
        watcher: Arc<EventWatcher>,
        sink: Arc<SinkClient>,
        state: Arc<dyn StateStore>,
        tasks: mpsc::Receiver<SessionTask>,
        config: SessionJobConfig,
        cancel: CancellationToken,
        ready: watch::Sender<bool>,
    ) -> Self {
        Self {
            watcher,
            sink,
            state,
            tasks,
            config,
            cancel,
            ready,
        }
    }

    /// Run until the task queue closes or the process is cancelled.
    ///
    /// In-flight workers are always drained before returning, so an
    /// `exit-on-last-event` shutdown waits for session replays to finish.
    pub async fn run(mut self) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers: JoinSet<Result<()>> = JoinSet::new();

        // Sessions that were in flight when the previous run stopped.
        let mut restored = self.state.sessions()?;
        restored.sort();
        for (id, index) in restored {
            info!(session_id = %id, index = index, "restoring session replay");
            if !self
                .dispatch(&mut workers, &semaphore, SessionTask { id, index })
                .await?
            {
                break;
            }
        }

        self.ready.send_replace(true);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.tasks.recv() => match next {
                    Some(task) => {
                        if !self.dispatch(&mut workers, &semaphore, task).await? {
                            break;
                        }
                    }
                    None => break,
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    Self::check_worker(joined)?;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            Self::check_worker(joined)?;
        }
        Ok(())
    }

    fn check_worker(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(RelayError::Internal(format!("session worker panicked: {e}")).into()),
        }
    }

    /// Acquire a worker slot and spawn the task. Returns false when the
    /// job was cancelled while waiting for a slot.
    async fn dispatch(
        &self,
        workers: &mut JoinSet<Result<()>>,
        semaphore: &Arc<Semaphore>,
        task: SessionTask,
    ) -> Result<bool> {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(false),
            permit = semaphore.clone().acquire_owned() => permit
                .map_err(|e| RelayError::Internal(format!("worker semaphore closed: {e}")))?,
        };

        let worker = SessionWorker {
            watcher: self.watcher.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };
        let span = tracing::info_span!("session", session_id = %task.id);
        workers.spawn(
            async move {
                let result = worker.run(task).await;
                drop(permit);
                result
            }
            .instrument(span),
        );
        Ok(true)
    }
}

enum IngestOutcome {
    Completed,
    Cancelled,
}

/// Why one streaming pass over a session failed.
enum PassError {
    /// Connection-class problem; re-run from the checkpointed index
    Retryable(anyhow::Error),
    /// Terminal for this task only; logged and dropped
    Dropped(anyhow::Error),
    /// Terminal for the process (storage)
    Fatal(anyhow::Error),
}

fn classify_source(error: SourceError) -> PassError {
    if error.is_connection() {
        PassError::Retryable(anyhow!(error))
    } else {
        PassError::Dropped(anyhow!(error))
    }
}

struct SessionWorker {
    watcher: Arc<EventWatcher>,
    sink: Arc<SinkClient>,
    state: Arc<dyn StateStore>,
    config: SessionJobConfig,
    cancel: CancellationToken,
}

impl SessionWorker {
    async fn run(self, task: SessionTask) -> Result<()> {
        let mut index = task.index;
        let mut backoff = Backoff::new(self.config.retry);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.ingest(&task.id, &mut index).await {
                Ok(IngestOutcome::Completed) => {
                    self.state.remove_session(&task.id)?;
                    increment_counter!("sessions_completed_total");
                    info!("session replay complete");
                    return Ok(());
                }
                Ok(IngestOutcome::Cancelled) => return Ok(()),
                Err(PassError::Fatal(error)) => return Err(error),
                Err(PassError::Dropped(error)) => {
                    warn!(error = %error, "dropping session replay");
                    increment_counter!("sessions_dropped_total");
                    return Ok(());
                }
                Err(PassError::Retryable(error)) => {
                    if attempt >= self.config.retry.max_attempts {
                        warn!(
                            error = %error,
                            attempts = attempt,
                            "session replay retries exhausted, dropping"
                        );
                        increment_counter!("sessions_dropped_total");
                        return Ok(());
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "session replay failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One pass over the session stream from the current index.
    async fn ingest(
        &self,
        session_id: &str,
        index: &mut i64,
    ) -> std::result::Result<IngestOutcome, PassError> {
        let mut events = self
            .watcher
            .stream_session_events(session_id, *index)
            .await
            .map_err(classify_source)?;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(IngestOutcome::Cancelled),
                next = events.recv() => next,
            };

            match next {
                None => return Ok(IngestOutcome::Completed),
                Some(Err(error)) => return Err(classify_source(error)),
                Some(Ok(event)) => {
                    if self.config.skip_kinds.contains(&event.kind) {
                        continue;
                    }

                    if !self.config.dry_run {
                        let url = format!("{}.{}.log", self.config.session_url, session_id);
                        let outcome = retry(self.config.delivery_retry, &self.cancel, || {
                            self.sink.send(&url, &event.payload)
                        })
                        .await
                        .map_err(|e| {
                            if e.is_connection() {
                                PassError::Retryable(anyhow!("delivery: {e}"))
                            } else {
                                PassError::Dropped(anyhow!("delivery: {e}"))
                            }
                        })?;
                        if outcome == RetryOutcome::Cancelled {
                            return Ok(IngestOutcome::Cancelled);
                        }
                        increment_counter!("session_events_forwarded_total");
                    }

                    self.state
                        .set_session_index(session_id, event.index)
                        .map_err(PassError::Fatal)?;
                    *index = event.index;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::source::client::{
        EventPage, LockSpec, SearchRequest, SourceClient, SourceError,
    };
    use crate::source::watcher::WatcherConfig;
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Scripted session streams keyed by session id. Each stream is a list
    /// of records; `fail_first_opens` makes the first N opens break with a
    /// connection error after the first record.
    struct SessionSource {
        streams: Mutex<HashMap<String, Vec<RawEvent>>>,
        opens: Mutex<Vec<(String, i64)>>,
        fail_first_opens: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl SessionSource {
        fn new(streams: HashMap<String, Vec<RawEvent>>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams),
                opens: Mutex::new(Vec::new()),
                fail_first_opens: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl SourceClient for SessionSource {
        async fn search_events(&self, _request: &SearchRequest) -> std::result::Result<EventPage, SourceError> {
            Ok(EventPage::default())
        }

        async fn stream_session_events(
            &self,
            session_id: &str,
            start_index: i64,
        ) -> std::result::Result<mpsc::Receiver<std::result::Result<RawEvent, SourceError>>, SourceError> {
            self.opens
                .lock()
                .unwrap()
                .push((session_id.to_string(), start_index));

            let records: Vec<RawEvent> = self
                .streams
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.index >= start_index)
                .collect();

            let break_stream = self
                .fail_first_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            let (tx, rx) = mpsc::channel(8);
            let gauge = self.in_flight.clone();
            tokio::spawn(async move {
                for (i, record) in records.into_iter().enumerate() {
                    if break_stream && i == 1 {
                        let _ = tx
                            .send(Err(SourceError::Connection("stream reset".to_string())))
                            .await;
                        gauge.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if tx.send(Ok(record)).await.is_err() {
                        gauge.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
                gauge.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(rx)
        }

        async fn upsert_lock(&self, _lock: &LockSpec) -> std::result::Result<(), SourceError> {
            Ok(())
        }
    }

    fn record(sid: &str, index: i64, kind: &str) -> RawEvent {
        serde_json::from_value(json!({
            "type": kind,
            "time": "2026-03-01T10:00:00Z",
            "index": index,
            "sid": sid,
        }))
        .unwrap()
    }

    fn job_config(session_url: &str, concurrency: usize) -> SessionJobConfig {
        SessionJobConfig {
            session_url: session_url.to_string(),
            skip_kinds: HashSet::from(["print".to_string()]),
            concurrency,
            dry_run: false,
            retry: RetryPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                max_attempts: 5,
            },
            delivery_retry: RetryPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                max_attempts: 2,
            },
        }
    }

    struct Harness {
        source: Arc<SessionSource>,
        state: Arc<MemoryStateStore>,
        tasks: mpsc::Sender<SessionTask>,
        job: SessionEventsJob,
    }

    fn harness(
        source: Arc<SessionSource>,
        state: Arc<MemoryStateStore>,
        config: SessionJobConfig,
    ) -> Harness {
        let cancel = CancellationToken::new();
        let watcher = Arc::new(EventWatcher::new(
            source.clone(),
            WatcherConfig {
                start_time: "2026-03-01T00:00:00Z".parse().unwrap(),
                namespace: "default".to_string(),
                types: vec![],
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
                exit_on_last_event: true,
            },
            cancel.clone(),
        ));
        let sink = Arc::new(
            SinkClient::new(&crate::config::SinkConfig {
                url: config.session_url.clone(),
                session_url: config.session_url.clone(),
                ca: None,
                cert: None,
                key: None,
            })
            .unwrap(),
        );
        let (tasks, task_rx) = mpsc::channel(16);
        let (ready, _) = watch::channel(false);

        let job = SessionEventsJob::new(
            watcher,
            sink,
            state.clone() as Arc<dyn crate::state::StateStore>,
            task_rx,
            config,
            cancel,
            ready,
        );

        Harness {
            source,
            state,
            tasks,
            job,
        }
    }

    #[tokio::test]
    async fn test_session_replay_checkpoints_and_erases() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source = SessionSource::new(HashMap::from([(
            "s1".to_string(),
            vec![
                record("s1", 0, "session.start"),
                record("s1", 1, "print"),
                record("s1", 2, "session.data"),
            ],
        )]));
        let state = Arc::new(MemoryStateStore::new());
        state.set_session_index("s1", 0).unwrap();

        let h = harness(
            source,
            state.clone(),
            job_config(&format!("{}/session", server.uri()), 2),
        );
        h.tasks
            .send(SessionTask {
                id: "s1".to_string(),
                index: 0,
            })
            .await
            .unwrap();
        drop(h.tasks);

        h.job.run().await.unwrap();

        assert_eq!(
            state.session_index("s1").unwrap(),
            None,
            "clean completion erases the session entry"
        );
        // The print event is skipped: two deliveries for three records.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restored_sessions_resume_from_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source = SessionSource::new(HashMap::from([(
            "s1".to_string(),
            vec![
                record("s1", 17, "session.data"),
                record("s1", 18, "session.data"),
            ],
        )]));
        let state = Arc::new(MemoryStateStore::new());
        state.set_session_index("s1", 17).unwrap();

        let h = harness(
            source.clone(),
            state.clone(),
            job_config(&format!("{}/session", server.uri()), 2),
        );
        drop(h.tasks);

        h.job.run().await.unwrap();

        let opens = source.opens.lock().unwrap();
        assert_eq!(opens[0], ("s1".to_string(), 17));
        assert_eq!(state.session_index("s1").unwrap(), None);
    }

    #[tokio::test]
    async fn test_connection_break_retries_from_last_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source = SessionSource::new(HashMap::from([(
            "s1".to_string(),
            vec![
                record("s1", 0, "session.start"),
                record("s1", 1, "session.data"),
                record("s1", 2, "session.data"),
            ],
        )]));
        source.fail_first_opens.store(1, Ordering::SeqCst);
        let state = Arc::new(MemoryStateStore::new());
        state.set_session_index("s1", 0).unwrap();

        let h = harness(
            source.clone(),
            state.clone(),
            job_config(&format!("{}/session", server.uri()), 2),
        );
        h.tasks
            .send(SessionTask {
                id: "s1".to_string(),
                index: 0,
            })
            .await
            .unwrap();
        drop(h.tasks);

        h.job.run().await.unwrap();

        let opens = source.opens.lock().unwrap();
        assert_eq!(opens.len(), 2, "broken stream re-opens once");
        assert_eq!(opens[1].0, "s1");
        assert_eq!(state.session_index("s1").unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_retryable_delivery_drops_task_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let source = SessionSource::new(HashMap::from([(
            "s1".to_string(),
            vec![record("s1", 0, "session.start")],
        )]));
        let state = Arc::new(MemoryStateStore::new());
        state.set_session_index("s1", 0).unwrap();

        let h = harness(
            source,
            state.clone(),
            job_config(&format!("{}/session", server.uri()), 2),
        );
        drop(h.tasks);

        // The job itself must stay healthy.
        h.job.run().await.unwrap();

        // The entry survives for a later run to pick up.
        assert_eq!(state.session_index("s1").unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut streams = HashMap::new();
        for i in 0..4 {
            streams.insert(
                format!("s{i}"),
                vec![
                    record(&format!("s{i}"), 0, "session.start"),
                    record(&format!("s{i}"), 1, "session.data"),
                ],
            );
        }
        let source = SessionSource::new(streams);
        let state = Arc::new(MemoryStateStore::new());

        let h = harness(
            source.clone(),
            state,
            job_config(&format!("{}/session", server.uri()), 2),
        );
        for i in 0..4 {
            h.tasks
                .send(SessionTask {
                    id: format!("s{i}"),
                    index: 0,
                })
                .await
                .unwrap();
        }
        drop(h.tasks);

        h.job.run().await.unwrap();

        assert!(
            h.source.max_in_flight.load(Ordering::SeqCst) <= 2,
            "no more than `concurrency` streams may be open at once"
        );
    }
}
