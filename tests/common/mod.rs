//! Shared fixtures for integration tests
//!
//! A scripted source client plus a pipeline runner that wires the two
//! jobs together the way the supervisor does, with an in-memory state
//! store and fast retry policies.

#![allow(dead_code)]

use async_trait::async_trait;
use audit_relay::backoff::RetryPolicy;
use audit_relay::config::SinkConfig;
use audit_relay::event::RawEvent;
use audit_relay::jobs::{
    MainEventsJob, MainJobConfig, SessionEventsJob, SessionJobConfig, SessionTask,
};
use audit_relay::limiter::LoginRateLimiter;
use audit_relay::sink::SinkClient;
use audit_relay::source::client::{
    EventPage, LockSpec, SearchRequest, SourceClient, SourceError,
};
use audit_relay::source::watcher::{EventWatcher, WatcherConfig};
use audit_relay::state::StateStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Scripted source: pops one page per search call (then empty pages) and
/// serves session streams from fixed record lists, resuming inclusively
/// at the requested index.
pub struct ScriptedSource {
    pub pages: Mutex<VecDeque<EventPage>>,
    pub streams: Mutex<HashMap<String, Vec<RawEvent>>>,
    pub searches: Mutex<Vec<SearchRequest>>,
    pub stream_opens: Mutex<Vec<(String, i64)>>,
    pub locks: Mutex<Vec<LockSpec>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<EventPage>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            streams: Mutex::new(HashMap::new()),
            searches: Mutex::new(Vec::new()),
            stream_opens: Mutex::new(Vec::new()),
            locks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_session(self: Arc<Self>, session_id: &str, records: Vec<RawEvent>) -> Arc<Self> {
        self.streams
            .lock()
            .unwrap()
            .insert(session_id.to_string(), records);
        self
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn search_events(&self, request: &SearchRequest) -> Result<EventPage, SourceError> {
        self.searches.lock().unwrap().push(request.clone());
        Ok(self
            .pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn stream_session_events(
        &self,
        session_id: &str,
        start_index: i64,
    ) -> Result<mpsc::Receiver<Result<RawEvent, SourceError>>, SourceError> {
        self.stream_opens
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

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for record in records {
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
            // Dropping the sender closes the channel: end of session.
        });
        Ok(rx)
    }

    async fn upsert_lock(&self, lock: &LockSpec) -> Result<(), SourceError> {
        self.locks.lock().unwrap().push(lock.clone());
        Ok(())
    }
}

/// Build a raw record from JSON.
pub fn raw(value: serde_json::Value) -> RawEvent {
    serde_json::from_value(value).expect("valid raw event")
}

/// A page of records with a next-page token.
pub fn page(events: Vec<RawEvent>, next_cursor: &str) -> EventPage {
    EventPage {
        events,
        next_cursor: next_cursor.to_string(),
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(2),
        cap: Duration::from_millis(10),
        max_attempts,
    }
}

/// Pipeline tuning knobs a test may override.
pub struct PipelineOptions {
    pub dry_run: bool,
    pub lock_enabled: bool,
    pub concurrency: usize,
    pub failed_attempts_count: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            lock_enabled: false,
            concurrency: 5,
            failed_attempts_count: 3,
        }
    }
}

/// Run both jobs to completion against `sink_base`, the way the
/// supervisor wires them, with `exit-on-last-event` set.
///
/// Main events post to `<sink_base>/events`, session events to
/// `<sink_base>/session.<sid>.log`.
pub async fn run_pipeline(
    source: Arc<ScriptedSource>,
    state: Arc<dyn StateStore>,
    sink_base: &str,
    options: PipelineOptions,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let watcher = Arc::new(EventWatcher::new(
        source,
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

    let sink = Arc::new(SinkClient::new(&SinkConfig {
        url: format!("{sink_base}/events"),
        session_url: format!("{sink_base}/session"),
        ca: None,
        cert: None,
        key: None,
    })?);

    let (session_tx, session_rx) = mpsc::channel::<SessionTask>(64);
    let (main_ready, _) = watch::channel(false);
    let (session_ready, _) = watch::channel(false);

    let main_job = MainEventsJob::new(
        watcher.clone(),
        sink.clone(),
        state.clone(),
        LoginRateLimiter::new(options.failed_attempts_count, Duration::from_secs(60)),
        session_tx,
        MainJobConfig {
            sink_url: format!("{sink_base}/events"),
            dry_run: options.dry_run,
            lock_enabled: options.lock_enabled,
            lock_for: Duration::ZERO,
            retry: fast_policy(5),
            reconnect_delay: Duration::from_millis(10),
        },
        cancel.clone(),
        main_ready,
    );

    let session_job = SessionEventsJob::new(
        watcher,
        sink,
        state,
        session_rx,
        SessionJobConfig {
            session_url: format!("{sink_base}/session"),
            skip_kinds: ["print".to_string()].into(),
            concurrency: options.concurrency,
            dry_run: options.dry_run,
            retry: fast_policy(5),
            delivery_retry: fast_policy(5),
        },
        cancel,
        session_ready,
    );

    let (main_result, session_result) = tokio::join!(main_job.run(), session_job.run());
    main_result?;
    session_result?;
    Ok(())
}
