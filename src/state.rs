//! Durable pipeline state
//!
//! Cursor, last delivered event id, ingestion start time, and per-session
//! checkpoints live in an embedded `sled` database under the storage
//! directory. Writes are flushed before the delivery that caused them is
//! acknowledged, so a crash never acknowledges more than it persisted.
//! sled's own directory lock keeps a second relay instance from opening
//! the same storage.

use crate::error::{RelayError, Result};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const START_TIME_KEY: &str = "start_time";
const CURSOR_KEY: &str = "cursor";
const ID_KEY: &str = "id";
const SESSION_PREFIX: &str = "session/";

/// Durable key/value state shared by the two jobs.
///
/// The store is an injected collaborator: production uses
/// [`SledStateStore`], tests substitute [`MemoryStateStore`].
pub trait StateStore: Send + Sync {
    /// Last successfully delivered main-stream resume token.
    fn cursor(&self) -> Result<Option<String>>;

    /// Last successfully delivered main-stream event id.
    fn last_id(&self) -> Result<Option<String>>;

    /// Persist `{id, cursor}` after a successful main-stream delivery.
    fn save_checkpoint(&self, id: &str, cursor: &str) -> Result<()>;

    /// Last checkpointed index for one in-progress session.
    fn session_index(&self, session_id: &str) -> Result<Option<i64>>;

    /// Checkpoint a session index (big-endian fixed-width on disk).
    fn set_session_index(&self, session_id: &str, index: i64) -> Result<()>;

    /// Erase a session entry after its stream completed cleanly.
    fn remove_session(&self, session_id: &str) -> Result<()>;

    /// Enumerate every in-progress session with its checkpointed index.
    fn sessions(&self) -> Result<Vec<(String, i64)>>;
}

fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

fn decode_index(bytes: &[u8]) -> Result<i64> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RelayError::Storage(format!("session index has {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(fixed) as i64)
}

/// sled-backed state store.
pub struct SledStateStore {
    db: sled::Db,
    start_time: DateTime<Utc>,
}

impl SledStateStore {
    /// Open (or initialize) the store under `path` and run the start-time
    /// gate.
    ///
    /// On first run the effective start time is `requested`, defaulting to
    /// now truncated to second precision, and is persisted. On later runs
    /// a `requested` value that differs from the stored one fails with
    /// [`RelayError::StartTimeDrift`] without mutating state.
    pub fn open(path: impl AsRef<Path>, requested: Option<DateTime<Utc>>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| RelayError::Storage(format!("Failed to open database: {e}")))?;

        let stored = match db
            .get(START_TIME_KEY)
            .map_err(|e| RelayError::Storage(format!("Get failed: {e}")))?
        {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| RelayError::Storage(format!("start_time is not UTF-8: {e}")))?;
                let parsed = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| RelayError::Storage(format!("start_time is not RFC3339: {e}")))?;
                Some(parsed.with_timezone(&Utc))
            }
            None => None,
        };

        let start_time = match (stored, requested) {
            (Some(stored), Some(requested)) if stored != requested => {
                return Err(RelayError::StartTimeDrift {
                    stored: stored.to_rfc3339_opts(SecondsFormat::Secs, true),
                    requested: requested.to_rfc3339_opts(SecondsFormat::Secs, true),
                }
                .into());
            }
            (Some(stored), _) => stored,
            (None, requested) => {
                let effective = requested.unwrap_or_else(|| {
                    let now = Utc::now();
                    now.with_nanosecond(0).unwrap_or(now)
                });
                db.insert(
                    START_TIME_KEY,
                    effective
                        .to_rfc3339_opts(SecondsFormat::Secs, true)
                        .as_bytes(),
                )
                .map_err(|e| RelayError::Storage(format!("Insert failed: {e}")))?;
                db.flush()
                    .map_err(|e| RelayError::Storage(format!("Flush failed: {e}")))?;
                effective
            }
        };

        Ok(Self { db, start_time })
    }

    /// The effective ingestion start time resolved by the gate.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self
            .db
            .get(key)
            .map_err(|e| RelayError::Storage(format!("Get failed: {e}")))?
        {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| RelayError::Storage(format!("{key} is not UTF-8: {e}")))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| RelayError::Storage(format!("Insert failed: {e}")))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| RelayError::Storage(format!("Flush failed: {e}")))?;
        Ok(())
    }
}

impl StateStore for SledStateStore {
    fn cursor(&self) -> Result<Option<String>> {
        self.get_string(CURSOR_KEY)
    }

    fn last_id(&self) -> Result<Option<String>> {
        self.get_string(ID_KEY)
    }

    fn save_checkpoint(&self, id: &str, cursor: &str) -> Result<()> {
        self.insert(ID_KEY, id.as_bytes())?;
        self.insert(CURSOR_KEY, cursor.as_bytes())?;
        self.flush()
    }

    fn session_index(&self, session_id: &str) -> Result<Option<i64>> {
        match self
            .db
            .get(session_key(session_id))
            .map_err(|e| RelayError::Storage(format!("Get failed: {e}")))?
        {
            Some(bytes) => Ok(Some(decode_index(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_session_index(&self, session_id: &str, index: i64) -> Result<()> {
        self.insert(&session_key(session_id), &(index as u64).to_be_bytes())?;
        self.flush()
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.db
            .remove(session_key(session_id))
            .map_err(|e| RelayError::Storage(format!("Remove failed: {e}")))?;
        self.flush()
    }

    fn sessions(&self) -> Result<Vec<(String, i64)>> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(SESSION_PREFIX) {
            let (key, value) =
                item.map_err(|e| RelayError::Storage(format!("Iteration failed: {e}")))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| RelayError::Storage(format!("session key is not UTF-8: {e}")))?;
            let session_id = key
                .strip_prefix(SESSION_PREFIX)
                .unwrap_or(key.as_str())
                .to_string();
            entries.push((session_id, decode_index(&value)?));
        }
        Ok(entries)
    }
}

/// In-memory state store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn cursor(&self) -> Result<Option<String>> {
        let entries = self.entries.lock().expect("state lock");
        Ok(entries
            .get(CURSOR_KEY)
            .map(|v| String::from_utf8_lossy(v).to_string()))
    }

    fn last_id(&self) -> Result<Option<String>> {
        let entries = self.entries.lock().expect("state lock");
        Ok(entries
            .get(ID_KEY)
            .map(|v| String::from_utf8_lossy(v).to_string()))
    }

    fn save_checkpoint(&self, id: &str, cursor: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("state lock");
        entries.insert(ID_KEY.to_string(), id.as_bytes().to_vec());
        entries.insert(CURSOR_KEY.to_string(), cursor.as_bytes().to_vec());
        Ok(())
    }

    fn session_index(&self, session_id: &str) -> Result<Option<i64>> {
        let entries = self.entries.lock().expect("state lock");
        entries
            .get(&session_key(session_id))
            .map(|v| decode_index(v))
            .transpose()
    }

    fn set_session_index(&self, session_id: &str, index: i64) -> Result<()> {
        let mut entries = self.entries.lock().expect("state lock");
        entries.insert(
            session_key(session_id),
            (index as u64).to_be_bytes().to_vec(),
        );
        Ok(())
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("state lock");
        entries.remove(&session_key(session_id));
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<(String, i64)>> {
        let entries = self.entries.lock().expect("state lock");
        entries
            .range(SESSION_PREFIX.to_string()..)
            .take_while(|(k, _)| k.starts_with(SESSION_PREFIX))
            .map(|(k, v)| {
                Ok((
                    k.strip_prefix(SESSION_PREFIX).unwrap_or(k).to_string(),
                    decode_index(v)?,
                ))
            })
            .collect()
    }
}
