//! Audit event model and normalization
//!
//! Raw records arrive from the source as open-schema JSON. The normalizer
//! maps each record into a canonical [`Event`]: it derives a synthetic ID
//! when the source omits one, classifies session terminators and failed
//! logins, and replaces interactive `print` payloads with a documented
//! projection. Normalization is pure: no I/O, deterministic given input.

use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Record kind that signals a recorded session is complete and its events
/// are retrievable. Older platform versions emitted `session.end` for the
/// same purpose; this relay targets the upload-based terminator.
pub const SESSION_END_KIND: &str = "session.upload";

/// Record kind carrying login attempts.
pub const LOGIN_KIND: &str = "user.login";

/// Record kind of interactive terminal output inside session streams.
pub const PRINT_KIND: &str = "print";

/// A raw audit record as the source serializes it.
///
/// Well-known attributes are typed; everything else rides along in
/// `fields` and is forwarded untouched. `serde_json` maps keep their keys
/// sorted, which makes re-serialization canonical — synthetic IDs depend
/// on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Server-assigned identifier; may be absent for some record kinds
    #[serde(default)]
    pub id: String,

    /// Record kind, e.g. `user.login` or `session.upload`
    #[serde(rename = "type")]
    pub kind: String,

    /// Server-assigned timestamp
    pub time: DateTime<Utc>,

    /// Position within a session stream; 0 on the main stream
    #[serde(default)]
    pub index: i64,

    /// Remaining record attributes, forwarded verbatim
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl RawEvent {
    fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    fn i64_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }
}

/// Identity of a login that keeps failing, used to key the rate limiter
/// and to address the lock upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLoginData {
    /// Platform user the attempt authenticated as
    pub user: String,
    /// Login name presented by the client
    pub login: String,
}

/// A normalized audit event, ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Non-empty identifier; synthetic when the source omitted one
    pub id: String,

    /// Opaque resume token of the page this event was read from
    pub cursor: String,

    /// Record kind
    pub kind: String,

    /// Server-assigned timestamp
    pub time: DateTime<Utc>,

    /// Session stream position; 0 on the main stream
    pub index: i64,

    /// Session identifier; non-empty iff this event terminates a session
    pub session_id: String,

    /// Whether this event marks a recorded session as complete
    pub is_session_end: bool,

    /// Whether this event is a failed login attempt
    pub is_failed_login: bool,

    /// Present iff `is_failed_login`
    pub failed_login: Option<FailedLoginData>,

    /// The original record, or the sanitized projection for `print` events
    pub payload: Value,
}

/// Sanitized projection of an interactive `print` event.
///
/// The sink receives this documented schema instead of the full opaque
/// terminal frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintEventData {
    /// Position within the session stream
    pub index: i64,
    /// Record kind (always `print`)
    pub kind: String,
    /// Terminal output chunk, base64 as the source encodes it
    pub data: Option<String>,
    /// Server-assigned timestamp
    pub time: DateTime<Utc>,
    /// Cluster the session ran on
    pub cluster: Option<String>,
    /// Ordinal of this chunk within the frame
    pub chunk_index: i64,
    /// Chunk size in bytes
    pub bytes: i64,
    /// Milliseconds since the session started
    pub delay_ms: i64,
    /// Byte offset into the full session output
    pub offset: i64,
    /// Frame identifier
    pub uid: Option<String>,
}

/// Compute the identifier the normalizer will assign to `raw`.
///
/// The server-assigned ID wins; otherwise the ID is the hex SHA-256 of the
/// record's canonical JSON serialization, so re-derivation across restarts
/// is idempotent.
pub fn record_id(raw: &RawEvent) -> Result<String> {
    if !raw.id.is_empty() {
        return Ok(raw.id.clone());
    }
    let canonical = serde_json::to_vec(raw).map_err(RelayError::Serialization)?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Map a raw record into a canonical [`Event`].
///
/// `cursor` is the resume token of the page the record was read from; it
/// is persisted together with the event ID once delivery succeeds.
pub fn normalize(raw: &RawEvent, cursor: &str) -> Result<Event> {
    let id = record_id(raw)?;

    let session_id = raw
        .str_field("sid")
        .or_else(|| raw.str_field("session_id"))
        .unwrap_or_default()
        .to_string();

    // A terminator without a session id cannot be replayed; it is forwarded
    // as an ordinary event.
    let is_session_end = raw.kind == SESSION_END_KIND && !session_id.is_empty();

    let failed_login = if raw.kind == LOGIN_KIND && raw.bool_field("success") == Some(false) {
        let user = raw.str_field("user").unwrap_or_default().to_string();
        let login = raw
            .str_field("login")
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| user.clone());
        Some(FailedLoginData { user, login })
    } else {
        None
    };

    let payload = if raw.kind == PRINT_KIND {
        serde_json::to_value(sanitize_print(raw)).map_err(RelayError::Serialization)?
    } else {
        serde_json::to_value(raw).map_err(RelayError::Serialization)?
    };

    Ok(Event {
        id,
        cursor: cursor.to_string(),
        kind: raw.kind.clone(),
        time: raw.time,
        index: raw.index,
        session_id,
        is_session_end,
        is_failed_login: failed_login.is_some(),
        failed_login,
        payload,
    })
}

fn sanitize_print(raw: &RawEvent) -> PrintEventData {
    PrintEventData {
        index: raw.index,
        kind: raw.kind.clone(),
        data: raw.str_field("data").map(str::to_string),
        time: raw.time,
        cluster: raw.str_field("cluster").map(str::to_string),
        chunk_index: raw.i64_field("chunk_index").unwrap_or(0),
        bytes: raw.i64_field("bytes").unwrap_or(0),
        delay_ms: raw.i64_field("delay_ms").unwrap_or(0),
        offset: raw.i64_field("offset").unwrap_or(0),
        uid: raw.str_field("uid").map(str::to_string),
    }
}
