//! Append-only session event log.
//!
//! Every state change of a session is recorded as a [`SessionEvent`] in a
//! per-session JSONL object (`events/{session_id}.jsonl`). The log is the
//! source of truth: the current [`Session`] is always rebuilt by folding the
//! events with the pure [`reduce`] function.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`log`] | [`EventLog`]: append, lazy read, replay, timeline, integrity check |
//! | [`replay`] | [`Session`] and the reducer |
//! | [`schema`] | Typed payloads and their JSON Schemas |

pub mod log;
pub mod replay;
pub mod schema;

pub use log::{EventLog, EventStream, IntegrityReport, TimelineEntry, event_key};
pub use replay::{GeneratedPolicy, Session, SessionStats, ValidationRecord, reduce, replay};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::schema::{
    DocumentData, NotesData, POLICY_KIND, REQUIREMENTS_KIND, SessionCreatedData,
    SessionUpdatedData, TestRunData, ValidationData,
};

/// User recorded on events when the caller does not name one.
pub const DEFAULT_USER: &str = "default_user";

/// Document id of a session's requirements text.
pub const REQUIREMENTS_DOCUMENT: &str = "requirements";

/// Document id of a session's notes.
pub const NOTES_DOCUMENT: &str = "notes";

// ── EventType ──────────────────────────────────────────────────────

/// Kind of a [`SessionEvent`].
///
/// Serialised as its PascalCase name. Names this build does not know
/// deserialise into [`EventType::Unknown`] instead of failing, so logs
/// written by newer versions stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    SessionCreated,
    DocumentCreated,
    DocumentEdited,
    TestRun,
    ValidationCompleted,
    DocumentReworked,
    NotesAdded,
    SessionUpdated,
    Unknown(String),
}

impl EventType {
    /// Every type this build understands.
    pub const KNOWN: &'static [EventType] = &[
        EventType::SessionCreated,
        EventType::DocumentCreated,
        EventType::DocumentEdited,
        EventType::TestRun,
        EventType::ValidationCompleted,
        EventType::DocumentReworked,
        EventType::NotesAdded,
        EventType::SessionUpdated,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::SessionCreated => "SessionCreated",
            EventType::DocumentCreated => "DocumentCreated",
            EventType::DocumentEdited => "DocumentEdited",
            EventType::TestRun => "TestRun",
            EventType::ValidationCompleted => "ValidationCompleted",
            EventType::DocumentReworked => "DocumentReworked",
            EventType::NotesAdded => "NotesAdded",
            EventType::SessionUpdated => "SessionUpdated",
            EventType::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Unknown(_))
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::KNOWN
            .iter()
            .find(|t| t.as_str() == name)
            .cloned()
            .unwrap_or(EventType::Unknown(name))
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SessionEvent ───────────────────────────────────────────────────

/// One immutable record in a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    /// RFC 3339 on the wire.
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub user_id: String,
    pub document_id: String,
    /// Monotonic per `document_id` within a session.
    pub version: u64,
    #[serde(default)]
    pub data: Value,
}

impl SessionEvent {
    /// A new event with a fresh id and the current time, version 1.
    pub fn new(session_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            event_type,
            user_id: DEFAULT_USER.to_string(),
            document_id: String::new(),
            version: 1,
            data,
        }
    }

    /// Attach the document this event concerns and its new version.
    pub fn for_document(mut self, document_id: impl Into<String>, version: u64) -> Self {
        self.document_id = document_id.into();
        self.version = version;
        self
    }

    pub fn by_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Override the timestamp (replayed or imported events).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode `data` into a typed payload, if it matches.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }

    // ── Constructors for each event type ──

    pub fn session_created(session_id: &str, name: &str) -> Self {
        let data = SessionCreatedData {
            session_name: name.to_string(),
        };
        Self::new(session_id, EventType::SessionCreated, to_data(&data)).for_document(session_id, 1)
    }

    pub fn session_renamed(session_id: &str, name: &str, version: u64) -> Self {
        let data = SessionUpdatedData {
            session_name: Some(name.to_string()),
        };
        Self::new(session_id, EventType::SessionUpdated, to_data(&data))
            .for_document(session_id, version)
    }

    /// First requirements text of a session (DocumentCreated) or a
    /// replacement (DocumentEdited), depending on `version`.
    pub fn requirements(session_id: &str, text: &str, version: u64) -> Self {
        let event_type = if version <= 1 {
            EventType::DocumentCreated
        } else {
            EventType::DocumentEdited
        };
        let data = DocumentData {
            kind: REQUIREMENTS_KIND.to_string(),
            content: text.to_string(),
            ..Default::default()
        };
        Self::new(session_id, event_type, to_data(&data))
            .for_document(REQUIREMENTS_DOCUMENT, version)
    }

    /// A generated policy. The first attempt of a run is DocumentCreated;
    /// later attempts are DocumentReworked.
    pub fn policy(session_id: &str, policy_id: &str, data: DocumentData) -> Self {
        let event_type = if data.prior_error.is_some() {
            EventType::DocumentReworked
        } else {
            EventType::DocumentCreated
        };
        let data = DocumentData {
            kind: POLICY_KIND.to_string(),
            ..data
        };
        Self::new(session_id, event_type, to_data(&data)).for_document(policy_id, 1)
    }

    pub fn validation(session_id: &str, policy_id: &str, data: &ValidationData) -> Self {
        Self::new(session_id, EventType::ValidationCompleted, to_data(data))
            .for_document(policy_id, 1)
    }

    pub fn test_run(session_id: &str, data: &TestRunData) -> Self {
        Self::new(session_id, EventType::TestRun, to_data(data)).for_document(session_id, 1)
    }

    pub fn notes(session_id: &str, text: &str, version: u64) -> Self {
        let data = NotesData {
            content: text.to_string(),
        };
        Self::new(session_id, EventType::NotesAdded, to_data(&data))
            .for_document(NOTES_DOCUMENT, version)
    }
}

/// Payload structs hold only strings, numbers, and options, so encoding
/// cannot fail; fall back to `null` rather than panic.
fn to_data<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}
