//! Persistent event log on top of a [`SessionStore`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::schema::{DocumentData, NotesData, PayloadSchemas, TestRunData, ValidationData};
use super::{EventType, Session, SessionEvent, replay};
use crate::error::{Result, StoreError};
use crate::locks::KeyedLocks;
use crate::store::SessionStore;

const EVENTS_PREFIX: &str = "events/";

/// Storage key of a session's log.
pub fn event_key(session_id: &str) -> String {
    format!("{EVENTS_PREFIX}{session_id}.jsonl")
}

/// Append-only JSONL event log, one object per session.
///
/// Appends to the same session are serialised by a per-session async lock;
/// different sessions never wait on each other.
pub struct EventLog {
    store: Arc<dyn SessionStore>,
    schemas: PayloadSchemas,
    locks: KeyedLocks,
}

impl EventLog {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            schemas: PayloadSchemas::new(),
            locks: KeyedLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Append one event as a single JSON line. Earlier lines are never
    /// rewritten; a fragment left by an interrupted append is closed off so
    /// the new event starts on its own line.
    pub async fn append(&self, event: &SessionEvent) -> Result<()> {
        for violation in self.schemas.check(&event.event_type, &event.data) {
            warn!(
                "Event {} ({}) payload does not match its schema: {violation}",
                event.id, event.event_type
            );
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let key = event_key(&event.session_id);

        let _guard = self.locks.lock(&event.session_id).await;
        self.store.append_line(&key, line).await?;
        debug!(
            "Appended {} to {key} (document={}, version={})",
            event.event_type, event.document_id, event.version
        );
        Ok(())
    }

    /// Append several events in order.
    pub async fn append_all(&self, events: &[SessionEvent]) -> Result<()> {
        for event in events {
            self.append(event).await?;
        }
        Ok(())
    }

    /// Events of a session in append order. A missing log is an empty
    /// stream.
    pub async fn read(&self, session_id: &str) -> Result<EventStream> {
        let key = event_key(session_id);
        let buf = match self.store.get(&key).await {
            Ok(buf) => buf,
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(EventStream::new(key, buf))
    }

    /// Events of the given types with `start <= timestamp <= end`, ordered
    /// by timestamp. An empty `types` slice matches every type; events with
    /// equal timestamps keep their append order.
    pub async fn events_filtered(
        &self,
        session_id: &str,
        types: &[EventType],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionEvent>> {
        let mut events: Vec<SessionEvent> = self
            .read(session_id)
            .await?
            .filter(|e| types.is_empty() || types.contains(&e.event_type))
            .filter(|e| start.is_none_or(|s| e.timestamp >= s))
            .filter(|e| end.is_none_or(|t| e.timestamp <= t))
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// Delete every log whose newest event is older than `cutoff`. Returns
    /// the number of logs removed. Empty logs are left alone.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for session_id in self.sessions().await? {
            let _guard = self.locks.lock(&session_id).await;
            let Some(newest) = self.read(&session_id).await?.map(|e| e.timestamp).max() else {
                continue;
            };
            if newest < cutoff {
                self.store.delete(&event_key(&session_id)).await?;
                debug!("Removed event log of {session_id} (last event {newest})");
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {removed} event log(s) older than {cutoff}");
        }
        Ok(removed)
    }

    /// Rebuild a session's state from its full history.
    pub async fn replay(&self, session_id: &str) -> Result<Session> {
        let session = replay(self.read(session_id).await?);
        for warning in &session.warnings {
            warn!("Replay of {session_id}: {warning}");
        }
        Ok(session)
    }

    /// One human-readable entry per event.
    pub async fn timeline(&self, session_id: &str) -> Result<Vec<TimelineEntry>> {
        Ok(self
            .read(session_id)
            .await?
            .map(|event| TimelineEntry {
                summary: summarize(&event),
                timestamp: event.timestamp.to_rfc3339(),
                event_type: event.event_type.to_string(),
                user_id: event.user_id,
                document_id: event.document_id,
                version: event.version,
            })
            .collect())
    }

    /// Ids of all sessions that have a log, sorted.
    pub async fn sessions(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(EVENTS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(EVENTS_PREFIX)?
                    .strip_suffix(".jsonl")
                    .map(str::to_string)
            })
            .collect())
    }

    /// Structural checks over a session's log.
    pub async fn check_integrity(&self, session_id: &str) -> Result<IntegrityReport> {
        let mut stream = self.read(session_id).await?;
        let events: Vec<SessionEvent> = stream.by_ref().collect();
        let mut issues = Vec::new();

        if events.is_empty() {
            issues.push("no events found".to_string());
        } else if events[0].event_type != EventType::SessionCreated {
            issues.push(format!(
                "first event is {} instead of SessionCreated",
                events[0].event_type
            ));
        }
        for (i, pair) in events.windows(2).enumerate() {
            if pair[1].timestamp < pair[0].timestamp {
                issues.push(format!("event {} is older than its predecessor", i + 1));
            }
        }
        let mut seen = HashSet::new();
        for event in &events {
            if !seen.insert(event.id.as_str()) {
                issues.push(format!("duplicate event id {}", event.id));
            }
            if event.session_id != session_id {
                issues.push(format!(
                    "event {} belongs to session {}",
                    event.id, event.session_id
                ));
            }
        }
        if stream.skipped() > 0 {
            issues.push(format!("{} unparseable line(s)", stream.skipped()));
        }
        let unknown = events.iter().filter(|e| !e.event_type.is_known()).count();
        if unknown > 0 {
            issues.push(format!("{unknown} event(s) of unknown type"));
        }

        Ok(IntegrityReport {
            session_id: session_id.to_string(),
            event_count: events.len(),
            is_valid: issues.is_empty(),
            issues,
        })
    }
}

fn summarize(event: &SessionEvent) -> String {
    match &event.event_type {
        EventType::SessionCreated => {
            let name = event.data["session_name"].as_str().unwrap_or("Unnamed");
            format!("Session '{name}' created")
        }
        EventType::SessionUpdated => match event.data["session_name"].as_str() {
            Some(name) => format!("Session renamed to '{name}'"),
            None => "Session metadata updated".to_string(),
        },
        EventType::DocumentCreated | EventType::DocumentEdited | EventType::DocumentReworked => {
            let data: DocumentData = event.payload().unwrap_or_default();
            let verb = match event.event_type {
                EventType::DocumentCreated => "created",
                EventType::DocumentEdited => "edited",
                _ => "reworked from validator feedback",
            };
            match data.model {
                Some(model) => format!(
                    "{} {} {verb} ({} chars, model {model})",
                    data.kind,
                    event.document_id,
                    data.content.chars().count()
                ),
                None => format!("{} {verb} ({} chars)", data.kind, data.content.chars().count()),
            }
        }
        EventType::ValidationCompleted => {
            let data: ValidationData = event.payload().unwrap_or_default();
            if data.passed {
                format!("Validation of {} passed", event.document_id)
            } else {
                format!("Validation of {} failed", event.document_id)
            }
        }
        EventType::TestRun => {
            let data: TestRunData = event.payload().unwrap_or_default();
            format!(
                "Generation run: {} after {} attempt(s)",
                if data.passed { "passed" } else { "failed" },
                data.attempts
            )
        }
        EventType::NotesAdded => {
            let data: NotesData = event.payload().unwrap_or_default();
            format!("Notes updated ({} chars)", data.content.chars().count())
        }
        EventType::Unknown(name) => format!("{name} event"),
    }
}

/// One row of [`EventLog::timeline`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub timestamp: String,
    pub event_type: String,
    pub user_id: String,
    pub document_id: String,
    pub version: u64,
    pub summary: String,
}

/// Result of [`EventLog::check_integrity`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub session_id: String,
    pub event_count: usize,
    pub is_valid: bool,
    pub issues: Vec<String>,
}

// ── EventStream ────────────────────────────────────────────────────

/// Lazy iterator over the events in one log snapshot.
///
/// Lines are parsed as they are pulled. A trailing line without a newline is
/// an interrupted append and is ignored; a complete line that does not parse
/// is skipped with a warning.
pub struct EventStream {
    key: String,
    buf: Vec<u8>,
    pos: usize,
    line_no: usize,
    skipped: usize,
}

impl EventStream {
    fn new(key: String, buf: Vec<u8>) -> Self {
        Self {
            key,
            buf,
            pos: 0,
            line_no: 0,
            skipped: 0,
        }
    }

    /// Complete lines that failed to parse so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for EventStream {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        loop {
            let rest = self.buf.get(self.pos..)?;
            let end = rest.iter().position(|b| *b == b'\n')?;
            let line = rest.get(..end)?.trim_ascii();
            self.pos += end + 1;
            self.line_no += 1;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<SessionEvent>(line) {
                Ok(event) => return Some(event),
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping malformed line {} of {}: {e}", self.line_no, self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, Metadata, ObjectStoreBackend};
    use chrono::{TimeZone, Utc};

    fn log() -> EventLog {
        EventLog::new(Arc::new(ObjectStoreBackend::in_memory()))
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_log_reads_empty_and_replays_default() {
        let log = log();
        assert_eq!(log.read("nobody").await.unwrap().count(), 0);
        assert_eq!(log.replay("nobody").await.unwrap(), Session::default());
    }

    #[tokio::test]
    async fn read_returns_append_order_and_is_repeatable() {
        let log = log();
        let events = vec![
            SessionEvent::session_created("s1", "Docs").at(at(0)),
            SessionEvent::requirements("s1", "read-only", 1).at(at(1)),
            SessionEvent::notes("s1", "n", 1).at(at(2)),
        ];
        log.append_all(&events).await.unwrap();

        let first: Vec<_> = log.read("s1").await.unwrap().collect();
        let second: Vec<_> = log.read("s1").await.unwrap().collect();
        assert_eq!(first, events);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn sessions_do_not_share_logs() {
        let log = log();
        log.append(&SessionEvent::session_created("a", "A")).await.unwrap();
        log.append(&SessionEvent::session_created("b", "B")).await.unwrap();
        assert_eq!(log.read("a").await.unwrap().count(), 1);
        assert_eq!(log.sessions().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_ignored() {
        let store = Arc::new(ObjectStoreBackend::in_memory());
        let log = EventLog::new(store.clone());
        let event = SessionEvent::session_created("s", "x");
        log.append(&event).await.unwrap();
        store
            .append(&event_key("s"), br#"{"id":"half"#.to_vec())
            .await
            .unwrap();

        let mut stream = log.read("s").await.unwrap();
        assert_eq!(stream.next(), Some(event));
        assert_eq!(stream.next(), None);
        assert_eq!(stream.skipped(), 0);
    }

    #[tokio::test]
    async fn append_after_partial_line_is_kept() {
        let store = Arc::new(ObjectStoreBackend::in_memory());
        let log = EventLog::new(store.clone());
        let created = SessionEvent::session_created("s", "x");
        log.append(&created).await.unwrap();
        store
            .append(&event_key("s"), br#"{"id":"half"#.to_vec())
            .await
            .unwrap();
        let notes = SessionEvent::notes("s", "after the crash", 1);
        log.append(&notes).await.unwrap();

        let mut stream = log.read("s").await.unwrap();
        let events: Vec<_> = stream.by_ref().collect();
        assert_eq!(events, vec![created, notes]);
        assert_eq!(stream.skipped(), 1);
    }

    #[tokio::test]
    async fn append_after_partial_line_is_kept_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let log = EventLog::new(store.clone());
        let created = SessionEvent::session_created("s", "x");
        log.append(&created).await.unwrap();
        store
            .append(&event_key("s"), br#"{"id":"half"#.to_vec())
            .await
            .unwrap();
        let notes = SessionEvent::notes("s", "after the crash", 1);
        log.append(&notes).await.unwrap();

        let events: Vec<_> = log.read("s").await.unwrap().collect();
        assert_eq!(events, vec![created, notes]);
        assert_eq!(log.replay("s").await.unwrap().notes.as_deref(), Some("after the crash"));
    }

    #[tokio::test]
    async fn malformed_complete_line_is_skipped() {
        let store = Arc::new(ObjectStoreBackend::in_memory());
        let log = EventLog::new(store.clone());
        store
            .put(&event_key("s"), b"not json\n\n".to_vec(), Metadata::new())
            .await
            .unwrap();
        let event = SessionEvent::notes("s", "kept", 1);
        log.append(&event).await.unwrap();

        let mut stream = log.read("s").await.unwrap();
        let events: Vec<_> = stream.by_ref().collect();
        assert_eq!(events, vec![event]);
        assert_eq!(stream.skipped(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_session_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new(Arc::new(LocalStore::new(dir.path()))));
        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&SessionEvent::notes("s", &format!("note {i}"), i + 1))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let events: Vec<_> = log.read("s").await.unwrap().collect();
        assert_eq!(events.len(), 20);
    }

    #[tokio::test]
    async fn concurrent_appends_with_read_modify_write_backend() {
        let log = Arc::new(log());
        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&SessionEvent::notes("s", "x", i + 1)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(log.read("s").await.unwrap().count(), 20);
    }

    #[tokio::test]
    async fn filtered_read_by_type_and_inclusive_window() {
        let log = log();
        let created = SessionEvent::session_created("s", "x").at(at(0));
        let req = SessionEvent::requirements("s", "r", 1).at(at(10));
        let early_notes = SessionEvent::notes("s", "a", 1).at(at(20));
        let late_notes = SessionEvent::notes("s", "b", 2).at(at(30));
        // Appended out of order; the result is sorted by timestamp.
        log.append_all(&[created.clone(), late_notes.clone(), req.clone(), early_notes.clone()])
            .await
            .unwrap();

        let all = log.events_filtered("s", &[], None, None).await.unwrap();
        assert_eq!(all, vec![created, req.clone(), early_notes.clone(), late_notes.clone()]);

        let notes = log
            .events_filtered("s", &[EventType::NotesAdded], None, None)
            .await
            .unwrap();
        assert_eq!(notes, vec![early_notes.clone(), late_notes]);

        let window = log
            .events_filtered("s", &[], Some(at(10)), Some(at(20)))
            .await
            .unwrap();
        assert_eq!(window, vec![req, early_notes]);

        assert!(log.events_filtered("none", &[], None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_logs() {
        let log = log();
        log.append(&SessionEvent::session_created("old", "o").at(at(0)))
            .await
            .unwrap();
        log.append(&SessionEvent::session_created("new", "n").at(at(0)))
            .await
            .unwrap();
        log.append(&SessionEvent::notes("new", "recent", 1).at(at(1000)))
            .await
            .unwrap();

        assert_eq!(log.cleanup_older_than(at(500)).await.unwrap(), 1);
        assert_eq!(log.sessions().await.unwrap(), vec!["new"]);
        assert_eq!(log.cleanup_older_than(at(500)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timeline_summarises_each_event() {
        let log = log();
        log.append(&SessionEvent::session_created("s", "Docs")).await.unwrap();
        log.append(&SessionEvent::test_run(
            "s",
            &TestRunData {
                attempts: 2,
                passed: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();

        let timeline = log.timeline("s").await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].summary, "Session 'Docs' created");
        assert_eq!(timeline[1].event_type, "TestRun");
        assert!(timeline[1].summary.contains("passed after 2 attempt"));
    }

    #[tokio::test]
    async fn integrity_flags_missing_creation_and_disorder() {
        let log = log();
        log.append(&SessionEvent::session_created("ok", "fine").at(at(0)))
            .await
            .unwrap();
        assert!(log.check_integrity("ok").await.unwrap().is_valid);

        log.append(&SessionEvent::notes("bad", "a", 1).at(at(5)))
            .await
            .unwrap();
        log.append(&SessionEvent::notes("bad", "b", 2).at(at(1)))
            .await
            .unwrap();
        let report = log.check_integrity("bad").await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.event_count, 2);
        assert!(report.issues.iter().any(|i| i.contains("instead of SessionCreated")));
        assert!(report.issues.iter().any(|i| i.contains("older than")));
    }
}
