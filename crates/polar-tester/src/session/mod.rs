//! Session workflow: create sessions, record edits, and run generations.
//!
//! A session's state lives in its event log; the manager also keeps a small
//! `sessions/{id}/metadata.json` object for fast listing and stores every
//! generated policy as `sessions/{id}/policies/{policy_id}.polar`.
//! Session ids are passed explicitly; there is no "active session".
//! Backups, restores, and store-wide health scans live in [`recovery`].

pub mod recovery;

pub use recovery::{BackupInfo, ScanReport};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result, StoreError};
use crate::events::SessionStats;
use crate::events::schema::{DocumentData, TestRunData, ValidationData};
use crate::events::{
    EventLog, NOTES_DOCUMENT, REQUIREMENTS_DOCUMENT, Session, SessionEvent, event_key,
};
use crate::generate::{GenerationResult, Generator};
use crate::locks::KeyedLocks;
use crate::prompt::{ModelOverrides, assemble};
use crate::store::{Metadata, SessionStore};

const SESSIONS_PREFIX: &str = "sessions/";
const MAX_NAME_LEN: usize = 100;

/// The listing record kept beside each session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Manager for session metadata, artifacts, and event history.
///
/// Storage layout:
/// ```text
/// events/{id}.jsonl
/// sessions/{id}/metadata.json
/// sessions/{id}/policies/{policy_id}.polar
/// backups/{id}/{backup_id}/manifest.json
/// backups/{id}/{backup_id}/files/...
/// ```
///
/// Two per-session locks: `runs` admits one generation at a time, `edits`
/// makes each read-version-append step atomic. When both are needed, `runs`
/// is taken first.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    events: EventLog,
    runs: KeyedLocks,
    edits: KeyedLocks,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            events: EventLog::new(store.clone()),
            store,
            runs: KeyedLocks::default(),
            edits: KeyedLocks::default(),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    fn metadata_key(id: &str) -> Result<String> {
        if id.is_empty() || id.contains('/') {
            return Err(StoreError::InvalidKey { key: id.to_string() }.into());
        }
        Ok(format!("{SESSIONS_PREFIX}{id}/metadata.json"))
    }

    fn policy_key(id: &str, policy_id: &str) -> String {
        format!("{SESSIONS_PREFIX}{id}/policies/{policy_id}.polar")
    }

    async fn save_summary(&self, summary: &SessionSummary) -> Result<()> {
        let key = Self::metadata_key(&summary.id)?;
        let json = serde_json::to_vec_pretty(summary)?;
        let mut meta = Metadata::new();
        meta.insert("session_name".into(), summary.name.clone());
        self.store.put(&key, json, meta).await?;
        Ok(())
    }

    /// Bump `updated_at` (and optionally the name) in the listing record.
    async fn touch(&self, id: &str, name: Option<&str>) -> Result<()> {
        let mut summary = self.summary(id).await?;
        summary.updated_at = Utc::now();
        if let Some(name) = name {
            summary.name = name.to_string();
        }
        self.save_summary(&summary).await
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Create a session and record its SessionCreated event.
    pub async fn create_session(&self, name: &str, description: &str) -> Result<SessionSummary> {
        let name = validate_name(name)?;
        let now = Utc::now();
        let summary = SessionSummary {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.events
            .append(&SessionEvent::session_created(&summary.id, name).at(now))
            .await?;
        self.save_summary(&summary).await?;
        info!("Created session {} ({name})", summary.id);
        Ok(summary)
    }

    /// All sessions, most recently created first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for key in self.store.list(SESSIONS_PREFIX).await? {
            let Some(rest) = key.strip_prefix(SESSIONS_PREFIX) else {
                continue;
            };
            if !matches!(rest.split_once('/'), Some((_, "metadata.json"))) {
                continue;
            }
            let bytes = self.store.get(&key).await?;
            match serde_json::from_slice::<SessionSummary>(&bytes) {
                Ok(summary) => sessions.push(summary),
                Err(e) => warn!("Skipping unreadable session metadata {key}: {e}"),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// The listing record of one session.
    pub async fn summary(&self, id: &str) -> Result<SessionSummary> {
        let bytes = self.store.get(&Self::metadata_key(id)?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replay a session's history. Unknown ids are `StoreError::NotFound`.
    pub async fn load(&self, id: &str) -> Result<Session> {
        let key = Self::metadata_key(id)?;
        if !self.store.exists(&key).await? {
            return Err(StoreError::NotFound { key }.into());
        }
        self.events.replay(id).await
    }

    /// Set or replace the requirements text.
    pub async fn set_requirements(&self, id: &str, text: &str) -> Result<Session> {
        if text.trim().is_empty() {
            return Err(Error::Configuration("requirement text is empty".into()));
        }
        let _edit = self.edits.lock(id).await;
        let session = self.load(id).await?;
        let version = session.next_version(REQUIREMENTS_DOCUMENT);
        self.events
            .append(&SessionEvent::requirements(id, text, version))
            .await?;
        self.touch(id, None).await?;
        self.load(id).await
    }

    pub async fn set_notes(&self, id: &str, text: &str) -> Result<Session> {
        let _edit = self.edits.lock(id).await;
        let session = self.load(id).await?;
        let version = session.next_version(NOTES_DOCUMENT);
        self.events
            .append(&SessionEvent::notes(id, text, version))
            .await?;
        self.touch(id, None).await?;
        self.load(id).await
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Session> {
        let name = validate_name(name)?;
        let _edit = self.edits.lock(id).await;
        let session = self.load(id).await?;
        let version = session.next_version(id);
        self.events
            .append(&SessionEvent::session_renamed(id, name, version))
            .await?;
        self.touch(id, Some(name)).await?;
        self.load(id).await
    }

    /// Remove a session's metadata, artifacts, and event log.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let key = Self::metadata_key(id)?;
        if !self.store.exists(&key).await? {
            return Err(StoreError::NotFound { key }.into());
        }
        let _run = self.runs.lock(id).await;
        let _edit = self.edits.lock(id).await;
        self.remove_live_state(id).await?;
        info!("Deleted session {id}");
        Ok(())
    }

    /// Metadata, artifacts, and log of `id`. Backups are kept.
    async fn remove_live_state(&self, id: &str) -> Result<()> {
        for key in self.store.list(&format!("{SESSIONS_PREFIX}{id}/")).await? {
            self.store.delete(&key).await?;
        }
        match self.store.delete(&event_key(id)).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Generation and validation totals of a session.
    pub async fn stats(&self, id: &str) -> Result<SessionStats> {
        Ok(self.load(id).await?.stats)
    }

    /// Remove event logs idle for longer than `retention_days`.
    pub async fn cleanup_events(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        self.events.cleanup_older_than(cutoff).await
    }

    // ── Generation ─────────────────────────────────────────────────

    /// Generate a policy for the session's requirements and record every
    /// attempt.
    ///
    /// At most one generation runs per session at a time; a second caller
    /// waits. Each attempt's candidate is stored as an artifact and logged
    /// (DocumentCreated for the first attempt, DocumentReworked after that)
    /// with its ValidationCompleted event, followed by one TestRun summary.
    pub async fn run_generation(
        &self,
        id: &str,
        contexts: Vec<String>,
        overrides: ModelOverrides,
        generator: &Generator,
    ) -> Result<GenerationResult> {
        let _run = self.runs.lock(id).await;
        let session = self.load(id).await?;
        let requirements = session.requirements.ok_or_else(|| {
            Error::Configuration(format!(
                "session {id} has no requirements; set them with `session requirements`"
            ))
        })?;

        let request = assemble(contexts, requirements, None, None)?.with_overrides(overrides);
        let result = generator.generate(request).await?;
        self.record_run(id, &result).await?;
        Ok(result)
    }

    async fn record_run(&self, id: &str, result: &GenerationResult) -> Result<()> {
        let _edit = self.edits.lock(id).await;
        for attempt in &result.history {
            let policy_id = uuid::Uuid::new_v4().to_string();
            let artifact = Self::policy_key(id, &policy_id);

            let mut meta = Metadata::new();
            meta.insert("attempt".into(), attempt.number.to_string());
            meta.insert("passed".into(), attempt.outcome.is_pass().to_string());
            if let Some(model) = &result.model {
                meta.insert("model".into(), model.clone());
            }
            self.store
                .put(&artifact, attempt.candidate.clone().into_bytes(), meta)
                .await?;

            let document = DocumentData {
                content: attempt.candidate.clone(),
                model: result.model.clone(),
                tokens_used: attempt.tokens,
                attempt: Some(attempt.number),
                prior_error: attempt.prior_error.clone(),
                artifact: Some(artifact),
                ..Default::default()
            };
            self.events
                .append(&SessionEvent::policy(id, &policy_id, document))
                .await?;
            self.events
                .append(&SessionEvent::validation(
                    id,
                    &policy_id,
                    &ValidationData {
                        passed: attempt.outcome.is_pass(),
                        message: attempt.outcome.message().map(str::to_string),
                        attempt: Some(attempt.number),
                    },
                ))
                .await?;
        }

        self.events
            .append(&SessionEvent::test_run(
                id,
                &TestRunData {
                    attempts: result.attempts,
                    passed: result.passed(),
                    model: result.model.clone(),
                    tokens_used: result.tokens_used,
                    elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            ))
            .await?;
        self.touch(id, None).await
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Configuration("session name cannot be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::Configuration(format!(
            "session name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name)
}
