//! Session state derived from events.
//!
//! [`reduce`] is pure: it never reads the clock or touches storage, so the
//! same ordered events always fold into the same [`Session`].

use std::borrow::Borrow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::schema::{
    DocumentData, NotesData, REQUIREMENTS_KIND, SessionCreatedData, SessionUpdatedData,
    TestRunData, ValidationData,
};
use super::{EventType, SessionEvent};

/// A policy generated within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedPolicy {
    pub id: String,
    pub content: String,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
    pub attempt: Option<u32>,
    pub created_at: DateTime<Utc>,
    /// Produced by a retry with validator feedback.
    pub reworked: bool,
    pub prior_error: Option<String>,
    /// Artifact key in the session store.
    pub artifact: Option<String>,
    pub is_current: bool,
}

/// The most recent validation of a session's policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationRecord {
    pub policy_id: String,
    pub passed: bool,
    pub message: Option<String>,
    pub validated_at: DateTime<Utc>,
}

/// Running totals over a session's generations and validations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub test_runs: u32,
    pub passed_runs: u32,
    pub failed_runs: u32,
    /// Model calls across all runs, first attempts included.
    pub total_attempts: u64,
    /// Attempts that were corrections of a failed candidate.
    pub retries: u64,
    pub policies_generated: u32,
    pub policies_reworked: u32,
    pub validations_passed: u32,
    pub validations_failed: u32,
    pub tokens_used: u64,
}

impl SessionStats {
    pub fn validations(&self) -> u32 {
        self.validations_passed.saturating_add(self.validations_failed)
    }

    /// Share of validations that passed, `None` before the first one.
    pub fn validation_success_rate(&self) -> Option<f64> {
        match self.validations() {
            0 => None,
            n => Some(f64::from(self.validations_passed) / f64::from(n)),
        }
    }

    /// Share of generation runs that ended with a passing policy.
    pub fn run_success_rate(&self) -> Option<f64> {
        match self.test_runs {
            0 => None,
            n => Some(f64::from(self.passed_runs) / f64::from(n)),
        }
    }
}

/// Accumulated state of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub requirements: Option<String>,
    pub policies: Vec<GeneratedPolicy>,
    pub validation: Option<ValidationRecord>,
    pub notes: Option<String>,
    pub test_runs: u32,
    pub last_test_run: Option<TestRunData>,
    pub stats: SessionStats,
    /// Highest version seen per document id.
    pub versions: BTreeMap<String, u64>,
    /// Events that were skipped during replay.
    pub warnings: Vec<String>,
    /// Events applied (skipped events excluded).
    pub event_count: usize,
}

impl Session {
    /// Whether no event has been applied.
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn current_policy(&self) -> Option<&GeneratedPolicy> {
        self.policies.iter().rev().find(|p| p.is_current)
    }

    /// Version the next event for `document_id` should carry.
    pub fn next_version(&self, document_id: &str) -> u64 {
        self.versions.get(document_id).map_or(1, |v| v + 1)
    }

    fn push_policy(&mut self, policy: GeneratedPolicy) {
        for p in &mut self.policies {
            p.is_current = false;
        }
        self.policies.push(policy);
    }
}

/// Apply one event to a session.
pub fn reduce(mut session: Session, event: &SessionEvent) -> Session {
    if let EventType::Unknown(name) = &event.event_type {
        session
            .warnings
            .push(format!("skipped event {} with unknown type {name}", event.id));
        return session;
    }

    if session.id.is_empty() {
        session.id = event.session_id.clone();
    }

    match &event.event_type {
        EventType::SessionCreated => {
            let data: SessionCreatedData = event.payload().unwrap_or_default();
            session.name = data.session_name;
            session.created_at = Some(event.timestamp);
        }
        EventType::DocumentCreated => {
            let data: DocumentData = event.payload().unwrap_or_default();
            if data.kind == REQUIREMENTS_KIND {
                session.requirements = Some(data.content);
            } else {
                session.stats.policies_generated += 1;
                session.push_policy(policy_from(event, data, false));
            }
        }
        EventType::DocumentEdited => {
            let data: DocumentData = event.payload().unwrap_or_default();
            session.requirements = Some(data.content);
        }
        EventType::DocumentReworked => {
            let data: DocumentData = event.payload().unwrap_or_default();
            session.stats.policies_generated += 1;
            session.stats.policies_reworked += 1;
            session.push_policy(policy_from(event, data, true));
        }
        EventType::ValidationCompleted => {
            let data: ValidationData = event.payload().unwrap_or_default();
            if data.passed {
                session.stats.validations_passed += 1;
            } else {
                session.stats.validations_failed += 1;
            }
            session.validation = Some(ValidationRecord {
                policy_id: event.document_id.clone(),
                passed: data.passed,
                message: data.message,
                validated_at: event.timestamp,
            });
        }
        EventType::TestRun => {
            session.test_runs += 1;
            session.last_test_run = event.payload();
            let stats = &mut session.stats;
            stats.test_runs += 1;
            if let Some(run) = &session.last_test_run {
                if run.passed {
                    stats.passed_runs += 1;
                } else {
                    stats.failed_runs += 1;
                }
                stats.total_attempts += u64::from(run.attempts);
                stats.retries += u64::from(run.attempts.saturating_sub(1));
                stats.tokens_used += u64::from(run.tokens_used.unwrap_or(0));
            }
        }
        EventType::NotesAdded => {
            let data: NotesData = event.payload().unwrap_or_default();
            session.notes = Some(data.content);
        }
        EventType::SessionUpdated => {
            let data: SessionUpdatedData = event.payload().unwrap_or_default();
            if let Some(name) = data.session_name {
                session.name = name;
            }
        }
        EventType::Unknown(_) => {}
    }

    session.updated_at = Some(match session.updated_at {
        Some(t) => t.max(event.timestamp),
        None => event.timestamp,
    });
    if !event.document_id.is_empty() {
        let v = session
            .versions
            .entry(event.document_id.clone())
            .or_insert(event.version);
        *v = (*v).max(event.version);
    }
    session.event_count += 1;
    session
}

fn policy_from(event: &SessionEvent, data: DocumentData, reworked: bool) -> GeneratedPolicy {
    GeneratedPolicy {
        id: event.document_id.clone(),
        content: data.content,
        model: data.model,
        tokens_used: data.tokens_used,
        attempt: data.attempt,
        created_at: event.timestamp,
        reworked,
        prior_error: data.prior_error,
        artifact: data.artifact,
        is_current: true,
    }
}

/// Fold events from the beginning. No events yields `Session::default()`.
pub fn replay<I>(events: I) -> Session
where
    I: IntoIterator,
    I::Item: Borrow<SessionEvent>,
{
    events
        .into_iter()
        .fold(Session::default(), |session, event| {
            reduce(session, event.borrow())
        })
}
