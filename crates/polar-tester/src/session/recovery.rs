//! Point-in-time backups of a session and store-wide health scans.
//!
//! A backup copies every live object of a session (metadata, policy
//! artifacts, and the event log) under `backups/{id}/{backup_id}/files/`,
//! keeping each object's metadata, and records what it copied in a
//! `manifest.json` beside them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{SESSIONS_PREFIX, SessionManager};
use crate::error::{Result, StoreError};
use crate::events::{IntegrityReport, event_key};
use crate::store::Metadata;

const BACKUPS_PREFIX: &str = "backups/";

/// Manifest of one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub session_id: String,
    /// Sortable by creation time.
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    /// Original keys of the copied objects.
    pub files: Vec<String>,
}

/// Result of [`SessionManager::scan_sessions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub total: usize,
    pub healthy: usize,
    pub corrupted: usize,
    pub reports: Vec<IntegrityReport>,
}

fn backup_root(id: &str, backup_id: &str) -> String {
    format!("{BACKUPS_PREFIX}{id}/{backup_id}/")
}

fn manifest_key(id: &str, backup_id: &str) -> String {
    format!("{}manifest.json", backup_root(id, backup_id))
}

fn copy_key(id: &str, backup_id: &str, original: &str) -> String {
    format!("{}files/{original}", backup_root(id, backup_id))
}

fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}-{suffix}", now.format("%Y%m%dT%H%M%S%3fZ"))
}

impl SessionManager {
    /// Copy a session's current objects into a new backup.
    pub async fn backup_session(&self, id: &str) -> Result<BackupInfo> {
        let metadata_key = Self::metadata_key(id)?;
        let _run = self.runs.lock(id).await;
        let _edit = self.edits.lock(id).await;
        if !self.store.exists(&metadata_key).await? {
            return Err(StoreError::NotFound { key: metadata_key }.into());
        }

        let mut files = self.store.list(&format!("{SESSIONS_PREFIX}{id}/")).await?;
        let log = event_key(id);
        if self.store.exists(&log).await? {
            files.push(log);
        }

        let now = Utc::now();
        let backup_id = new_backup_id(now);
        for key in &files {
            let bytes = self.store.get(key).await?;
            let meta = self.store.metadata(key).await?;
            self.store
                .put(&copy_key(id, &backup_id, key), bytes, meta)
                .await?;
        }

        let info = BackupInfo {
            session_id: id.to_string(),
            backup_id,
            created_at: now,
            file_count: files.len(),
            files,
        };
        self.store
            .put(
                &manifest_key(id, &info.backup_id),
                serde_json::to_vec_pretty(&info)?,
                Metadata::new(),
            )
            .await?;
        info!(
            "Backed up session {id} as {} ({} files)",
            info.backup_id, info.file_count
        );
        Ok(info)
    }

    /// Backups of a session, newest first. Unreadable manifests are skipped.
    pub async fn list_backups(&self, id: &str) -> Result<Vec<BackupInfo>> {
        Self::metadata_key(id)?;
        let mut backups = Vec::new();
        for key in self.store.list(&format!("{BACKUPS_PREFIX}{id}/")).await? {
            if !key.ends_with("/manifest.json") {
                continue;
            }
            let bytes = self.store.get(&key).await?;
            match serde_json::from_slice::<BackupInfo>(&bytes) {
                Ok(info) => backups.push(info),
                Err(e) => warn!("Skipping unreadable backup manifest {key}: {e}"),
            }
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(backups)
    }

    /// Replace a session's live objects with a backup's copies; the newest
    /// backup when `backup_id` is `None`. Works for deleted sessions too.
    pub async fn restore_backup(&self, id: &str, backup_id: Option<&str>) -> Result<BackupInfo> {
        Self::metadata_key(id)?;
        let info = match backup_id {
            Some(backup_id) => {
                let bytes = self.store.get(&manifest_key(id, backup_id)).await?;
                serde_json::from_slice::<BackupInfo>(&bytes)?
            }
            None => self.list_backups(id).await?.into_iter().next().ok_or_else(|| {
                StoreError::NotFound {
                    key: format!("{BACKUPS_PREFIX}{id}/"),
                }
            })?,
        };

        let _run = self.runs.lock(id).await;
        let _edit = self.edits.lock(id).await;
        // Read every copy before touching live state so a missing copy
        // leaves the session as it was.
        let mut copies = Vec::with_capacity(info.files.len());
        for key in &info.files {
            let from = copy_key(id, &info.backup_id, key);
            let bytes = self.store.get(&from).await?;
            let meta = self.store.metadata(&from).await?;
            copies.push((key, bytes, meta));
        }
        self.remove_live_state(id).await?;
        for (key, bytes, meta) in copies {
            self.store.put(key, bytes, meta).await?;
        }
        info!("Restored session {id} from backup {}", info.backup_id);
        Ok(info)
    }

    /// Integrity-check every session that has metadata or an event log.
    pub async fn scan_sessions(&self) -> Result<ScanReport> {
        let mut ids: BTreeSet<String> = self.events.sessions().await?.into_iter().collect();
        for key in self.store.list(SESSIONS_PREFIX).await? {
            if let Some((id, "metadata.json")) = key
                .strip_prefix(SESSIONS_PREFIX)
                .and_then(|rest| rest.split_once('/'))
            {
                ids.insert(id.to_string());
            }
        }

        let mut reports = Vec::with_capacity(ids.len());
        for id in &ids {
            let report = self.events.check_integrity(id).await?;
            if !report.is_valid {
                warn!("Session {id} failed integrity check: {:?}", report.issues);
            }
            reports.push(report);
        }
        let healthy = reports.iter().filter(|r| r.is_valid).count();
        Ok(ScanReport {
            total: reports.len(),
            healthy,
            corrupted: reports.len() - healthy,
            reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEvent;
    use crate::store::ObjectStoreBackend;
    use std::sync::Arc;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(ObjectStoreBackend::in_memory()))
    }

    #[tokio::test]
    async fn restore_rolls_back_later_edits() {
        let mgr = manager();
        let s = mgr.create_session("Docs", "").await.unwrap();
        mgr.set_requirements(&s.id, "v1").await.unwrap();
        let backup = mgr.backup_session(&s.id).await.unwrap();
        assert_eq!(backup.file_count, 2);
        assert!(backup.files.contains(&event_key(&s.id)));

        mgr.set_requirements(&s.id, "v2").await.unwrap();
        mgr.rename(&s.id, "Renamed").await.unwrap();

        let restored = mgr.restore_backup(&s.id, None).await.unwrap();
        assert_eq!(restored.backup_id, backup.backup_id);
        let session = mgr.load(&s.id).await.unwrap();
        assert_eq!(session.requirements.as_deref(), Some("v1"));
        assert_eq!(session.name, "Docs");
        assert_eq!(mgr.summary(&s.id).await.unwrap().name, "Docs");
    }

    #[tokio::test]
    async fn deleted_session_can_be_restored() {
        let mgr = manager();
        let s = mgr.create_session("Docs", "").await.unwrap();
        mgr.set_notes(&s.id, "keep me").await.unwrap();
        let backup = mgr.backup_session(&s.id).await.unwrap();
        mgr.delete_session(&s.id).await.unwrap();
        assert!(mgr.load(&s.id).await.unwrap_err().is_not_found());

        mgr.restore_backup(&s.id, Some(&backup.backup_id)).await.unwrap();
        let session = mgr.load(&s.id).await.unwrap();
        assert_eq!(session.notes.as_deref(), Some("keep me"));
        assert_eq!(mgr.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backups_are_listed_newest_first() {
        let mgr = manager();
        let s = mgr.create_session("Docs", "").await.unwrap();
        let first = mgr.backup_session(&s.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = mgr.backup_session(&s.id).await.unwrap();

        let ids: Vec<_> = mgr
            .list_backups(&s.id)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.backup_id)
            .collect();
        assert_eq!(ids, vec![second.backup_id, first.backup_id]);
        // Backups are not sessions.
        assert_eq!(mgr.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restore_without_backups_is_not_found() {
        let mgr = manager();
        let s = mgr.create_session("Docs", "").await.unwrap();
        assert!(mgr.restore_backup(&s.id, None).await.unwrap_err().is_not_found());
        assert!(
            mgr.restore_backup(&s.id, Some("nope"))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(mgr.backup_session("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn scan_counts_healthy_and_corrupted_sessions() {
        let mgr = manager();
        mgr.create_session("Good", "").await.unwrap();
        // A log that does not start with SessionCreated.
        mgr.events()
            .append(&SessionEvent::notes("orphan", "x", 1))
            .await
            .unwrap();
        // Metadata without any log.
        mgr.store
            .put(
                "sessions/empty/metadata.json",
                b"{}".to_vec(),
                Metadata::new(),
            )
            .await
            .unwrap();

        let report = mgr.scan_sessions().await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.corrupted, 2);
    }
}
