//! Filesystem backend.
//!
//! Layout under `root`:
//!
//! ```text
//! root/
//!   events/{session_id}.jsonl
//!   sessions/{session_id}/metadata.json
//!   sessions/{session_id}/policies/{policy_id}.polar
//!   .meta/<key>.json          metadata sidecars
//! ```

use std::path::{Path, PathBuf};

use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

use super::{Metadata, SessionStore, StoreFuture, validate_key};
use crate::error::StoreError;

const META_DIR: &str = ".meta";

/// Stores each key as a file under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    /// Atomic write: write a hidden temp file beside the target, then rename.
    async fn write_atomic(key: &str, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(key, e));
        }
        Ok(())
    }

    async fn remove_if_present(key: &str, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn put_impl(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> Result<(), StoreError> {
        let path = self.path(key)?;
        Self::write_atomic(key, &path, &bytes).await?;

        let meta_path = self.meta_path(key);
        if metadata.is_empty() {
            Self::remove_if_present(key, &meta_path).await?;
        } else {
            let json = serde_json::to_vec_pretty(&metadata).map_err(|e| StoreError::Io {
                key: key.to_string(),
                source: e.into(),
            })?;
            Self::write_atomic(key, &meta_path, &json).await?;
        }
        trace!("Stored {key} ({} bytes)", bytes.len());
        Ok(())
    }

    async fn get_impl(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(key, e))
    }

    async fn list_impl(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Only walk the directory named by the prefix up to its last '/'.
        let base = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let mut keys = Vec::new();
        let mut pending = vec![(
            self.root.join(base),
            if base.is_empty() {
                String::new()
            } else {
                format!("{base}/")
            },
        )];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(prefix, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                // Hidden entries are temp files and the metadata sidecars.
                if name.starts_with('.') {
                    continue;
                }
                let key = format!("{key_prefix}{name}");
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(&key, e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_impl(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        Self::remove_if_present(key, &path).await?;
        Self::remove_if_present(key, &self.meta_path(key)).await
    }

    async fn metadata_impl(&self, key: &str) -> Result<Metadata, StoreError> {
        let path = self.path(key)?;
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(key, e))?
        {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        match tokio::fs::read(self.meta_path(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Io {
                key: key.to_string(),
                source: e.into(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn open_append(&self, key: &str) -> Result<tokio::fs::File, StoreError> {
        let path = self.path(key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(key, e))
    }

    /// `O_APPEND` write; each call lands as one contiguous write.
    async fn append_impl(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut file = self.open_append(key).await?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.flush().await.map_err(|e| StoreError::io(key, e))
    }

    /// Checks the last byte in place instead of reading the whole file.
    async fn append_line_impl(&self, key: &str, line: Vec<u8>) -> Result<(), StoreError> {
        let mut file = self.open_append(key).await?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(key, e))?
            .len();

        let mut buf = Vec::with_capacity(line.len() + 1);
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .await
                .map_err(|e| StoreError::io(key, e))?;
            file.read_exact(&mut last)
                .await
                .map_err(|e| StoreError::io(key, e))?;
            if last[0] != b'\n' {
                buf.push(b'\n');
            }
        }
        buf.extend_from_slice(&line);
        // O_APPEND puts the write at the end regardless of the seek above.
        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.flush().await.map_err(|e| StoreError::io(key, e))
    }
}

impl SessionStore for LocalStore {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>, metadata: Metadata) -> StoreFuture<'a, ()> {
        Box::pin(self.put_impl(key, bytes, metadata))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(self.get_impl(key))
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(self.list_impl(prefix))
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.delete_impl(key))
    }

    fn metadata<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Metadata> {
        Box::pin(self.metadata_impl(key))
    }

    fn append<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(self.append_impl(key, bytes))
    }

    fn append_line<'a>(&'a self, key: &'a str, line: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(self.append_line_impl(key, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn put_get_round_trip_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store
            .put(
                "sessions/s1/policies/p1.polar",
                b"actor User {}".to_vec(),
                meta(&[("content-type", "text/x-polar")]),
            )
            .await
            .unwrap();

        assert_eq!(
            store.get("sessions/s1/policies/p1.polar").await.unwrap(),
            b"actor User {}"
        );
        assert_eq!(
            store.metadata("sessions/s1/policies/p1.polar").await.unwrap(),
            meta(&[("content-type", "text/x-polar")])
        );
        assert!(store.exists("sessions/s1/policies/p1.polar").await.unwrap());
    }

    #[tokio::test]
    async fn put_replaces_content_and_clears_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("a", b"one".to_vec(), meta(&[("k", "v")])).await.unwrap();
        store.put("a", b"two".to_vec(), Metadata::new()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"two");
        assert!(store.metadata("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.metadata("nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_prefix_filtered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        for key in [
            "sessions/b/metadata.json",
            "sessions/a/metadata.json",
            "sessions/a/policies/p.polar",
            "events/a.jsonl",
        ] {
            store.put(key, Vec::new(), meta(&[("x", "y")])).await.unwrap();
        }

        assert_eq!(
            store.list("sessions/").await.unwrap(),
            vec![
                "sessions/a/metadata.json",
                "sessions/a/policies/p.polar",
                "sessions/b/metadata.json",
            ]
        );
        assert_eq!(store.list("events/a").await.unwrap(), vec!["events/a.jsonl"]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("k", b"v".to_vec(), meta(&[("a", "b")])).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
        assert!(!dir.path().join(".meta/k.json").exists());
    }

    #[tokio::test]
    async fn append_creates_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.append("events/s.jsonl", b"one\n".to_vec()).await.unwrap();
        store.append("events/s.jsonl", b"two\n".to_vec()).await.unwrap();
        assert_eq!(store.get("events/s.jsonl").await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn append_line_terminates_a_cut_off_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.append_line("log", b"one\n".to_vec()).await.unwrap();
        store.append("log", b"tw".to_vec()).await.unwrap();
        store.append_line("log", b"three\n".to_vec()).await.unwrap();
        store.append_line("log", b"four\n".to_vec()).await.unwrap();
        assert_eq!(store.get("log").await.unwrap(), b"one\ntw\nthree\nfour\n");
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("root"));
        let err = store
            .put("../escape", b"x".to_vec(), Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn no_temp_files_left_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("a/b", b"x".to_vec(), Metadata::new()).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b"]);
    }
}
