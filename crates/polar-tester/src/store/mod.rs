//! Backend-agnostic key/value storage for sessions, artifacts, and logs.
//!
//! Keys are relative, `/`-separated paths such as
//! `sessions/{id}/policies/{policy_id}.polar`. Two backends implement
//! [`SessionStore`]:
//!
//! - [`LocalStore`]: files under a root directory.
//! - [`ObjectStoreBackend`]: any `object_store` implementation (S3, or
//!   in-memory for tests).
//!
//! The backend is chosen once from configuration
//! ([`StorageConfig::open`](crate::config::StorageConfig::open)); callers only
//! ever hold an `Arc<dyn SessionStore>`.

mod local;
mod object;

pub use local::LocalStore;
pub use object::ObjectStoreBackend;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;

/// String key/value pairs stored alongside an object.
pub type Metadata = BTreeMap<String, String>;

/// Boxed future returned by [`SessionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Object storage used by the event log and the session workflow.
///
/// Uses boxed futures so that the trait is dyn-compatible.
pub trait SessionStore: Send + Sync {
    /// Write an object, replacing any previous content and metadata.
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>, metadata: Metadata)
    -> StoreFuture<'a, ()>;

    /// Read an object. [`StoreError::NotFound`] if absent.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Keys starting with `prefix`, in lexicographic order.
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Remove an object. Removing a missing key succeeds.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Metadata written with the object. [`StoreError::NotFound`] if absent.
    fn metadata<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Metadata>;

    /// Append bytes to an object, creating it if needed.
    ///
    /// The default reads the whole object and writes it back with its
    /// metadata. Callers must serialise appends to one key themselves.
    fn append<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let (mut content, metadata) = read_for_append(self, key).await?;
            content.extend_from_slice(&bytes);
            self.put(key, content, metadata).await
        })
    }

    /// Append `line` as a record of its own. When the object does not end
    /// in `\n` (an earlier write was cut short), a newline is written first
    /// so the fragment stays on a separate line.
    ///
    /// The default is read-modify-write, like [`append`](Self::append).
    fn append_line<'a>(&'a self, key: &'a str, line: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let (mut content, metadata) = read_for_append(self, key).await?;
            if content.last().is_some_and(|b| *b != b'\n') {
                content.push(b'\n');
            }
            content.extend_from_slice(&line);
            self.put(key, content, metadata).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match self.metadata(key).await {
                Ok(_) => Ok(true),
                Err(StoreError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }
}

/// Current content and metadata of `key`, or empty ones if it is absent.
async fn read_for_append<S>(store: &S, key: &str) -> Result<(Vec<u8>, Metadata), StoreError>
where
    S: SessionStore + ?Sized,
{
    match store.get(key).await {
        Ok(content) => Ok((content, store.metadata(key).await?)),
        Err(StoreError::NotFound { .. }) => Ok((Vec::new(), Metadata::new())),
        Err(e) => Err(e),
    }
}

/// Reject keys that could escape the store root or alias another key:
/// empty keys, absolute paths, backslashes, and empty, `.`-prefixed, or
/// `..` segments.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment.starts_with('.'));
    if invalid {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
