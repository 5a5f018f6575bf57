//! `object_store` backend (S3 and compatible services, or in-memory).

use std::sync::Arc;

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutOptions, PutPayload,
};
use tracing::{debug, trace};

use super::{Metadata, SessionStore, StoreFuture, validate_key};
use crate::error::StoreError;

/// Stores keys as objects, optionally below a fixed key prefix.
///
/// Metadata is written as object attributes (`x-amz-meta-*` on S3).
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    inner: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            prefix: String::new(),
        }
    }

    /// Scope every key below `prefix` (leading and trailing `/` ignored).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    /// Non-persistent backend for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// S3 bucket backend. Credentials come from the standard `AWS_*`
    /// environment variables; `endpoint` selects an S3-compatible service.
    pub fn s3(bucket: &str, region: Option<&str>, endpoint: Option<&str>) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder.build()?;
        debug!("Opened S3 store: bucket={bucket}, region={region:?}, endpoint={endpoint:?}");
        Ok(Self::new(Arc::new(store)))
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else if key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    fn location(&self, key: &str) -> Result<Path, StoreError> {
        validate_key(key)?;
        Path::parse(self.full_key(key)).map_err(|_| StoreError::InvalidKey {
            key: key.to_string(),
        })
    }

    fn not_found(key: &str, err: object_store::Error) -> StoreError {
        match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound {
                key: key.to_string(),
            },
            other => StoreError::ObjectStore(other),
        }
    }

    async fn put_impl(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> Result<(), StoreError> {
        let location = self.location(key)?;
        let mut attributes = Attributes::new();
        for (k, v) in metadata {
            attributes.insert(Attribute::Metadata(k.into()), AttributeValue::from(v));
        }
        let len = bytes.len();
        self.inner
            .put_opts(
                &location,
                PutPayload::from(bytes),
                PutOptions {
                    attributes,
                    ..Default::default()
                },
            )
            .await?;
        trace!("Stored {location} ({len} bytes)");
        Ok(())
    }

    async fn get_impl(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let location = self.location(key)?;
        let result = self
            .inner
            .get(&location)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        let bytes = result.bytes().await.map_err(|e| Self::not_found(key, e))?;
        Ok(bytes.to_vec())
    }

    async fn list_impl(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let base = self.full_key(base);
        let base = if base.is_empty() {
            None
        } else {
            Some(Path::parse(&base).map_err(|_| StoreError::InvalidKey {
                key: prefix.to_string(),
            })?)
        };

        let objects: Vec<_> = self.inner.list(base.as_ref()).try_collect().await?;
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let mut keys: Vec<String> = objects
            .into_iter()
            .filter_map(|meta| {
                let location: &str = meta.location.as_ref();
                location.strip_prefix(strip.as_str()).map(str::to_string)
            })
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_impl(&self, key: &str) -> Result<(), StoreError> {
        let location = self.location(key)?;
        match self.inner.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata_impl(&self, key: &str) -> Result<Metadata, StoreError> {
        let location = self.location(key)?;
        let result = self
            .inner
            .get_opts(
                &location,
                GetOptions {
                    head: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(result
            .attributes
            .iter()
            .filter_map(|(attr, value)| match attr {
                Attribute::Metadata(name) => {
                    Some((name.to_string(), AsRef::<str>::as_ref(value).to_string()))
                }
                _ => None,
            })
            .collect())
    }
}

impl SessionStore for ObjectStoreBackend {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_metadata_in_memory() {
        let store = ObjectStoreBackend::in_memory();
        let mut meta = Metadata::new();
        meta.insert("session_name".into(), "Docs".into());
        store
            .put("sessions/s1/metadata.json", b"{}".to_vec(), meta.clone())
            .await
            .unwrap();

        assert_eq!(store.get("sessions/s1/metadata.json").await.unwrap(), b"{}");
        assert_eq!(store.metadata("sessions/s1/metadata.json").await.unwrap(), meta);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = ObjectStoreBackend::in_memory();
        assert!(matches!(
            store.get("events/x.jsonl").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.exists("events/x.jsonl").await.unwrap());
    }

    #[tokio::test]
    async fn prefix_scopes_keys_and_list_strips_it() {
        let shared: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let scoped = ObjectStoreBackend::new(shared.clone()).with_prefix("/polar/");
        let other = ObjectStoreBackend::new(shared);

        scoped.put("events/b.jsonl", Vec::new(), Metadata::new()).await.unwrap();
        scoped.put("events/a.jsonl", Vec::new(), Metadata::new()).await.unwrap();
        other.put("events/z.jsonl", Vec::new(), Metadata::new()).await.unwrap();

        assert_eq!(
            scoped.list("events/").await.unwrap(),
            vec!["events/a.jsonl", "events/b.jsonl"]
        );
        assert!(other.exists("polar/events/a.jsonl").await.unwrap());
        assert_eq!(other.list("events/").await.unwrap(), vec!["events/z.jsonl"]);
    }

    #[tokio::test]
    async fn default_append_reads_modifies_and_keeps_metadata() {
        let store = ObjectStoreBackend::in_memory();
        let mut meta = Metadata::new();
        meta.insert("kind".into(), "log".into());
        store.put("events/s.jsonl", b"a\n".to_vec(), meta.clone()).await.unwrap();
        store.append("events/s.jsonl", b"b\n".to_vec()).await.unwrap();
        store.append("events/new.jsonl", b"c\n".to_vec()).await.unwrap();

        assert_eq!(store.get("events/s.jsonl").await.unwrap(), b"a\nb\n");
        assert_eq!(store.metadata("events/s.jsonl").await.unwrap(), meta);
        assert_eq!(store.get("events/new.jsonl").await.unwrap(), b"c\n");
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = ObjectStoreBackend::in_memory();
        store.delete("nothing/here").await.unwrap();
        store.put("k", b"v".to_vec(), Metadata::new()).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }
}
