//! Per-key async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// A lazily populated map of async mutexes, one per key. Holders of
/// different keys never contend.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn same_key_is_exclusive_and_keys_are_independent() {
        let locks = KeyedLocks::default();
        let wait = Duration::from_millis(50);

        let held = locks.lock("a").await;
        assert!(timeout(wait, locks.lock("a")).await.is_err());
        let _other = timeout(wait, locks.lock("b")).await.unwrap();

        drop(held);
        assert!(timeout(wait, locks.lock("a")).await.is_ok());
    }
}
