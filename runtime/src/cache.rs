//! Single-flight client cache: at most one connection-building operation
//! runs at a time for a given cache instance, and every caller that arrives
//! while one is in flight awaits and reuses its result instead of racing a
//! second connection attempt.
//!
//! The cache is guarded by a semaphore of capacity 1 per cache instance
//! (not per key): a transport crate typically holds one `ClientCache<C>` per
//! broker client type it manages, not one per entity name.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};

/// Caches a single lazily constructed client of type `C`, building it at
/// most once even under concurrent first access.
pub struct ClientCache<C> {
    semaphore: Semaphore,
    slot: Mutex<Option<C>>,
}

impl<C: Clone> ClientCache<C> {
    /// Build an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
            slot: Mutex::new(None),
        }
    }

    /// Return the cached client, building it with `build` on first access.
    ///
    /// If two callers race, the first to acquire the semaphore permit runs
    /// `build`; the second observes the now-populated slot and never calls
    /// `build` at all.
    ///
    /// # Errors
    ///
    /// Propagates whatever error `build` returns; the cache remains empty
    /// so a later caller may retry construction.
    pub async fn get_or_init<F, Fut, E>(&self, build: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<C, E>>,
    {
        if let Some(client) = self.slot.lock().await.as_ref() {
            return Ok(client.clone());
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut slot = self.slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = build().await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached client, forcing the next [`Self::get_or_init`] call
    /// to rebuild it. Used after a connection is found to be broken beyond
    /// what retry/circuit-breaking can repair.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

impl<C: Clone> Default for ClientCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn builds_once_under_concurrent_access() {
        let cache = Arc::new(ClientCache::<u32>::new());
        let build_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let build_count = Arc::clone(&build_count);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_init(|| async {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok::<_, String>(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let cache = ClientCache::<u32>::new();
        let build_count = AtomicUsize::new(0);

        let first = cache
            .get_or_init(|| async {
                build_count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await
            .unwrap();
        assert_eq!(first, 1);

        cache.invalidate().await;

        let second = cache
            .get_or_init(|| async {
                build_count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(2)
            })
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(build_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn build_error_leaves_cache_empty_for_retry() {
        let cache = ClientCache::<u32>::new();
        let attempt = AtomicUsize::new(0);

        let err = cache
            .get_or_init(|| async {
                attempt.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>("boom".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let ok = cache
            .get_or_init(|| async {
                attempt.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }
}
