use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

type InFlight<T> = Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>>;

/// Collapses concurrent fetches for the same key onto one underlying future.
///
/// The first caller for a key starts the work; everyone arriving while it is
/// in flight, or within `grace` after it completes, receives the same result.
pub struct QueryDeduplicator<T: Clone> {
    inflight: InFlight<T>,
    grace: Duration,
}

impl<T> QueryDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        QueryDeduplicator {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    fn lock<'a>(
        map: &'a Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
    ) -> MutexGuard<'a, HashMap<String, Shared<BoxFuture<'static, T>>>> {
        map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `start()` for `key` unless an identical fetch is already pending.
    pub async fn fetch<F, Fut>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = Self::lock(&self.inflight);
            if let Some(existing) = inflight.get(key) {
                log::debug!("Joining in-flight fetch for {key}");
                existing.clone()
            } else {
                let fut = start().boxed().shared();
                inflight.insert(key.to_string(), fut.clone());
                self.schedule_cleanup(key.to_string(), fut.clone());
                fut
            }
        };
        shared.await
    }

    /// Drive the shared future to completion and forget it after the grace window.
    fn schedule_cleanup(&self, key: String, fut: Shared<BoxFuture<'static, T>>) {
        let inflight = Arc::clone(&self.inflight);
        let grace = self.grace;
        tokio::spawn(async move {
            fut.clone().await;
            tokio::time::sleep(grace).await;
            let mut map = Self::lock(&inflight);
            // A newer fetch may have replaced this one after `forget`.
            if map.get(&key).is_some_and(|current| current.ptr_eq(&fut)) {
                map.remove(&key);
            }
        });
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        Self::lock(&self.inflight).contains_key(key)
    }

    /// Drop the entry for `key` so the next caller starts a new fetch, even
    /// inside the grace window.
    pub fn forget(&self, key: &str) {
        Self::lock(&self.inflight).remove(key);
    }

    /// Forget every pending entry. Work already started keeps running.
    pub fn clear(&self) {
        Self::lock(&self.inflight).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                7
            }
        };

        let (a, b) = tokio::join!(
            dedup.fetch("c1", make(calls.clone())),
            dedup.fetch("c1", make(calls.clone())),
        );
        assert_eq!((a, b), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_separately() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let (a, b) = tokio::join!(
            dedup.fetch("a", move || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                1
            }),
            dedup.fetch("b", move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                2
            }),
        );
        assert_eq!((a, b), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_grace_window() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_millis(100));
        assert_eq!(dedup.fetch("k", || async { 1 }).await, 1);

        // Within the grace window the completed result is reused.
        assert_eq!(dedup.fetch("k", || async { 2 }).await, 1);
        assert!(dedup.is_in_flight("k"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dedup.is_in_flight("k"));
        assert_eq!(dedup.fetch("k", || async { 3 }).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_starts_a_new_fetch() {
        let dedup = QueryDeduplicator::<u32>::new(Duration::from_millis(100));
        assert_eq!(dedup.fetch("k", || async { 1 }).await, 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        dedup.forget("k");
        assert_eq!(dedup.fetch("k", || async { 2 }).await, 2);

        // The first fetch's cleanup fires at ~100ms and must leave the
        // replacement alone.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dedup.fetch("k", || async { 3 }).await, 2);
    }
}
