//! Two-tier (memory + persistent) cache for message and conversation lists.
//!
//! Reads are served from memory while the entry is fresh, otherwise from the
//! SQLite store (promoting the hit back into memory). Writes go to both tiers;
//! the persistent write is best-effort and only logged on failure.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::models::{now_millis, sort_ascending, CacheEntry, Conversation, Message};
use crate::core::store::{CacheHandle, StoreKind};

pub struct TieredCache<T> {
    store: StoreKind,
    ttl: Duration,
    memory: Mutex<HashMap<String, CacheEntry<T>>>,
    persistent: Option<CacheHandle>,
}

/// Conversation id → messages, ascending.
pub type MessageCache = TieredCache<Message>;
/// Profile id → conversation list.
pub type ConversationCache = TieredCache<Conversation>;

impl<T> TieredCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// `persistent` may be `None` to run memory-only (e.g. when the database
    /// could not be opened).
    pub fn new(store: StoreKind, ttl: Duration, persistent: Option<CacheHandle>) -> Self {
        TieredCache {
            store,
            ttl,
            memory: Mutex::new(HashMap::new()),
            persistent,
        }
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ttl_ms(&self) -> i64 {
        self.ttl.as_millis() as i64
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<Vec<T>> {
        let now = now_millis();
        {
            let mut memory = self.memory();
            match memory.get(key) {
                Some(entry) if entry.is_fresh(now, self.ttl_ms()) => {
                    return Some(entry.data.clone());
                }
                Some(_) => {
                    log::debug!("Memory cache entry for {key} expired");
                    memory.remove(key);
                }
                None => {}
            }
        }

        let persistent = self.persistent.as_ref()?;
        match persistent.load_entry::<T>(self.store, key).await {
            Ok(Some(entry)) if entry.is_fresh(now, self.ttl_ms()) => {
                log::debug!("Promoting persistent cache entry for {key} into memory");
                let data = entry.data.clone();
                self.memory().insert(key.to_string(), entry);
                Some(data)
            }
            Ok(Some(_)) => {
                log::debug!("Persistent cache entry for {key} expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Persistent cache read failed for {key}: {e}");
                None
            }
        }
    }

    /// Write `data` through to both tiers, stamped with the current time.
    pub async fn set(&self, key: &str, data: Vec<T>) {
        let entry = CacheEntry::new(data, now_millis());
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.save_entry(self.store, key, &entry).await {
                log::warn!("Persistent cache write failed for {key}: {e}");
            }
        }
        self.memory().insert(key.to_string(), entry);
    }

    /// Memory-only check for a fresh entry.
    pub fn has(&self, key: &str) -> bool {
        self.memory()
            .get(key)
            .is_some_and(|e| e.is_fresh(now_millis(), self.ttl_ms()))
    }

    /// Timestamp of the memory entry, if any.
    pub fn cached_at(&self, key: &str) -> Option<i64> {
        self.memory().get(key).map(|e| e.timestamp)
    }

    pub async fn clear(&self, key: &str) {
        self.memory().remove(key);
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.delete_entry(self.store, key).await {
                log::warn!("Persistent cache delete failed for {key}: {e}");
            }
        }
    }

    pub async fn clear_all(&self) {
        self.memory().clear();
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.clear_store(self.store).await {
                log::warn!("Persistent cache clear failed for {:?}: {e}", self.store);
            }
        }
    }
}

impl TieredCache<Message> {
    /// Append to an existing entry. Returns false when nothing is cached for
    /// `key` or a message with the same id is already present.
    pub async fn add_message(&self, key: &str, message: Message) -> bool {
        let Some(mut messages) = self.get(key).await else {
            log::debug!("Not caching message {} for {key}: no existing entry", message.id);
            return false;
        };
        if messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        messages.push(message);
        sort_ascending(&mut messages);
        self.set(key, messages).await;
        true
    }

    /// Merge `incoming` into the cached list (ids deduplicated, newer copy
    /// wins) and return the merged list. Creates the entry if absent.
    pub async fn merge(&self, key: &str, incoming: Vec<Message>) -> Vec<Message> {
        let existing = self.get(key).await.unwrap_or_default();
        let merged = merge_messages(existing, incoming);
        self.set(key, merged.clone()).await;
        merged
    }

    /// Stamp `read_at` on cached messages `reader_id` did not send.
    /// Returns the number of messages changed.
    pub async fn mark_read(&self, key: &str, reader_id: &str, read_at: i64) -> usize {
        let Some(mut messages) = self.get(key).await else {
            return 0;
        };
        let mut changed = 0;
        for m in messages.iter_mut().filter(|m| m.is_unread_for(reader_id)) {
            m.read_at = Some(read_at);
            changed += 1;
        }
        if changed > 0 {
            self.set(key, messages).await;
        }
        changed
    }
}

/// Union of two message lists by id, ascending. Entries in `incoming`
/// replace same-id entries in `existing`.
pub fn merge_messages(existing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut by_id: IndexMap<String, Message> = IndexMap::with_capacity(existing.len() + incoming.len());
    for m in existing.into_iter().chain(incoming) {
        by_id.insert(m.id.clone(), m);
    }
    let mut merged: Vec<Message> = by_id.into_values().collect();
    sort_ascending(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, created_at: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: "other".into(),
            content: format!("body {id}"),
            created_at,
            read_at: None,
            media_type: None,
            media_url: None,
            sender: None,
        }
    }

    fn memory_cache(ttl: Duration) -> MessageCache {
        TieredCache::new(StoreKind::Conversations, ttl, None)
    }

    #[tokio::test]
    async fn set_then_get_returns_same_data() {
        let cache = memory_cache(Duration::from_secs(60));
        let data = vec![msg("m1", 1), msg("m2", 2)];
        cache.set("c1", data.clone()).await;
        assert_eq!(cache.get("c1").await, Some(data));
        assert!(cache.has("c1"));
    }

    #[tokio::test]
    async fn unknown_key_misses() {
        let cache = memory_cache(Duration::from_secs(60));
        assert!(!cache.has("nope"));
        assert_eq!(cache.get("nope").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let cache = memory_cache(Duration::ZERO);
        cache.set("c1", vec![msg("m1", 1)]).await;
        assert!(!cache.has("c1"));
        assert_eq!(cache.get("c1").await, None);
    }

    #[tokio::test]
    async fn add_message_requires_existing_entry() {
        let cache = memory_cache(Duration::from_secs(60));
        assert!(!cache.add_message("c1", msg("m1", 1)).await);
        assert!(!cache.has("c1"));
    }

    #[tokio::test]
    async fn add_message_dedupes_by_id() {
        let cache = memory_cache(Duration::from_secs(60));
        cache.set("c1", vec![msg("m1", 1)]).await;

        assert!(cache.add_message("c1", msg("m2", 2)).await);
        assert!(!cache.add_message("c1", msg("m2", 2)).await);
        assert_eq!(cache.get("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persistent_hit_is_promoted() {
        let handle = CacheHandle::open_in_memory().unwrap();
        let writer = memory_cache_with(handle.clone());
        writer.set("c1", vec![msg("m1", 1)]).await;

        // Fresh instance sharing the same store: memory is cold.
        let reader = memory_cache_with(handle);
        assert!(!reader.has("c1"));
        assert_eq!(reader.get("c1").await.map(|v| v.len()), Some(1));
        assert!(reader.has("c1"));
    }

    #[tokio::test]
    async fn clear_removes_both_tiers() {
        let handle = CacheHandle::open_in_memory().unwrap();
        let cache = memory_cache_with(handle.clone());
        cache.set("c1", vec![msg("m1", 1)]).await;
        cache.set("c2", vec![msg("m2", 1)]).await;

        cache.clear("c1").await;
        assert_eq!(cache.get("c1").await, None);
        assert!(cache.get("c2").await.is_some());

        cache.clear_all().await;
        assert_eq!(cache.get("c2").await, None);
        assert_eq!(handle.entry_count(StoreKind::Conversations).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_only_touches_other_senders() {
        let cache = memory_cache(Duration::from_secs(60));
        let mut mine = msg("m0", 0);
        mine.sender_id = "me".into();
        cache.set("c1", vec![mine, msg("m1", 1), msg("m2", 2)]).await;

        assert_eq!(cache.mark_read("c1", "me", 99).await, 2);
        let after = cache.get("c1").await.unwrap();
        assert!(after.iter().all(|m| !m.is_unread_for("me")));
        assert_eq!(after[0].read_at, None);
        assert_eq!(cache.mark_read("c1", "me", 100).await, 0);
    }

    #[test]
    fn merge_prefers_incoming_copy() {
        let mut updated = msg("m1", 1);
        updated.read_at = Some(5);
        let merged = merge_messages(vec![msg("m1", 1), msg("m3", 3)], vec![updated, msg("m2", 2)]);
        let ids: Vec<_> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(merged[0].read_at, Some(5));
    }

    fn memory_cache_with(handle: CacheHandle) -> MessageCache {
        TieredCache::new(StoreKind::Conversations, Duration::from_secs(60), Some(handle))
    }
}
