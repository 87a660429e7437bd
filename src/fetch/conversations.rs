//! Inbox list for a profile: cache-first, one relational query on the happy
//! path, and a slower per-conversation reconstruction when that query fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexSet;
use tokio::time::Instant;

use crate::backend::{Backend, ParticipantColumn};
use crate::config::Config;
use crate::core::cache::ConversationCache;
use crate::core::dedup::QueryDeduplicator;
use crate::core::error::FetchError;
use crate::core::models::Conversation;
use crate::fetch::strategy::{run_chain, PageParams};

type ListResult = Result<Vec<Conversation>, FetchError>;

#[derive(Default)]
struct State {
    /// Profile the current list belongs to.
    profile_id: Option<String>,
    conversations: Vec<Conversation>,
    fetched_at: Option<Instant>,
    /// Automatic retry attempts since the last success or manual retry.
    attempts: u32,
    last_error: Option<FetchError>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    cache: Arc<ConversationCache>,
    dedup: QueryDeduplicator<ListResult>,
    state: Mutex<State>,
    config: Config,
}

#[derive(Clone)]
pub struct ConversationFetcher {
    inner: Arc<Inner>,
}

impl ConversationFetcher {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<ConversationCache>, config: &Config) -> Self {
        ConversationFetcher {
            inner: Arc::new(Inner {
                backend,
                cache,
                dedup: QueryDeduplicator::new(config.dedup_grace),
                state: Mutex::new(State::default()),
                config: config.clone(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last list delivered by a successful fetch.
    pub fn current(&self) -> Vec<Conversation> {
        self.state().conversations.clone()
    }

    pub fn last_error(&self) -> Option<FetchError> {
        self.state().last_error.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.state().attempts
    }

    /// One fetch of the conversation list, without automatic retry.
    pub async fn fetch(&self, profile_id: Option<&str>, force_fresh: bool) -> ListResult {
        let Some(profile_id) = profile_id.filter(|p| !p.is_empty()) else {
            log::warn!("Conversation fetch requested without a profile id");
            self.state().last_error = Some(FetchError::MissingProfile);
            return Err(FetchError::MissingProfile);
        };

        if !force_fresh {
            if let Some(list) = self.fresh_in_memory(profile_id) {
                log::debug!("Reusing {} in-memory conversations for {profile_id}", list.len());
                return Ok(list);
            }
            if let Some(cached) = self.inner.cache.get(profile_id).await {
                log::debug!("Serving {} cached conversations for {profile_id}", cached.len());
                self.store_success(profile_id, &cached);
                return Ok(cached);
            }
        }

        let key = format!("conversations:{profile_id}");
        let inner = Arc::clone(&self.inner);
        let pid = profile_id.to_string();
        let result = self
            .inner
            .dedup
            .fetch(&key, move || async move { inner.load(&pid).await })
            .await;

        match &result {
            Ok(list) => self.store_success(profile_id, list),
            Err(e) => {
                log::warn!("Conversation fetch failed for {profile_id}: {e}");
                self.state().last_error = Some(e.clone());
            }
        }
        result
    }

    /// `fetch` with automatic exponential back-off on transient failures,
    /// up to `max_retry_attempts` retries.
    pub async fn fetch_with_retry(&self, profile_id: Option<&str>, force_fresh: bool) -> ListResult {
        let mut force_fresh = force_fresh;
        loop {
            match self.fetch(profile_id, force_fresh).await {
                Ok(list) => return Ok(list),
                Err(e) if e.is_retryable() => {
                    let attempt = {
                        let mut state = self.state();
                        if state.attempts >= self.inner.config.max_retry_attempts {
                            log::error!(
                                "Giving up on conversations for {:?} after {} retries",
                                profile_id,
                                state.attempts
                            );
                            return Err(e);
                        }
                        state.attempts += 1;
                        state.attempts
                    };
                    let delay = self.retry_delay(attempt);
                    log::info!(
                        "Retrying conversations for {:?} in {:?} (attempt {} of {})",
                        profile_id,
                        delay,
                        attempt,
                        self.inner.config.max_retry_attempts
                    );
                    tokio::time::sleep(delay).await;
                    force_fresh = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// User-triggered retry: resets the attempt counter and refetches.
    pub async fn retry(&self, profile_id: Option<&str>) -> ListResult {
        self.state().attempts = 0;
        if let Some(pid) = profile_id {
            self.inner.dedup.forget(&format!("conversations:{pid}"));
        }
        self.fetch_with_retry(profile_id, true).await
    }

    /// Forget the in-memory list and in-flight markers (logout/session change).
    pub fn reset(&self) {
        *self.state() = State::default();
        self.inner.dedup.clear();
    }

    fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        self.inner
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.inner.config.backoff_cap)
    }

    fn fresh_in_memory(&self, profile_id: &str) -> Option<Vec<Conversation>> {
        let state = self.state();
        let same_profile = state.profile_id.as_deref() == Some(profile_id);
        let fresh = state
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.inner.config.conversation_ttl);
        (same_profile && fresh && !state.conversations.is_empty())
            .then(|| state.conversations.clone())
    }

    fn store_success(&self, profile_id: &str, list: &[Conversation]) {
        let mut state = self.state();
        state.profile_id = Some(profile_id.to_string());
        state.conversations = list.to_vec();
        state.fetched_at = Some(Instant::now());
        state.attempts = 0;
        state.last_error = None;
    }
}

impl Inner {
    async fn load(&self, profile_id: &str) -> ListResult {
        let mut list = match self
            .backend
            .conversations_joined(profile_id, self.config.conversation_message_limit)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                log::warn!(
                    "Joined conversation query failed for {profile_id}, reconstructing: {e}"
                );
                self.reconstruct(profile_id).await?
            }
        };

        list.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
        self.cache.set(profile_id, list.clone()).await;
        Ok(list)
    }

    /// Rebuild the list from unjoined reads: ids from both participant
    /// columns, then each conversation, its other participant and recent
    /// messages fetched individually.
    async fn reconstruct(&self, profile_id: &str) -> ListResult {
        let (as_user1, as_user2) = tokio::join!(
            self.backend
                .conversations_where(ParticipantColumn::User1, profile_id),
            self.backend
                .conversations_where(ParticipantColumn::User2, profile_id),
        );
        let (as_user1, as_user2) = match (as_user1, as_user2) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Participant queries failed for {profile_id}: {e}");
                return Err(e.into());
            }
        };

        let ids: IndexSet<String> = as_user1
            .into_iter()
            .chain(as_user2)
            .map(|row| row.id)
            .collect();
        log::info!(
            "Reconstructing {} conversations for {profile_id}",
            ids.len()
        );

        let mut list = Vec::with_capacity(ids.len());
        let mut failed = 0usize;
        for id in &ids {
            match self.rebuild_one(id, profile_id).await {
                Ok(Some(conversation)) => list.push(conversation),
                Ok(None) => log::debug!("Conversation {id} vanished during reconstruction"),
                Err(e) => {
                    failed += 1;
                    log::warn!("Rebuilding conversation {id} for {profile_id} failed: {e}");
                }
            }
        }

        // A partial inbox must not be cached or reported as success.
        if failed > 0 {
            log::error!(
                "Reconstruction for {profile_id} incomplete: {failed} of {} conversations failed",
                ids.len()
            );
            return Err(FetchError::Transient(format!(
                "{failed} of {} conversations could not be rebuilt",
                ids.len()
            )));
        }
        Ok(list)
    }

    async fn rebuild_one(
        &self,
        conversation_id: &str,
        profile_id: &str,
    ) -> Result<Option<Conversation>, FetchError> {
        let Some(row) = self.backend.conversation(conversation_id).await? else {
            return Ok(None);
        };

        let other_id = row.other_participant_id(profile_id).to_string();
        let other = match self.backend.profiles(&[other_id]).await {
            Ok(mut profiles) => profiles.pop(),
            Err(e) => {
                log::warn!("Profile lookup failed for conversation {conversation_id}: {e}");
                None
            }
        };

        let params = PageParams::latest(
            conversation_id,
            profile_id,
            self.config.conversation_message_limit,
        );
        let (messages, _) =
            run_chain(self.backend.as_ref(), &params, self.config.allow_unscoped_fallback).await?;

        Ok(Some(Conversation::from_row(row, messages, other)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendOp, MemoryBackend};
    use crate::core::cache::TieredCache;
    use crate::core::models::{ConversationRow, ConversationStatus, Message, ProfileSummary};
    use crate::core::store::StoreKind;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn profile(id: &str) -> ProfileSummary {
        ProfileSummary {
            id: id.into(),
            username: Some(format!("{id}-user")),
            full_name: None,
            avatar_url: None,
        }
    }

    fn seeded() -> Arc<MemoryBackend> {
        Arc::new(seed(MemoryBackend::new()))
    }

    fn seed(backend: MemoryBackend) -> MemoryBackend {
        for p in ["a", "b", "c", "d"] {
            backend.add_profile(profile(p));
        }
        let rows = [("c1", "a", "b"), ("c2", "c", "a"), ("c3", "b", "c"), ("c4", "a", "d")];
        for (i, (id, u1, u2)) in rows.into_iter().enumerate() {
            backend.add_conversation(ConversationRow {
                id: id.into(),
                user1_id: u1.into(),
                user2_id: u2.into(),
                status: ConversationStatus::Active,
            });
            backend.add_message(Message {
                id: format!("{id}-m"),
                conversation_id: id.into(),
                sender_id: u2.into(),
                content: "hey".into(),
                created_at: 100 * (i as i64 + 1),
                read_at: None,
                media_type: None,
                media_url: None,
                sender: None,
            });
        }
        backend
    }

    fn fetcher_with(backend: Arc<MemoryBackend>, config: Config) -> ConversationFetcher {
        let cache = Arc::new(TieredCache::new(
            StoreKind::Profiles,
            config.conversation_ttl,
            None,
        ));
        ConversationFetcher::new(backend, cache, &config)
    }

    fn fetcher(backend: Arc<MemoryBackend>) -> ConversationFetcher {
        fetcher_with(backend, Config::default())
    }

    fn ids(list: &[Conversation]) -> BTreeSet<String> {
        list.iter().map(|c| c.id.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn missing_profile_sets_error() {
        let f = fetcher(seeded());
        assert_eq!(f.fetch(None, false).await, Err(FetchError::MissingProfile));
        assert_eq!(f.last_error(), Some(FetchError::MissingProfile));
        assert_eq!(f.fetch(Some(""), false).await, Err(FetchError::MissingProfile));
    }

    #[tokio::test(start_paused = true)]
    async fn primary_path_orders_by_latest_activity() {
        let f = fetcher(seeded());
        let list = f.fetch(Some("a"), false).await.unwrap();
        let order: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, ["c4", "c2", "c1"]);
        assert_eq!(
            list[0].other_participant.as_ref().map(|p| p.id.as_str()),
            Some("d")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_reconstruction_matches_direct_queries() {
        let backend = seeded();
        backend.fail(BackendOp::ConversationsJoined);
        let f = fetcher(backend.clone());

        let list = f.fetch(Some("a"), true).await.unwrap();

        let mut expected = BTreeSet::new();
        for column in [ParticipantColumn::User1, ParticipantColumn::User2] {
            for row in backend.conversations_where(column, "a").await.unwrap() {
                expected.insert(row.id);
            }
        }
        assert_eq!(ids(&list), expected);
        let c2 = list.iter().find(|c| c.id == "c2").unwrap();
        assert_eq!(c2.other_participant.as_ref().map(|p| p.id.as_str()), Some("c"));
        assert_eq!(c2.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_list_short_circuits() {
        let backend = seeded();
        let f = fetcher(backend.clone());
        f.fetch(Some("a"), false).await.unwrap();
        f.fetch(Some("a"), false).await.unwrap();
        assert_eq!(backend.calls(BackendOp::ConversationsJoined), 1);

        // Past the dedup grace window a forced fetch goes to the backend again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.fetch(Some("a"), true).await.unwrap();
        assert_eq!(backend.calls(BackendOp::ConversationsJoined), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_query() {
        let backend = Arc::new(seed(
            MemoryBackend::new().with_latency(Duration::from_millis(20)),
        ));
        let f = fetcher(backend.clone());
        let (a, b) = tokio::join!(f.fetch(Some("a"), true), f.fetch(Some("a"), true));
        assert_eq!(ids(&a.unwrap()), ids(&b.unwrap()));
        assert_eq!(backend.calls(BackendOp::ConversationsJoined), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_recovers_from_transient_failures() {
        let backend = seeded();
        backend.fail(BackendOp::ConversationsJoined);
        backend.fail_times(BackendOp::ConversationsWhere, 2);
        let f = fetcher(backend.clone());

        let list = f.fetch_with_retry(Some("a"), true).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(f.attempts(), 0);
        assert_eq!(f.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_gives_up_and_manual_retry_resets() {
        let backend = seeded();
        backend.fail(BackendOp::ConversationsJoined);
        backend.fail(BackendOp::ConversationsWhere);
        let f = fetcher(backend.clone());

        let err = f.fetch_with_retry(Some("a"), true).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.attempts(), 3);
        assert_eq!(backend.calls(BackendOp::ConversationsJoined), 4);

        backend.heal(BackendOp::ConversationsJoined);
        let list = f.retry(Some("a")).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(f.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_reconstruction_is_neither_cached_nor_reported_as_success() {
        let backend = seeded();
        backend.fail(BackendOp::ConversationsJoined);
        backend.fail_times(BackendOp::Conversation, 1);
        let f = fetcher(backend.clone());

        let err = f.fetch(Some("a"), true).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.last_error(), Some(err));
        assert!(f.current().is_empty());
        assert!(!f.inner.cache.has("a"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let list = f.fetch(Some("a"), false).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(f.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_completes_interrupted_reconstruction() {
        let backend = seeded();
        backend.fail(BackendOp::ConversationsJoined);
        backend.fail_times(BackendOp::Conversation, 1);
        let f = fetcher(backend.clone());

        let list = f.fetch_with_retry(Some("a"), true).await.unwrap();
        assert_eq!(ids(&list), BTreeSet::from(["c1", "c2", "c4"].map(String::from)));
        assert_eq!(f.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_profile() {
        let f = fetcher(seeded());
        f.fetch(Some("a"), false).await.unwrap();
        f.reset();
        assert!(f.current().is_empty());
    }
}
