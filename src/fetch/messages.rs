//! Message retrieval for a single conversation: cache-first initial load,
//! cursor pagination towards older messages, and per-conversation back-off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::config::Config;
use crate::core::cache::MessageCache;
use crate::core::dedup::QueryDeduplicator;
use crate::core::error::FetchError;
use crate::core::models::{now_millis, Message};
use crate::fetch::strategy::{run_chain, PageParams};

/// Published when background revalidation merged newer messages into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesUpdated {
    pub conversation_id: String,
    /// Full merged list, ascending.
    pub messages: Vec<Message>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FailureState {
    consecutive: u32,
    retry_after: Option<Instant>,
}

type FetchResult = Result<Vec<Message>, FetchError>;

struct Inner {
    backend: Arc<dyn Backend>,
    cache: Arc<MessageCache>,
    dedup: QueryDeduplicator<FetchResult>,
    failures: Mutex<HashMap<String, FailureState>>,
    updates: broadcast::Sender<MessagesUpdated>,
    config: Config,
}

#[derive(Clone)]
pub struct MessageFetcher {
    inner: Arc<Inner>,
}

impl MessageFetcher {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<MessageCache>, config: &Config) -> Self {
        let (updates, _) = broadcast::channel(64);
        MessageFetcher {
            inner: Arc::new(Inner {
                backend,
                cache,
                dedup: QueryDeduplicator::new(config.dedup_grace),
                failures: Mutex::new(HashMap::new()),
                updates,
                config: config.clone(),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.config.page_size
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessagesUpdated> {
        self.inner.updates.subscribe()
    }

    /// Initial page for a conversation.
    ///
    /// With `use_cache`, a fresh cache entry is returned immediately and a
    /// background check for newer messages is started; its result arrives via
    /// [`MessageFetcher::subscribe`]. Otherwise ownership is verified and the
    /// newest page is queried through the fallback chain. Concurrent calls
    /// for the same conversation and profile share one query.
    pub async fn fetch_initial(
        &self,
        conversation_id: &str,
        profile_id: &str,
        use_cache: bool,
    ) -> FetchResult {
        if conversation_id.is_empty() {
            return Err(FetchError::MissingConversation);
        }
        if profile_id.is_empty() {
            return Err(FetchError::MissingProfile);
        }

        if use_cache {
            if let Some(cached) = self.inner.cache.get(conversation_id).await {
                log::debug!(
                    "Serving {} cached messages for {conversation_id}",
                    cached.len()
                );
                let newest = cached.last().map(|m| m.created_at);
                self.spawn_revalidation(conversation_id, profile_id, newest);
                return Ok(cached);
            }
        }

        self.inner.check_backoff(conversation_id)?;

        let key = format!("messages:{conversation_id}:{profile_id}");
        let inner = Arc::clone(&self.inner);
        let cid = conversation_id.to_string();
        let pid = profile_id.to_string();
        self.inner
            .dedup
            .fetch(&key, move || async move { inner.load_initial(&cid, &pid).await })
            .await
    }

    /// One page older than the oldest cached message, prepended to the cache.
    ///
    /// Returns `Ok(None)` without querying when `has_more` is false or there
    /// is no cached baseline to page from.
    pub async fn fetch_more(
        &self,
        conversation_id: &str,
        profile_id: &str,
        has_more: bool,
    ) -> Result<Option<Vec<Message>>, FetchError> {
        if !has_more {
            return Ok(None);
        }
        let Some(oldest) = self
            .inner
            .cache
            .get(conversation_id)
            .await
            .and_then(|cached| cached.first().map(|m| m.created_at))
        else {
            log::debug!("No cached baseline to page from for {conversation_id}");
            return Ok(None);
        };

        self.inner.check_backoff(conversation_id)?;

        let key = format!("messages-before:{conversation_id}:{profile_id}:{oldest}");
        let inner = Arc::clone(&self.inner);
        let cid = conversation_id.to_string();
        let pid = profile_id.to_string();
        let page = self
            .inner
            .dedup
            .fetch(&key, move || async move { inner.load_older(&cid, &pid, oldest).await })
            .await?;
        Ok(Some(page))
    }

    /// Mark everything `profile_id` received in the conversation as read,
    /// on the backend and in the cache.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        profile_id: &str,
    ) -> Result<usize, FetchError> {
        let read_at = now_millis();
        let updated = self
            .inner
            .backend
            .mark_read(conversation_id, profile_id, read_at)
            .await
            .map_err(|e| {
                log::warn!("Mark-read failed for {conversation_id} (profile {profile_id}): {e}");
                FetchError::from(e)
            })?;
        let cached = self
            .inner
            .cache
            .mark_read(conversation_id, profile_id, read_at)
            .await;
        log::debug!("Marked {updated} messages read in {conversation_id} ({cached} cached)");
        Ok(updated)
    }

    /// Append a message to the cached list if the conversation is cached.
    pub async fn record_message(&self, message: Message) -> bool {
        let key = message.conversation_id.clone();
        self.inner.cache.add_message(&key, message).await
    }

    /// Put `loaded` back into the cache when the entry has expired or been
    /// evicted, so `fetch_more` keeps paging from what a view already shows.
    /// Returns true if the entry was re-seeded.
    pub async fn reseed(&self, conversation_id: &str, loaded: &[Message]) -> bool {
        if loaded.is_empty() || self.inner.cache.get(conversation_id).await.is_some() {
            return false;
        }
        log::debug!(
            "Re-seeding {conversation_id} from {} loaded messages",
            loaded.len()
        );
        self.inner.cache.set(conversation_id, loaded.to_vec()).await;
        true
    }

    /// Forget the failure streak for a conversation.
    pub fn reset_failures(&self, conversation_id: &str) {
        self.inner.failures().remove(conversation_id);
    }

    /// Explicit retry: clears the failure streak and any recently completed
    /// fetch, then loads the newest page from the backend.
    pub async fn retry(&self, conversation_id: &str, profile_id: &str) -> FetchResult {
        self.reset_failures(conversation_id);
        self.inner
            .dedup
            .forget(&format!("messages:{conversation_id}:{profile_id}"));
        self.fetch_initial(conversation_id, profile_id, false).await
    }

    pub fn failure_count(&self, conversation_id: &str) -> u32 {
        self.inner
            .failures()
            .get(conversation_id)
            .map(|s| s.consecutive)
            .unwrap_or(0)
    }

    /// Drop all failure counters and in-flight markers (session change).
    pub fn reset(&self) {
        self.inner.failures().clear();
        self.inner.dedup.clear();
    }

    fn spawn_revalidation(&self, conversation_id: &str, profile_id: &str, newest: Option<i64>) {
        let inner = Arc::clone(&self.inner);
        let cid = conversation_id.to_string();
        let pid = profile_id.to_string();
        tokio::spawn(async move {
            inner.check_newer(&cid, &pid, newest).await;
        });
    }
}

impl Inner {
    fn failures(&self) -> MutexGuard<'_, HashMap<String, FailureState>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_backoff(&self, conversation_id: &str) -> Result<(), FetchError> {
        let failures = self.failures();
        let Some(state) = failures.get(conversation_id) else {
            return Ok(());
        };
        match state.retry_after {
            Some(until) if Instant::now() < until => {
                log::debug!(
                    "Skipping fetch for {conversation_id}: backing off after {} failures",
                    state.consecutive
                );
                Err(FetchError::BackedOff {
                    key: conversation_id.to_string(),
                    failures: state.consecutive,
                })
            }
            _ => Ok(()),
        }
    }

    fn record_success(&self, conversation_id: &str) {
        if self.failures().remove(conversation_id).is_some() {
            log::debug!("Failure streak for {conversation_id} cleared");
        }
    }

    fn record_failure(&self, conversation_id: &str, error: &FetchError) {
        if !error.is_retryable() {
            return;
        }
        let mut failures = self.failures();
        let state = failures.entry(conversation_id.to_string()).or_default();
        state.consecutive += 1;
        if state.consecutive >= self.config.failure_threshold {
            let exponent = state.consecutive - self.config.failure_threshold;
            let delay = self
                .config
                .backoff_base
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.config.backoff_cap);
            state.retry_after = Some(Instant::now() + delay);
            log::warn!(
                "Conversation {conversation_id}: {} consecutive failures, backing off {:?}",
                state.consecutive,
                delay
            );
        } else {
            log::info!(
                "Conversation {conversation_id}: failure {} of {} before back-off",
                state.consecutive,
                self.config.failure_threshold
            );
        }
    }

    /// Ownership check: the conversation exists and `profile_id` is in it.
    async fn verify_owner(
        &self,
        conversation_id: &str,
        profile_id: &str,
    ) -> Result<(), FetchError> {
        match self.backend.conversation(conversation_id).await {
            Ok(Some(row)) if row.has_participant(profile_id) => Ok(()),
            Ok(Some(_)) => {
                log::warn!("Profile {profile_id} is not a participant of {conversation_id}");
                Err(FetchError::PermissionDenied {
                    conversation_id: conversation_id.to_string(),
                })
            }
            Ok(None) => Err(FetchError::NotFound(conversation_id.to_string())),
            Err(e) => {
                log::warn!("Ownership check failed for {conversation_id}: {e}");
                Err(e.into())
            }
        }
    }

    async fn load_initial(&self, conversation_id: &str, profile_id: &str) -> FetchResult {
        let result = async {
            self.verify_owner(conversation_id, profile_id).await?;
            let params = PageParams::latest(conversation_id, profile_id, self.config.page_size);
            let (messages, _) =
                run_chain(self.backend.as_ref(), &params, self.config.allow_unscoped_fallback)
                    .await?;
            Ok::<_, FetchError>(messages)
        }
        .await;

        match result {
            Ok(messages) => {
                self.record_success(conversation_id);
                self.cache.set(conversation_id, messages.clone()).await;
                Ok(messages)
            }
            Err(e) => {
                self.record_failure(conversation_id, &e);
                Err(e)
            }
        }
    }

    async fn load_older(&self, conversation_id: &str, profile_id: &str, before: i64) -> FetchResult {
        let mut params = PageParams::latest(conversation_id, profile_id, self.config.page_size);
        params.before = Some(before);

        match run_chain(self.backend.as_ref(), &params, self.config.allow_unscoped_fallback).await {
            Ok((page, _)) => {
                self.record_success(conversation_id);
                if !page.is_empty() {
                    self.cache.merge(conversation_id, page.clone()).await;
                }
                Ok(page)
            }
            Err(e) => {
                self.record_failure(conversation_id, &e);
                Err(e)
            }
        }
    }

    /// Everything created after `newest`, read oldest-first one page at a
    /// time until a short page, so no gap opens between the cached tail and
    /// the new messages.
    async fn read_newer(
        &self,
        conversation_id: &str,
        profile_id: &str,
        newest: i64,
    ) -> Result<Vec<Message>, FetchError> {
        let limit = self.config.page_size.max(1);
        let mut cursor = newest;
        let mut newer = Vec::new();
        loop {
            let params = PageParams::newer_than(conversation_id, profile_id, cursor, limit);
            let (page, _) =
                run_chain(self.backend.as_ref(), &params, self.config.allow_unscoped_fallback)
                    .await?;
            let full = page.len() >= limit;
            if let Some(last) = page.last() {
                cursor = last.created_at;
            }
            newer.extend(page);
            if !full {
                return Ok(newer);
            }
            log::debug!(
                "Conversation {conversation_id}: {} newer messages so far, reading on",
                newer.len()
            );
        }
    }

    async fn check_newer(&self, conversation_id: &str, profile_id: &str, newest: Option<i64>) {
        let result = match newest {
            Some(newest) => self.read_newer(conversation_id, profile_id, newest).await,
            // Empty cached list: the newest page is all a view needs.
            None => {
                let params =
                    PageParams::latest(conversation_id, profile_id, self.config.page_size);
                run_chain(self.backend.as_ref(), &params, self.config.allow_unscoped_fallback)
                    .await
                    .map(|(page, _)| page)
            }
        };

        match result {
            Ok(newer) if newer.is_empty() => {
                log::debug!("No newer messages for {conversation_id}");
            }
            Ok(newer) => {
                log::debug!("Found {} newer messages for {conversation_id}", newer.len());
                let messages = self.cache.merge(conversation_id, newer).await;
                let _ = self.updates.send(MessagesUpdated {
                    conversation_id: conversation_id.to_string(),
                    messages,
                });
            }
            Err(e) => {
                log::debug!("Background revalidation failed for {conversation_id}: {e}");
            }
        }
    }
}
