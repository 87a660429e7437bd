use std::sync::Arc;

use crate::backend::Backend;
use crate::config::Config;
use crate::core::cache::{ConversationCache, MessageCache, TieredCache};
use crate::core::error::FetchError;
use crate::core::models::Conversation;
use crate::core::store::{CacheHandle, StoreKind};
use crate::fetch::conversations::ConversationFetcher;
use crate::fetch::messages::MessageFetcher;
use crate::session::ConversationSession;

/// Wires the caches, fetchers and backend together for one signed-in user.
pub struct MessagingClient {
    config: Config,
    backend: Arc<dyn Backend>,
    store: Option<CacheHandle>,
    message_cache: Arc<MessageCache>,
    conversation_cache: Arc<ConversationCache>,
    messages: MessageFetcher,
    conversations: ConversationFetcher,
}

impl MessagingClient {
    /// Open the persistent cache and build the pipeline. A cache that cannot
    /// be opened leaves the client running memory-only.
    pub fn init(config: Config, backend: Arc<dyn Backend>) -> Self {
        let store = match CacheHandle::open(config.cache_dir.as_deref()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Persistent cache unavailable, running memory-only: {}", e);
                None
            }
        };
        Self::with_store(config, backend, store)
    }

    pub fn with_store(config: Config, backend: Arc<dyn Backend>, store: Option<CacheHandle>) -> Self {
        let message_cache = Arc::new(TieredCache::new(
            StoreKind::Conversations,
            config.message_ttl,
            store.clone(),
        ));
        let conversation_cache = Arc::new(TieredCache::new(
            StoreKind::Profiles,
            config.conversation_ttl,
            store.clone(),
        ));
        let messages = MessageFetcher::new(backend.clone(), message_cache.clone(), &config);
        let conversations =
            ConversationFetcher::new(backend.clone(), conversation_cache.clone(), &config);

        MessagingClient {
            config,
            backend,
            store,
            message_cache,
            conversation_cache,
            messages,
            conversations,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn message_fetcher(&self) -> &MessageFetcher {
        &self.messages
    }

    pub fn conversation_fetcher(&self) -> &ConversationFetcher {
        &self.conversations
    }

    pub fn message_cache(&self) -> &Arc<MessageCache> {
        &self.message_cache
    }

    pub fn conversation_cache(&self) -> &Arc<ConversationCache> {
        &self.conversation_cache
    }

    /// Conversation list with automatic retry.
    pub async fn conversations(
        &self,
        profile_id: Option<&str>,
        force_fresh: bool,
    ) -> Result<Vec<Conversation>, FetchError> {
        self.conversations.fetch_with_retry(profile_id, force_fresh).await
    }

    pub fn open_session(&self, conversation_id: &str, profile_id: &str) -> Arc<ConversationSession> {
        ConversationSession::open(
            conversation_id,
            profile_id,
            self.backend.clone(),
            self.messages.clone(),
            &self.config,
        )
    }

    /// Drop every cached entry, memory and persistent, and all fetch state.
    /// Used on sign-out.
    pub async fn clear(&self) {
        self.message_cache.clear_all().await;
        self.conversation_cache.clear_all().await;
        self.messages.reset();
        self.conversations.reset();
        log::info!("Message and conversation caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendOp, MemoryBackend};
    use crate::core::models::{ConversationRow, ConversationStatus, Message, ProfileSummary};

    fn backend() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.add_conversation(ConversationRow {
            id: "c1".into(),
            user1_id: "me".into(),
            user2_id: "them".into(),
            status: ConversationStatus::Active,
        });
        for p in ["me", "them"] {
            backend.add_profile(ProfileSummary {
                id: p.into(),
                username: Some(p.into()),
                full_name: None,
                avatar_url: None,
            });
        }
        for i in 0..3 {
            backend.add_message(Message {
                id: format!("m{i}"),
                conversation_id: "c1".into(),
                sender_id: "them".into(),
                content: "hey".into(),
                created_at: 1_000 + i,
                read_at: None,
                media_type: None,
                media_url: None,
                sender: None,
            });
        }
        Arc::new(backend)
    }

    fn client(backend: Arc<MemoryBackend>) -> MessagingClient {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = CacheHandle::open_in_memory().unwrap();
        MessagingClient::with_store(Config::default(), backend, Some(store))
    }

    #[tokio::test(start_paused = true)]
    async fn list_then_open_session() {
        let backend = backend();
        let client = client(backend.clone());
        assert!(client.is_persistent());

        let list = client.conversations(Some("me"), false).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].unread_count("me"), 3);

        let session = client.open_session("c1", "me");
        let messages = session.fetch_messages().await.unwrap();
        assert_eq!(messages.len(), 3);
        assert!(!session.has_more());
    }

    #[tokio::test(start_paused = true)]
    async fn second_session_reads_from_cache() {
        let backend = backend();
        let client = client(backend.clone());

        client.open_session("c1", "me").fetch_messages().await.unwrap();
        let queries = backend.message_queries();

        let again = client.open_session("c1", "me");
        assert_eq!(again.fetch_messages().await.unwrap().len(), 3);
        // Only the background newer-message check may have queried.
        assert!(backend.message_queries() <= queries + 1);
        assert!(client.message_cache().has("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_wipes_both_caches() {
        let backend = backend();
        let client = client(backend.clone());
        client.conversations(Some("me"), false).await.unwrap();
        client.open_session("c1", "me").fetch_messages().await.unwrap();
        assert!(client.conversation_cache().has("me"));
        assert!(client.message_cache().has("c1"));

        client.clear().await;
        assert!(!client.conversation_cache().has("me"));
        assert!(!client.message_cache().has("c1"));
        assert!(client.message_cache().get("c1").await.is_none());
        assert!(client.conversation_fetcher().current().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_list_survives_join_failure() {
        let backend = backend();
        backend.fail(BackendOp::ConversationsJoined);
        let client = client(backend.clone());

        let list = client.conversations(Some("me"), false).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].messages.len(), 3);
        assert_eq!(backend.calls(BackendOp::ConversationsWhere), 2);
    }
}
