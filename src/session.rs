//! Orchestration for one open conversation.
//!
//! A `ConversationSession` owns the view state of a conversation (loaded
//! messages, `has_more`, last error), verifies access once, drives the
//! initial load and older-page loads, and marks incoming messages read after
//! a short delay. Failures never propagate out of the orchestration: they are
//! recorded in the state and the call returns `None`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::backend::{Backend, NewMessage};
use crate::config::Config;
use crate::core::cache::merge_messages;
use crate::core::error::{BackendError, FetchError};
use crate::core::models::{now_millis, ConversationStatus, Message};
use crate::fetch::messages::MessageFetcher;

/// Snapshot of what a conversation view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Ascending by creation time.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<FetchError>,
}

pub struct ConversationSession {
    conversation_id: String,
    profile_id: String,
    backend: Arc<dyn Backend>,
    fetcher: MessageFetcher,
    config: Config,
    /// Verified once per session; errors are not cached.
    permission: OnceCell<bool>,
    state: Mutex<SessionState>,
    loading_more: AtomicBool,
    mounted: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Open a session and start listening for background cache updates.
    pub fn open(
        conversation_id: &str,
        profile_id: &str,
        backend: Arc<dyn Backend>,
        fetcher: MessageFetcher,
        config: &Config,
    ) -> Arc<Self> {
        let session = Arc::new(ConversationSession {
            conversation_id: conversation_id.to_string(),
            profile_id: profile_id.to_string(),
            backend,
            fetcher,
            config: config.clone(),
            permission: OnceCell::new(),
            state: Mutex::new(SessionState::default()),
            loading_more: AtomicBool::new(false),
            mounted: AtomicBool::new(true),
            listener: Mutex::new(None),
        });

        let handle = Self::spawn_listener(Arc::downgrade(&session));
        *session.listener() = Some(handle);
        session
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn snapshot(&self) -> SessionState {
        self.state().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn has_more(&self) -> bool {
        self.state().has_more
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state().error.clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Stop applying results and listening for updates. In-flight work
    /// finishes but its results are dropped.
    pub fn close(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener().take() {
            handle.abort();
        }
        log::debug!("Closed session for {}", self.conversation_id);
    }

    fn missing_id(&self) -> Option<FetchError> {
        if self.conversation_id.is_empty() {
            Some(FetchError::MissingConversation)
        } else if self.profile_id.is_empty() {
            Some(FetchError::MissingProfile)
        } else {
            None
        }
    }

    fn record_error(&self, error: FetchError) {
        if !self.is_mounted() {
            return;
        }
        let mut state = self.state();
        state.loading = false;
        state.error = Some(error);
    }

    /// Whether the profile may read this conversation: it must be a
    /// participant and the conversation must be active. Checked against the
    /// backend once; the answer is kept for the life of the session.
    pub async fn verify_permission(&self) -> Result<bool, FetchError> {
        if let Some(e) = self.missing_id() {
            return Err(e);
        }
        self.permission
            .get_or_try_init(|| async {
                match self.backend.conversation(&self.conversation_id).await {
                    Ok(Some(row)) => {
                        let allowed = row.has_participant(&self.profile_id)
                            && row.status == ConversationStatus::Active;
                        if !allowed {
                            log::warn!(
                                "Profile {} may not read conversation {} (status {:?})",
                                self.profile_id,
                                self.conversation_id,
                                row.status
                            );
                        }
                        Ok(allowed)
                    }
                    Ok(None) => {
                        log::warn!("Conversation {} not found", self.conversation_id);
                        Ok(false)
                    }
                    Err(e) => {
                        log::warn!(
                            "Permission check failed for {} (profile {}): {}",
                            self.conversation_id,
                            self.profile_id,
                            e
                        );
                        Err(FetchError::from(e))
                    }
                }
            })
            .await
            .copied()
    }

    /// Initial load. Sets `has_more` when a full page came back.
    pub async fn fetch_messages(self: &Arc<Self>) -> Option<Vec<Message>> {
        if !self.is_mounted() {
            return None;
        }
        if let Some(e) = self.missing_id() {
            log::warn!("Cannot fetch messages: {e}");
            self.record_error(e);
            return None;
        }
        self.state().loading = true;

        if !self.ensure_permitted().await {
            return None;
        }

        let result = self
            .fetcher
            .fetch_initial(&self.conversation_id, &self.profile_id, true)
            .await;
        self.apply_initial(result)
    }

    /// User-triggered retry after an error.
    pub async fn retry(self: &Arc<Self>) -> Option<Vec<Message>> {
        if !self.is_mounted() {
            return None;
        }
        log::info!("Manual retry for conversation {}", self.conversation_id);
        {
            let mut state = self.state();
            state.error = None;
            state.loading = true;
        }
        if !self.ensure_permitted().await {
            return None;
        }
        let result = self
            .fetcher
            .retry(&self.conversation_id, &self.profile_id)
            .await;
        self.apply_initial(result)
    }

    async fn ensure_permitted(&self) -> bool {
        match self.verify_permission().await {
            Ok(true) => true,
            Ok(false) => {
                self.record_error(FetchError::PermissionDenied {
                    conversation_id: self.conversation_id.clone(),
                });
                false
            }
            Err(e) => {
                self.record_error(e);
                false
            }
        }
    }

    fn apply_initial(self: &Arc<Self>, result: Result<Vec<Message>, FetchError>) -> Option<Vec<Message>> {
        match result {
            Ok(messages) => {
                if !self.is_mounted() {
                    log::debug!("Dropping messages for closed session {}", self.conversation_id);
                    return None;
                }
                {
                    let mut state = self.state();
                    state.has_more = messages.len() >= self.fetcher.page_size();
                    state.messages = messages.clone();
                    state.loading = false;
                    state.error = None;
                }
                self.schedule_mark_read(&messages);
                Some(messages)
            }
            Err(e) => {
                log::warn!(
                    "Loading conversation {} failed for profile {}: {}",
                    self.conversation_id,
                    self.profile_id,
                    e
                );
                self.record_error(e);
                None
            }
        }
    }

    /// Load one older page and prepend it. Ignored while another call is
    /// running or when there is nothing more to load.
    pub async fn load_more_messages(self: &Arc<Self>) -> Option<Vec<Message>> {
        if !self.is_mounted() || !self.has_more() {
            return None;
        }
        if self.loading_more.swap(true, Ordering::SeqCst) {
            log::debug!("Load-more already running for {}", self.conversation_id);
            return None;
        }

        let loaded = self.messages();
        self.fetcher.reseed(&self.conversation_id, &loaded).await;
        let result = self
            .fetcher
            .fetch_more(&self.conversation_id, &self.profile_id, true)
            .await;
        self.loading_more.store(false, Ordering::SeqCst);

        match result {
            Ok(Some(page)) => {
                if !self.is_mounted() {
                    return None;
                }
                {
                    let mut state = self.state();
                    state.has_more = page.len() >= self.fetcher.page_size();
                    let current = std::mem::take(&mut state.messages);
                    state.messages = merge_messages(current, page.clone());
                    state.error = None;
                }
                self.schedule_mark_read(&page);
                Some(page)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Loading older messages for {} failed: {}", self.conversation_id, e);
                self.record_error(e);
                None
            }
        }
    }

    /// Mark everything the other participant sent as read, now.
    pub async fn mark_messages_as_read(&self) -> Result<usize, FetchError> {
        let updated = self
            .fetcher
            .mark_read(&self.conversation_id, &self.profile_id)
            .await?;
        let read_at = now_millis();
        let mut state = self.state();
        for m in state
            .messages
            .iter_mut()
            .filter(|m| m.is_unread_for(&self.profile_id))
        {
            m.read_at = Some(read_at);
        }
        Ok(updated)
    }

    fn schedule_mark_read(self: &Arc<Self>, revealed: &[Message]) {
        if !revealed.iter().any(|m| m.is_unread_for(&self.profile_id)) {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.mark_read_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            if !session.is_mounted() {
                return;
            }
            if let Err(e) = session.mark_messages_as_read().await {
                log::warn!(
                    "Deferred mark-read failed for {}: {}",
                    session.conversation_id,
                    e
                );
            }
        });
    }

    /// Send a message as this session's profile.
    pub async fn send_message(
        &self,
        content: &str,
        media_type: Option<String>,
        media_url: Option<String>,
    ) -> Result<Message, FetchError> {
        if let Some(e) = self.missing_id() {
            return Err(e);
        }
        if !self.verify_permission().await? {
            return Err(FetchError::PermissionDenied {
                conversation_id: self.conversation_id.clone(),
            });
        }

        let stored = self
            .backend
            .insert_message(NewMessage {
                conversation_id: self.conversation_id.clone(),
                sender_id: self.profile_id.clone(),
                content: content.to_string(),
                media_type,
                media_url,
            })
            .await
            .map_err(|e| match e {
                BackendError::PermissionDenied(_) => FetchError::PermissionDenied {
                    conversation_id: self.conversation_id.clone(),
                },
                other => FetchError::from(other),
            })?;

        self.fetcher.record_message(stored.clone()).await;
        if self.is_mounted() {
            let mut state = self.state();
            let current = std::mem::take(&mut state.messages);
            state.messages = merge_messages(current, vec![stored.clone()]);
        }
        Ok(stored)
    }

    /// Apply a message delivered outside a fetch (e.g. a realtime push).
    /// Returns false if it belongs elsewhere or is already present.
    pub async fn receive(self: &Arc<Self>, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || !self.is_mounted() {
            return false;
        }
        let added = {
            let mut state = self.state();
            if state.messages.iter().any(|m| m.id == message.id) {
                false
            } else {
                let current = std::mem::take(&mut state.messages);
                state.messages = merge_messages(current, vec![message.clone()]);
                true
            }
        };
        if added {
            self.fetcher.record_message(message.clone()).await;
            self.schedule_mark_read(std::slice::from_ref(&message));
        }
        added
    }

    fn apply_update(self: &Arc<Self>, messages: Vec<Message>) {
        if !self.is_mounted() {
            return;
        }
        let revealed: Vec<Message> = {
            let mut state = self.state();
            let fresh: Vec<Message> = messages
                .iter()
                .filter(|m| !state.messages.iter().any(|e| e.id == m.id))
                .cloned()
                .collect();
            let current = std::mem::take(&mut state.messages);
            state.messages = merge_messages(current, messages);
            fresh
        };
        log::debug!(
            "Applied {} new messages to session {}",
            revealed.len(),
            self.conversation_id
        );
        self.schedule_mark_read(&revealed);
    }

    fn spawn_listener(weak: Weak<Self>) -> JoinHandle<()> {
        let Some(session) = weak.upgrade() else {
            return tokio::spawn(async {});
        };
        let mut updates = session.fetcher.subscribe();
        drop(session);

        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        let Some(session) = weak.upgrade() else {
                            break;
                        };
                        if update.conversation_id == session.conversation_id {
                            session.apply_update(update.messages);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Session listener skipped {skipped} updates");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
