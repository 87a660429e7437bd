//! In-process `Backend` over plain tables, with per-operation call counters
//! and failure injection. Used by the test suites and for local development
//! without a live backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, MessageQuery, NewMessage, ParticipantColumn, SortOrder};
use crate::core::error::BackendError;
use crate::core::models::{
    now_millis, sort_ascending, Conversation, ConversationRow, ConversationStatus, Message,
    ProfileSummary,
};

/// Operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Conversation,
    ConversationsWhere,
    ConversationsJoined,
    /// `select_messages` with the sender join.
    JoinedMessages,
    /// `select_messages` without the join, scoped to a profile.
    ScopedMessages,
    /// `select_messages` without a requesting-profile scope.
    UnscopedMessages,
    Profiles,
    MarkRead,
    InsertMessage,
}

#[derive(Default)]
struct Tables {
    conversations: Vec<ConversationRow>,
    messages: Vec<Message>,
    profiles: HashMap<String, ProfileSummary>,
}

#[derive(Default)]
struct Faults {
    /// `None` = fail forever, `Some(n)` = fail the next n calls.
    plan: HashMap<BackendOp, Option<u32>>,
    calls: HashMap<BackendOp, usize>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_profile(&self, profile: ProfileSummary) {
        self.tables().profiles.insert(profile.id.clone(), profile);
    }

    pub fn add_conversation(&self, row: ConversationRow) {
        self.tables().conversations.push(row);
    }

    pub fn add_message(&self, message: Message) {
        self.tables().messages.push(message);
    }

    pub fn set_status(&self, conversation_id: &str, status: ConversationStatus) {
        if let Some(row) = self
            .tables()
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            row.status = status;
        }
    }

    /// Make `op` fail on every call until `heal` is called.
    pub fn fail(&self, op: BackendOp) {
        self.faults().plan.insert(op, None);
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_times(&self, op: BackendOp, times: u32) {
        self.faults().plan.insert(op, Some(times));
    }

    pub fn heal(&self, op: BackendOp) {
        self.faults().plan.remove(&op);
    }

    pub fn calls(&self, op: BackendOp) -> usize {
        self.faults().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of `select_messages` calls across all variants.
    pub fn message_queries(&self) -> usize {
        self.calls(BackendOp::JoinedMessages)
            + self.calls(BackendOp::ScopedMessages)
            + self.calls(BackendOp::UnscopedMessages)
    }

    /// Snapshot of stored messages for a conversation, ascending.
    pub fn stored_messages(&self, conversation_id: &str) -> Vec<Message> {
        let mut out: Vec<Message> = self
            .tables()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        sort_ascending(&mut out);
        out
    }

    /// Count the call and apply any injected failure.
    async fn enter(&self, op: BackendOp) -> Result<(), BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.faults();
        *faults.calls.entry(op).or_insert(0) += 1;
        match faults.plan.get_mut(&op) {
            Some(None) => Err(BackendError::Query(format!("injected failure for {op:?}"))),
            Some(Some(n)) if *n > 0 => {
                *n -= 1;
                Err(BackendError::Query(format!("injected failure for {op:?}")))
            }
            _ => Ok(()),
        }
    }

    fn check_scope(tables: &Tables, query: &MessageQuery) -> Result<(), BackendError> {
        let Some(profile_id) = &query.as_profile else {
            return Ok(());
        };
        let allowed = tables
            .conversations
            .iter()
            .any(|c| c.id == query.conversation_id && c.has_participant(profile_id));
        if allowed {
            Ok(())
        } else {
            Err(BackendError::PermissionDenied(format!(
                "{profile_id} cannot read {}",
                query.conversation_id
            )))
        }
    }

    fn run_message_query(tables: &Tables, query: &MessageQuery) -> Vec<Message> {
        let mut rows: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == query.conversation_id)
            .filter(|m| query.created_before.is_none_or(|t| m.created_at < t))
            .filter(|m| query.created_after.is_none_or(|t| m.created_at > t))
            .cloned()
            .collect();
        match query.order {
            SortOrder::Ascending => rows.sort_by_key(|m| m.created_at),
            SortOrder::Descending => rows.sort_by_key(|m| std::cmp::Reverse(m.created_at)),
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        for m in &mut rows {
            m.sender = if query.with_sender {
                tables.profiles.get(&m.sender_id).cloned()
            } else {
                None
            };
        }
        rows
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn conversation(&self, id: &str) -> Result<Option<ConversationRow>, BackendError> {
        self.enter(BackendOp::Conversation).await?;
        Ok(self.tables().conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn conversations_where(
        &self,
        column: ParticipantColumn,
        profile_id: &str,
    ) -> Result<Vec<ConversationRow>, BackendError> {
        self.enter(BackendOp::ConversationsWhere).await?;
        Ok(self
            .tables()
            .conversations
            .iter()
            .filter(|c| match column {
                ParticipantColumn::User1 => c.user1_id == profile_id,
                ParticipantColumn::User2 => c.user2_id == profile_id,
            })
            .cloned()
            .collect())
    }

    async fn conversations_joined(
        &self,
        profile_id: &str,
        message_limit: usize,
    ) -> Result<Vec<Conversation>, BackendError> {
        self.enter(BackendOp::ConversationsJoined).await?;
        let tables = self.tables();
        let conversations = tables
            .conversations
            .iter()
            .filter(|c| c.has_participant(profile_id))
            .map(|row| {
                let query = MessageQuery::page(&row.id, profile_id, message_limit);
                let mut messages = Self::run_message_query(&tables, &query);
                sort_ascending(&mut messages);
                let other = tables
                    .profiles
                    .get(row.other_participant_id(profile_id))
                    .cloned();
                Conversation::from_row(row.clone(), messages, other)
            })
            .collect();
        Ok(conversations)
    }

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, BackendError> {
        let op = match (query.with_sender, &query.as_profile) {
            (true, _) => BackendOp::JoinedMessages,
            (false, Some(_)) => BackendOp::ScopedMessages,
            (false, None) => BackendOp::UnscopedMessages,
        };
        self.enter(op).await?;
        let tables = self.tables();
        Self::check_scope(&tables, query)?;
        Ok(Self::run_message_query(&tables, query))
    }

    async fn profiles(&self, ids: &[String]) -> Result<Vec<ProfileSummary>, BackendError> {
        self.enter(BackendOp::Profiles).await?;
        let tables = self.tables();
        Ok(ids
            .iter()
            .filter_map(|id| tables.profiles.get(id).cloned())
            .collect())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: i64,
    ) -> Result<usize, BackendError> {
        self.enter(BackendOp::MarkRead).await?;
        let mut tables = self.tables();
        let mut updated = 0;
        for m in tables
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.is_unread_for(reader_id))
        {
            m.read_at = Some(read_at);
            updated += 1;
        }
        Ok(updated)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        self.enter(BackendOp::InsertMessage).await?;
        let mut tables = self.tables();
        let allowed = tables
            .conversations
            .iter()
            .any(|c| c.id == message.conversation_id && c.has_participant(&message.sender_id));
        if !allowed {
            return Err(BackendError::PermissionDenied(format!(
                "{} cannot post to {}",
                message.sender_id, message.conversation_id
            )));
        }
        // Keep creation times strictly increasing within a conversation.
        let latest = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == message.conversation_id)
            .map(|m| m.created_at)
            .max()
            .unwrap_or(i64::MIN);
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: now_millis().max(latest.saturating_add(1)),
            read_at: None,
            media_type: message.media_type,
            media_url: message.media_url,
            sender: None,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_conversation(ConversationRow {
            id: "c1".into(),
            user1_id: "a".into(),
            user2_id: "b".into(),
            status: ConversationStatus::Active,
        });
        backend.add_profile(ProfileSummary {
            id: "b".into(),
            username: Some("bee".into()),
            full_name: None,
            avatar_url: None,
        });
        for i in 0..5 {
            backend.add_message(Message {
                id: format!("m{i}"),
                conversation_id: "c1".into(),
                sender_id: "b".into(),
                content: format!("hi {i}"),
                created_at: i,
                read_at: None,
                media_type: None,
                media_url: None,
                sender: None,
            });
        }
        backend
    }

    #[tokio::test]
    async fn page_is_newest_first_and_joined() {
        let backend = seeded();
        let rows = backend
            .select_messages(&MessageQuery::page("c1", "a", 2))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m4", "m3"]);
        assert!(rows[0].sender.is_some());
        assert_eq!(backend.calls(BackendOp::JoinedMessages), 1);
    }

    #[tokio::test]
    async fn scope_rejects_non_participants() {
        let backend = seeded();
        let err = backend
            .select_messages(&MessageQuery::page("c1", "z", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn fail_times_then_recovers() {
        let backend = seeded();
        backend.fail_times(BackendOp::Conversation, 1);
        assert!(backend.conversation("c1").await.is_err());
        assert!(backend.conversation("c1").await.unwrap().is_some());
        assert_eq!(backend.calls(BackendOp::Conversation), 2);
    }

    #[tokio::test]
    async fn mark_read_skips_own_messages() {
        let backend = seeded();
        assert_eq!(backend.mark_read("c1", "b", 10).await.unwrap(), 0);
        assert_eq!(backend.mark_read("c1", "a", 10).await.unwrap(), 5);
        assert_eq!(backend.mark_read("c1", "a", 11).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_requires_participant() {
        let backend = seeded();
        let new = NewMessage {
            conversation_id: "c1".into(),
            sender_id: "z".into(),
            content: "hey".into(),
            media_type: None,
            media_url: None,
        };
        assert!(backend.insert_message(new.clone()).await.is_err());

        let ok = backend
            .insert_message(NewMessage { sender_id: "a".into(), ..new })
            .await
            .unwrap();
        assert!(ok.created_at > 4);
        assert_eq!(backend.stored_messages("c1").len(), 6);
    }
}
