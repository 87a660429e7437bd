//! Query interface to the managed backend tables (`messages`,
//! `conversations`, `profiles`).

pub mod memory;

use async_trait::async_trait;

use crate::core::error::BackendError;
use crate::core::models::{Conversation, ConversationRow, Message, ProfileSummary};

/// Which participant column an equality filter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantColumn {
    User1,
    User2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A filtered, ordered, limited select on `messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub conversation_id: String,
    /// Join the sender's `profiles` projection.
    pub with_sender: bool,
    /// Run under this profile's access rules. `None` issues the query without
    /// a requesting-profile scope.
    pub as_profile: Option<String>,
    /// Strictly less than, epoch millis.
    pub created_before: Option<i64>,
    /// Strictly greater than, epoch millis.
    pub created_after: Option<i64>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// Newest-first page of a conversation, as seen by `profile_id`.
    pub fn page(conversation_id: &str, profile_id: &str, limit: usize) -> Self {
        MessageQuery {
            conversation_id: conversation_id.to_string(),
            with_sender: true,
            as_profile: Some(profile_id.to_string()),
            created_before: None,
            created_after: None,
            order: SortOrder::Descending,
            limit: Some(limit),
        }
    }

    pub fn before(mut self, created_at: i64) -> Self {
        self.created_before = Some(created_at);
        self
    }

    pub fn after(mut self, created_at: i64) -> Self {
        self.created_after = Some(created_at);
        self
    }
}

/// Table operations the fetch pipeline depends on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Single `conversations` row by id.
    async fn conversation(&self, id: &str) -> Result<Option<ConversationRow>, BackendError>;

    /// Rows where `column` equals `profile_id`.
    async fn conversations_where(
        &self,
        column: ParticipantColumn,
        profile_id: &str,
    ) -> Result<Vec<ConversationRow>, BackendError>;

    /// Relational query: every conversation `profile_id` takes part in, with
    /// up to `message_limit` recent messages and the other participant nested.
    async fn conversations_joined(
        &self,
        profile_id: &str,
        message_limit: usize,
    ) -> Result<Vec<Conversation>, BackendError>;

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, BackendError>;

    /// Batch read of profile projections by id.
    async fn profiles(&self, ids: &[String]) -> Result<Vec<ProfileSummary>, BackendError>;

    /// Set `read_at` on every message in the conversation that `reader_id`
    /// did not send and has not yet read. Returns the number of rows updated.
    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: i64,
    ) -> Result<usize, BackendError>;

    /// Insert a new message, returning the stored row.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, BackendError>;
}

/// Columns supplied by the client when sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
}
