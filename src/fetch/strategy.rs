//! Ordered fallback strategies for reading a page of messages.
//!
//! Each strategy is a single query shape; `run_chain` walks them in order and
//! stops at the first success. The chain exists because a backend whose
//! relational access rules are misconfigured may reject the joined select
//! while the plain rows remain readable.

use std::collections::HashSet;

use crate::backend::{Backend, MessageQuery, SortOrder};
use crate::core::error::{BackendError, FetchError};
use crate::core::models::{sort_ascending, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStrategy {
    /// Messages with the sender profile joined in one select.
    Joined,
    /// Plain select, senders batch-fetched and merged afterwards.
    Unjoined,
    /// Plain select without a requesting-profile scope, then enrichment.
    Unscoped,
}

impl MessageStrategy {
    pub const CHAIN: [MessageStrategy; 3] = [
        MessageStrategy::Joined,
        MessageStrategy::Unjoined,
        MessageStrategy::Unscoped,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageStrategy::Joined => "joined",
            MessageStrategy::Unjoined => "unjoined",
            MessageStrategy::Unscoped => "unscoped",
        }
    }

    fn query(self, params: &PageParams) -> MessageQuery {
        let mut query = MessageQuery::page(&params.conversation_id, &params.profile_id, params.limit);
        query.created_before = params.before;
        query.created_after = params.after;
        query.order = params.order;
        match self {
            MessageStrategy::Joined => {}
            MessageStrategy::Unjoined => query.with_sender = false,
            MessageStrategy::Unscoped => {
                query.with_sender = false;
                query.as_profile = None;
            }
        }
        query
    }

    /// Run this strategy once. Rows come back newest-first, as queried.
    pub async fn run(
        self,
        backend: &dyn Backend,
        params: &PageParams,
    ) -> Result<Vec<Message>, BackendError> {
        let mut rows = backend.select_messages(&self.query(params)).await?;
        if self != MessageStrategy::Joined {
            enrich_senders(backend, &mut rows).await;
        }
        Ok(rows)
    }
}

/// What page of which conversation to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    pub conversation_id: String,
    pub profile_id: String,
    pub limit: usize,
    pub before: Option<i64>,
    pub after: Option<i64>,
    pub order: SortOrder,
}

impl PageParams {
    pub fn latest(conversation_id: &str, profile_id: &str, limit: usize) -> Self {
        PageParams {
            conversation_id: conversation_id.to_string(),
            profile_id: profile_id.to_string(),
            limit,
            before: None,
            after: None,
            order: SortOrder::Descending,
        }
    }

    /// Oldest-first page of messages created strictly after `after`.
    pub fn newer_than(conversation_id: &str, profile_id: &str, after: i64, limit: usize) -> Self {
        PageParams {
            after: Some(after),
            order: SortOrder::Ascending,
            ..Self::latest(conversation_id, profile_id, limit)
        }
    }
}

/// Fill in `sender` from one batched profile read. Failures leave rows as-is.
pub async fn enrich_senders(backend: &dyn Backend, rows: &mut [Message]) {
    let ids: Vec<String> = rows
        .iter()
        .filter(|m| m.sender.is_none())
        .map(|m| m.sender_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    if ids.is_empty() {
        return;
    }

    match backend.profiles(&ids).await {
        Ok(profiles) => {
            for m in rows.iter_mut().filter(|m| m.sender.is_none()) {
                m.sender = profiles.iter().find(|p| p.id == m.sender_id).cloned();
            }
        }
        Err(e) => {
            log::warn!("Sender enrichment failed for {} profiles: {}", ids.len(), e);
        }
    }
}

/// Walk the strategies until one succeeds; the result is ascending by
/// creation time, ready for display.
pub async fn run_chain(
    backend: &dyn Backend,
    params: &PageParams,
    allow_unscoped: bool,
) -> Result<(Vec<Message>, MessageStrategy), FetchError> {
    let mut attempts = 0u32;
    for strategy in MessageStrategy::CHAIN {
        if strategy == MessageStrategy::Unscoped {
            if !allow_unscoped {
                break;
            }
            log::warn!(
                "Conversation {}: falling back to unscoped message query for profile {}",
                params.conversation_id,
                params.profile_id
            );
        }

        attempts += 1;
        match strategy.run(backend, params).await {
            Ok(mut rows) => {
                if attempts > 1 {
                    log::info!(
                        "Conversation {}: {} strategy succeeded on attempt {}",
                        params.conversation_id,
                        strategy.name(),
                        attempts
                    );
                }
                sort_ascending(&mut rows);
                return Ok((rows, strategy));
            }
            Err(e) => {
                log::warn!(
                    "Conversation {}: {} message query failed (attempt {}): {}",
                    params.conversation_id,
                    strategy.name(),
                    attempts,
                    e
                );
            }
        }
    }

    log::error!(
        "Conversation {}: all {} message strategies failed",
        params.conversation_id,
        attempts
    );
    Err(FetchError::Exhausted {
        key: params.conversation_id.clone(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendOp, MemoryBackend};
    use crate::core::models::{ConversationRow, ConversationStatus, ProfileSummary};

    fn backend_with(n: i64) -> MemoryBackend {
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
            full_name: Some("Bea".into()),
            avatar_url: None,
        });
        for i in 0..n {
            backend.add_message(Message {
                id: format!("m{i:02}"),
                conversation_id: "c1".into(),
                sender_id: "b".into(),
                content: format!("msg {i}"),
                created_at: 100 + i,
                read_at: None,
                media_type: None,
                media_url: None,
                sender: None,
            });
        }
        backend
    }

    #[tokio::test]
    async fn primary_strategy_returns_ascending_page() {
        let backend = backend_with(10);
        let (rows, used) = run_chain(&backend, &PageParams::latest("c1", "a", 4), true)
            .await
            .unwrap();
        assert_eq!(used, MessageStrategy::Joined);
        let ids: Vec<_> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m06", "m07", "m08", "m09"]);
        assert!(rows.iter().all(|m| m.sender.is_some()));
    }

    #[tokio::test]
    async fn join_failure_falls_back_and_enriches() {
        let backend = backend_with(3);
        backend.fail(BackendOp::JoinedMessages);
        let (rows, used) = run_chain(&backend, &PageParams::latest("c1", "a", 10), true)
            .await
            .unwrap();
        assert_eq!(used, MessageStrategy::Unjoined);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0].sender.as_ref().map(|p| p.display_name()),
            Some("Bea")
        );
        assert_eq!(backend.calls(BackendOp::Profiles), 1);
    }

    #[tokio::test]
    async fn enrichment_failure_keeps_rows() {
        let backend = backend_with(2);
        backend.fail(BackendOp::JoinedMessages);
        backend.fail(BackendOp::Profiles);
        let (rows, _) = run_chain(&backend, &PageParams::latest("c1", "a", 10), true)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|m| m.sender.is_none()));
    }

    #[tokio::test]
    async fn unscoped_is_last_resort() {
        let backend = backend_with(2);
        backend.fail(BackendOp::JoinedMessages);
        backend.fail(BackendOp::ScopedMessages);
        let (_, used) = run_chain(&backend, &PageParams::latest("c1", "a", 10), true)
            .await
            .unwrap();
        assert_eq!(used, MessageStrategy::Unscoped);
    }

    #[tokio::test]
    async fn unscoped_can_be_disabled() {
        let backend = backend_with(2);
        backend.fail(BackendOp::JoinedMessages);
        backend.fail(BackendOp::ScopedMessages);
        let err = run_chain(&backend, &PageParams::latest("c1", "a", 10), false)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Exhausted { key: "c1".into(), attempts: 2 });
        assert_eq!(backend.calls(BackendOp::UnscopedMessages), 0);
    }

    #[tokio::test]
    async fn everything_failing_exhausts_chain() {
        let backend = backend_with(2);
        backend.fail(BackendOp::JoinedMessages);
        backend.fail(BackendOp::ScopedMessages);
        backend.fail(BackendOp::UnscopedMessages);
        let err = run_chain(&backend, &PageParams::latest("c1", "a", 10), true)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Exhausted { key: "c1".into(), attempts: 3 });
    }

    #[tokio::test]
    async fn before_cursor_is_exclusive() {
        let backend = backend_with(5);
        let mut params = PageParams::latest("c1", "a", 10);
        params.before = Some(102);
        let (rows, _) = run_chain(&backend, &params, true).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m00", "m01"]);
    }

    #[tokio::test]
    async fn newer_than_reads_oldest_first_after_cursor() {
        let backend = backend_with(10);
        let (rows, _) = run_chain(&backend, &PageParams::newer_than("c1", "a", 102, 3), true)
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m03", "m04", "m05"]);
    }
}
