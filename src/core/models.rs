use serde::{Deserialize, Serialize};

/// Bumped whenever the cached JSON shape changes; older entries are ignored.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Lightweight projection of a profile, used to avoid repeated joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    /// Name to show for this profile, falling back to the username.
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("Unknown")
    }
}

/// A single direct message. Only `read_at` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub read_at: Option<i64>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    /// Joined sender profile, present when the query or enrichment step supplied it.
    #[serde(default)]
    pub sender: Option<ProfileSummary>,
}

impl Message {
    pub fn is_unread_for(&self, profile_id: &str) -> bool {
        self.sender_id != profile_id && self.read_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Blocked,
    Archived,
}

/// Raw `conversations` table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub status: ConversationStatus,
}

impl ConversationRow {
    pub fn has_participant(&self, profile_id: &str) -> bool {
        self.user1_id == profile_id || self.user2_id == profile_id
    }

    /// The participant that is not `profile_id`.
    pub fn other_participant_id(&self, profile_id: &str) -> &str {
        if self.user1_id == profile_id {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }
}

/// A conversation as shown in the inbox list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub status: ConversationStatus,
    /// Recent messages, ascending by `created_at`.
    pub messages: Vec<Message>,
    pub other_participant: Option<ProfileSummary>,
}

impl Conversation {
    pub fn from_row(
        row: ConversationRow,
        messages: Vec<Message>,
        other_participant: Option<ProfileSummary>,
    ) -> Self {
        Conversation {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            status: row.status,
            messages,
            other_participant,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| m.created_at)
    }

    /// Timestamp used to order the inbox; conversations without messages sink.
    pub fn last_activity(&self) -> i64 {
        self.last_message().map(|m| m.created_at).unwrap_or(i64::MIN)
    }

    pub fn unread_count(&self, profile_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_unread_for(profile_id))
            .count()
    }
}

/// A cached list stamped with its write time and schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: Vec<T>,
    /// Unix epoch milliseconds at write time.
    pub timestamp: i64,
    pub version: u32,
}

impl<T> CacheEntry<T> {
    pub fn new(data: Vec<T>, timestamp: i64) -> Self {
        CacheEntry {
            data,
            timestamp,
            version: CACHE_SCHEMA_VERSION,
        }
    }

    /// An entry is trusted only while younger than `ttl_ms` and on the current schema.
    pub fn is_fresh(&self, now: i64, ttl_ms: i64) -> bool {
        self.version == CACHE_SCHEMA_VERSION && now.saturating_sub(self.timestamp) < ttl_ms
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sort ascending by creation time, ties broken by id so ordering is stable.
pub fn sort_ascending(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
