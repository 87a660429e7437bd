use thiserror::Error;

/// Failures reported by the backend query interface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend's access rules rejected the query.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the fetch pipeline.
///
/// `Clone` so that a single deduplicated fetch can hand the same outcome to
/// every waiting caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("no profile id available")]
    MissingProfile,
    #[error("no conversation id available")]
    MissingConversation,
    #[error("access to conversation {conversation_id} denied")]
    PermissionDenied { conversation_id: String },
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("every fetch strategy failed for {key} after {attempts} attempts")]
    Exhausted { key: String, attempts: u32 },
    #[error("fetches for {key} paused after {failures} consecutive failures")]
    BackedOff { key: String, failures: u32 },
}

impl FetchError {
    /// Whether automatic retry with back-off may resolve this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Exhausted { .. })
    }
}

impl From<BackendError> for FetchError {
    fn from(e: BackendError) -> Self {
        FetchError::Transient(e.to_string())
    }
}
