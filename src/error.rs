// ⚠️ Pipeline Errors - Typed failure kinds callers branch on
// Storage and I/O plumbing stays in anyhow; these are the kinds that change control flow.

use thiserror::Error;

/// Result alias for pipeline operations with typed failures
pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================================================
// UPSTREAM FAILURE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// HTTP 429 or an explicit rate-limit response
    RateLimited,

    /// Timeout, connection reset, 5xx
    Transient,

    /// The API refused the request (bad key, bad payload); retrying won't help
    Rejected,
}

impl UpstreamKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamKind::RateLimited | UpstreamKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamKind::RateLimited => "rate_limited",
            UpstreamKind::Transient => "transient",
            UpstreamKind::Rejected => "rejected",
        }
    }
}

/// Failure talking to an external model API
#[derive(Debug, Clone, Error)]
#[error("upstream {} error: {message}", kind.as_str())]
pub struct UpstreamError {
    pub kind: UpstreamKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ============================================================================
// PIPELINE ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Model output from which no JSON object could be recovered
    #[error("could not parse model output: {raw:?}")]
    Parse { raw: String },

    /// Title referenced by a merge or query does not exist
    #[error("unknown title: {title:?}")]
    UnknownTitle { title: String },

    /// Index was built before the latest merge
    #[error("index is stale (built at title version {index_version}, store is at {current_version}); rebuild it")]
    IndexStale {
        index_version: i64,
        current_version: i64,
    },

    #[error("invalid merge: {0}")]
    InvalidMerge(String),

    #[error("index artifact is corrupted: {0}")]
    IndexCorrupted(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn unknown_title(title: &str) -> Self {
        PipelineError::UnknownTitle {
            title: title.to_string(),
        }
    }
}
