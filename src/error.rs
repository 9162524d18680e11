use crate::config::RepoId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the GitHub API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, invalid or insufficiently scoped token.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The repository (or PR) does not exist or is not visible to the token.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Quota exhausted or secondary rate limit hit.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Connection failures and 5xx responses.
    #[error("transient network error: {message}")]
    TransientNetwork { message: String },

    /// Any other non-success status.
    #[error("unexpected response ({status}): {message}")]
    Unexpected { status: u16, message: String },

    /// The response body did not match the expected payload.
    #[error("malformed response from {route}: {message}")]
    Decode { route: String, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    /// Returns true if the request should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::TransientNetwork { .. }
        )
    }

    /// The minimum wait the server asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short name of the failure kind, used in user-facing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth { .. } => "AuthError",
            ApiError::NotFound { .. } => "NotFound",
            ApiError::RateLimited { .. } => "RateLimited",
            ApiError::TransientNetwork { .. } => "TransientNetwork",
            ApiError::Unexpected { .. } => "UnexpectedResponse",
            ApiError::Decode { .. } => "DecodeError",
            ApiError::RetriesExhausted { last, .. } => last.kind(),
        }
    }
}

/// Failures reading or writing the on-disk dataset.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt local data in {}: {message}", path.display())]
    CorruptLocalData { path: PathBuf, message: String },

    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        StoreError::CorruptLocalData {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::CorruptLocalData { .. } => "CorruptLocalData",
            StoreError::Io { .. } => "IoError",
        }
    }
}

/// A collection run aborted. Data flushed before the failure stays on disk.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{} while collecting {repo}", source.kind())]
    Api {
        repo: RepoId,
        #[source]
        source: ApiError,
    },

    #[error("{} while collecting {repo}", source.kind())]
    Store {
        repo: RepoId,
        #[source]
        source: StoreError,
    },
}

impl CollectError {
    pub fn repo(&self) -> &RepoId {
        match self {
            CollectError::Api { repo, .. } | CollectError::Store { repo, .. } => repo,
        }
    }
}

/// Failures serving metrics from the dataset.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no completed collection for {0}")]
    NotCollected(RepoId),

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("metrics task failed: {0}")]
    Task(String),
}
