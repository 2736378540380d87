use thiserror::Error;

/// Failure reported by a [`Fetcher`](crate::traits::Fetcher) or by the worker
/// around it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection refused, reset, DNS failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The fetch did not finish within the worker's timeout.
    #[error("Fetch timed out after {0} seconds")]
    Timeout(u64),

    /// The proxy itself failed (tunnel refused, auth rejected, etc.).
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// The upstream throttled us (HTTP 429 or equivalent).
    #[error("Rate limited by upstream")]
    RateLimited,

    /// The upstream answered but refused to serve content.
    #[error("Blocked by upstream (HTTP {0})")]
    Blocked(u16),

    /// The response could not be turned into records.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The fetcher cannot handle this source kind.
    #[error("Unsupported source: {0}")]
    Unsupported(String),
}

impl FetchError {
    /// Returns true if the failure is transient and the task should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::RateLimited
        ) || matches!(self, FetchError::Blocked(status) if *status >= 500)
    }

    /// Returns true if the failure should be charged to the proxy, not the task.
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, FetchError::Proxy(_)) || matches!(self, FetchError::Blocked(403))
    }

    /// Short category label used for error breakdowns.
    pub fn category(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::Timeout(_) => "timeout",
            FetchError::Proxy(_) => "proxy",
            FetchError::RateLimited => "rate_limited",
            FetchError::Blocked(_) => "blocked",
            FetchError::Parse(_) => "parse",
            FetchError::Unsupported(_) => "other",
        }
    }
}

/// Application-wide error types for Harvester.
#[derive(Error, Debug)]
pub enum AppError {
    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lifecycle transition not allowed by the state graph.
    #[error("Invalid transition for {entity} {id}: cannot {action} while {from}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        action: &'static str,
    },

    /// Unknown id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic concurrency check failed; the caller should re-read and retry.
    #[error("Version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    /// Fetching from a source failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Writing an export artifact failed.
    #[error("Export error: {0}")]
    ExportError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        AppError::VersionConflict {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true for errors caused by the caller (4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_)
                | AppError::InvalidTransition { .. }
                | AppError::NotFound { .. }
                | AppError::VersionConflict { .. }
        )
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Fetch(e) => e.is_retryable(),
            AppError::VersionConflict { .. } => true,
            _ => false,
        }
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::ExportError(err.to_string())
    }
}
