//! Error handling types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the governance layer
///
/// Errors are cloneable so that a single failed fetch can be surfaced to
/// every single-flight waiter and re-examined across retry attempts.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The underlying remote call behind a cache miss failed.
    /// Never cached; propagated to every waiter of that fetch attempt.
    #[error("fetch failed for key '{key}': {message}")]
    FetchFailed { key: String, message: String },

    /// The remote service signalled that this category is being throttled
    #[error("remote throttled category '{category}', retry after {retry_after:?}")]
    RemoteThrottled {
        category: String,
        retry_after: Duration,
    },

    /// No pooled client became available within the acquisition timeout
    #[error("client pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// Fewer than the configured minimum of clients could be created at startup
    #[error("client pool initialization failed: {message}")]
    PoolInit { message: String },

    /// A pooled client failed its health check and could not be reconnected
    #[error("client {client_id} unhealthy: {message}")]
    ClientUnhealthy { client_id: u64, message: String },

    /// An operation exceeded its caller-imposed deadline
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The component is shutting down and no longer admits work
    #[error("shutting down")]
    ShuttingDown,

    /// Remote call failed for a reason that is not retryable
    #[error("remote error: {message}")]
    Remote { message: String },

    /// Internal cache failure (serialization, invalidation predicate)
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Invalid argument
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl Error {
    /// Create a non-retryable remote error
    pub fn remote<S: Into<String>>(message: S) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a remote-throttled error carrying the backoff the service asked for
    pub fn remote_throttled<S: Into<String>>(category: S, retry_after: Duration) -> Self {
        Self::RemoteThrottled {
            category: category.into(),
            retry_after,
        }
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a pool initialization error
    pub fn pool_init<S: Into<String>>(message: S) -> Self {
        Self::PoolInit {
            message: message.into(),
        }
    }

    /// Whether this failure is worth retrying.
    ///
    /// This is the explicit transient/permanent boundary the dispatcher uses:
    /// throttling, pool exhaustion and timeouts are transient; everything else
    /// (including remote business failures wrapped in [`Error::Remote`]) is
    /// permanent. Callers with a different notion of "retryable" construct the
    /// matching variant; nothing here inspects error text.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RemoteThrottled { .. } | Self::PoolExhausted { .. } | Self::Timeout { .. }
        )
    }

    /// Stable machine-readable kind tag, used in bulk failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchFailed { .. } => "fetch_failed",
            Self::RemoteThrottled { .. } => "remote_throttled",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolInit { .. } => "pool_init",
            Self::ClientUnhealthy { .. } => "client_unhealthy",
            Self::Timeout { .. } => "timeout",
            Self::ShuttingDown => "shutting_down",
            Self::Remote { .. } => "remote",
            Self::Cache { .. } => "cache",
            Self::Config { .. } => "config",
            Self::InvalidArgument { .. } => "invalid_argument",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::remote_throttled("write", Duration::from_secs(5)).is_transient());
        assert!(Error::PoolExhausted {
            waited: Duration::from_secs(10)
        }
        .is_transient());
        assert!(Error::Timeout {
            elapsed: Duration::from_secs(30)
        }
        .is_transient());

        assert!(!Error::remote("chat not found").is_transient());
        assert!(!Error::FetchFailed {
            key: "k".into(),
            message: "boom".into()
        }
        .is_transient());
        assert!(!Error::ShuttingDown.is_transient());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            Error::remote_throttled("read", Duration::from_secs(1)).kind(),
            "remote_throttled"
        );
        assert_eq!(Error::remote("x").kind(), "remote");
        assert_eq!(Error::config("bad").kind(), "config");
    }
}
