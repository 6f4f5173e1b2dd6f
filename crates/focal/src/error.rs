//! Error types for collection, persistence and configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::paginator::Cursor;
use crate::window::TimeWindow;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid YAML for the expected shape
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A required credential is missing from the environment
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    /// Event name not present in the config file
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

/// Errors returned by the remote API layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint signalled a rate limit
    #[error("rate limited{}", fmt_retry(.retry_after.as_ref()))]
    RateLimited { retry_after: Option<Duration> },

    /// Server-side failure that is expected to clear up (5xx, 503)
    #[error("service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// Any other API error (bad query, auth failure, ...)
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Streaming connection failed mid-flight
    #[error("stream error: {0}")]
    Stream(String),
}

fn fmt_retry(retry_after: Option<&Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Unavailable { .. } | Self::Stream(_) => true,
            Self::RateLimited { .. } => true,
            Self::Json(_) | Self::Api { .. } => false,
        }
    }

    /// Suggested delay before retrying, if the endpoint provided one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be (de)serialised
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot contents violate an invariant
    #[error("store is inconsistent: {0}")]
    Corrupt(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A stream rule rejected by the endpoint's syntax validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRejection {
    pub name: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for RuleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.value, self.message)
    }
}

/// Top-level collection failures.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Network kept failing after the bounded retries. The cursor resumes the call.
    #[error("transient network failure after retries: {source}")]
    TransientNetworkFailure { cursor: Cursor, source: ApiError },

    /// Endpoint rejected the request in a way retries cannot fix.
    #[error("collection failed: {source}")]
    Fatal {
        cursor: Option<Cursor>,
        source: ApiError,
    },

    /// Stream rules failed syntax validation; remote state was not changed.
    #[error("rule validation failed: {}", join_rejections(.0))]
    RuleValidationFailure(Vec<RuleRejection>),

    /// Stream could not be re-established.
    #[error("stream reconnect exhausted after {attempts} attempts: {last_error}")]
    StreamReconnectExhausted { attempts: u32, last_error: String },

    /// One backfill window failed; it stays pending.
    #[error("backfill window {window} failed: {reason}")]
    BackfillWindowFailure { window: TimeWindow, reason: String },

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persistence problem
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Raw API failure outside a paginated call
    #[error(transparent)]
    Api(#[from] ApiError),
}

fn join_rejections(rejections: &[RuleRejection]) -> String {
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CollectorError {
    /// Whether rerunning the same command later can pick up where this left off.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetworkFailure { .. } | Self::BackfillWindowFailure { .. }
        )
    }

    /// Cursor to resume from, when the failure happened inside a paginated call.
    #[must_use]
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            Self::TransientNetworkFailure { cursor, .. } => Some(cursor),
            Self::Fatal { cursor, .. } => cursor.as_ref(),
            _ => None,
        }
    }
}

/// Result type for collectors.
pub type CollectorResult<T> = Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Unavailable {
            status: 503,
            message: "down".into()
        }
        .is_transient());
        assert!(ApiError::RateLimited { retry_after: None }.is_transient());
        assert!(!ApiError::Api {
            status: 400,
            message: "bad query".into()
        }
        .is_transient());
    }

    #[test]
    fn test_rate_limit_message() {
        let err = ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 30s");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_rule_validation_message() {
        let err = CollectorError::RuleValidationFailure(vec![RuleRejection {
            name: "evtA".into(),
            value: "(unbalanced".into(),
            message: "mismatched parenthesis".into(),
        }]);
        assert!(err.to_string().contains("evtA"));
        assert!(!err.is_resumable());
    }
}
