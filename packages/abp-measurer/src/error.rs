//! Typed errors for the measurement pipeline.
//!
//! Uses `thiserror` for library errors so callers can match on the failure
//! class of a branch (bad job, bad filter source, browser failure, storage).

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a single crawl attempt.
///
/// An unreachable root target is not represented here; the scheduler reports
/// it as [`crate::CrawlOutcome::Unreachable`].
#[derive(Debug, Error)]
pub enum MeasureError {
    /// Malformed job spec, raised before any side effect
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    /// A filter list could not be fetched; nothing was written
    #[error("invalid filter list at {url}: {source}")]
    InvalidFilterSource {
        url: String,
        #[source]
        source: FetchError,
    },

    /// The browser driver crashed or timed out
    #[error("browser automation failed for {url}: {source}")]
    Automation {
        url: String,
        #[source]
        source: DriverError,
    },

    /// The matcher rejected the rule set
    #[error("rule matcher error: {0}")]
    Matcher(#[from] MatcherError),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A child job could not be enqueued
    #[error("dispatch error: {0}")]
    Dispatch(#[from] QueueError),

    /// A bounded stage ran past its deadline
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },
}

impl MeasureError {
    /// Short label for the failure class, used in job error records.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasureError::Validation(_) => "validation",
            MeasureError::InvalidFilterSource { .. } => "invalid_filter_source",
            MeasureError::Automation { .. } => "automation",
            MeasureError::Matcher(_) => "matcher",
            MeasureError::Storage(_) => "storage",
            MeasureError::Dispatch(_) => "dispatch",
            MeasureError::Timeout { .. } => "timeout",
        }
    }
}

/// Job spec validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("job spec must be a JSON object")]
    NotAnObject,

    #[error("expected an array for \"{field}\"")]
    NotAnArray { field: &'static str },

    #[error("expected at least one url in \"filterListUrls\"")]
    EmptyFilterList,

    #[error("expected a string for \"{field}\"")]
    NotAString { field: &'static str },

    #[error("expected an integer for \"{field}\", received {value}")]
    NotAnInteger { field: &'static str, value: String },

    #[error("expected a valid URL in \"{field}\", received {value}")]
    MalformedUrl { field: &'static str, value: String },

    #[error("expected a domain for \"domain\", received {0}")]
    InvalidDomain(String),

    #[error("\"secs\" must be at most {max}, received {secs}")]
    DwellOutOfRange { secs: u64, max: u64 },

    #[error("one of \"domain\" or \"url\" is required")]
    MissingTarget,

    #[error("tags must be an array of strings (entry {index} is not)")]
    TagNotAString { index: usize },

    #[error("malformed job spec: {0}")]
    Malformed(String),
}

/// Errors fetching a URL over HTTP (probe or filter list download).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("timeout fetching {url}")]
    Timeout { url: String },
}

/// Errors raised by the external browser driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to open browser session: {0}")]
    Session(String),

    #[error("browser crashed: {0}")]
    Crashed(String),

    #[error("browser did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("driver protocol error: {0}")]
    Protocol(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors raised by the external rule matcher.
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("failed to build matcher: {0}")]
    Build(String),
}

/// Storage errors.
///
/// `Conflict` signals a uniqueness violation on insert; the dedup layer
/// resolves it by re-reading the existing row and never lets it escape.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The backend aborted the unit of work to break a deadlock or a
    /// serialization conflict. Nothing was written.
    #[error("unit of work aborted by a concurrent writer: {0}")]
    Contention(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Whether running the same unit of work again may succeed.
    pub fn should_retry(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// Job queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("queue backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for crawl attempts.
pub type Result<T> = std::result::Result<T, MeasureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_retried() {
        let err = StoreError::Contention("deadlock detected".into());
        assert!(err.should_retry());
        assert!(!err.is_conflict());
        assert!(!StoreError::Database("connection reset".into()).should_retry());
        assert!(!StoreError::Conflict {
            entity: "rule",
            key: "abc".into()
        }
        .should_retry());
    }

    #[test]
    fn conflict_is_detected() {
        let err = StoreError::Conflict {
            entity: "rule",
            key: "abc".into(),
        };
        assert!(err.is_conflict());
        assert!(!StoreError::NotFound {
            entity: "rule",
            key: "abc".into()
        }
        .is_conflict());
    }

    #[test]
    fn error_kinds_are_stable() {
        let err = MeasureError::from(ValidationError::EmptyFilterList);
        assert_eq!(err.kind(), "validation");

        let err = MeasureError::Timeout {
            stage: "record",
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "record timed out after 1s");
    }
}
