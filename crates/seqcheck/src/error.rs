//! Error taxonomy for the write and verification paths.
//!
//! Connection and apply failures are recovered locally by the writer and only
//! surface as statistics and log lines. A [`FatalStartupError`] is the single
//! error that reaches the process boundary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to obtain a session before any write was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connect to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
    #[error("connect to {endpoint} failed: {cause}")]
    Failed { endpoint: String, cause: String },
}

impl ConnectionError {
    pub fn timeout(endpoint: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            timeout_ms: limit.as_millis() as u64,
        }
    }

    pub fn failed(endpoint: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Failed {
            endpoint: endpoint.into(),
            cause: cause.into(),
        }
    }
}

/// Coarse classification of a failed write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    /// The endpoint rejected the write because it is read-only (failover signal).
    ReadOnly,
    /// The attempt did not complete within its timeout.
    Timeout,
    /// The connection broke while the attempt was in flight.
    Transport,
    /// The server answered with any other rejection.
    Rejected,
}

impl ApplyErrorKind {
    /// Stable snake_case name used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApplyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write attempt that reached (or tried to reach) the server and failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ApplyError {
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    pub fn new(kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds a server rejection, promoting it to [`ApplyErrorKind::ReadOnly`]
    /// when the cause text names a read-only endpoint.
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if is_read_only_text(&message) {
            ApplyErrorKind::ReadOnly
        } else {
            ApplyErrorKind::Rejected
        };
        Self { kind, message }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::Transport, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ApplyErrorKind::Timeout,
            format!("attempt timed out after {}ms", limit.as_millis()),
        )
    }

    /// Endpoint refused the write because it is not the primary.
    pub fn is_read_only(&self) -> bool {
        self.kind == ApplyErrorKind::ReadOnly
    }

    /// Whether the session that produced this error must be released rather
    /// than probed and reused on the next tick.
    ///
    /// A read-only endpoint is a demoted primary; staying on it would retry
    /// against the wrong node forever.
    pub fn invalidates_session(&self) -> bool {
        !matches!(self.kind, ApplyErrorKind::Rejected)
    }
}

/// Returns true when a failure message says the endpoint is read-only.
pub fn is_read_only_text(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.contains("read-only") || lowered.contains("read only")
}

/// Cause attached to a retryable write result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] ConnectionError),
    #[error("apply failed: {0}")]
    Apply(#[source] ApplyError),
}

impl WriteError {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Apply(err) if err.is_read_only())
    }
}

/// Startup failure: the writer never obtained a valid cursor.
#[derive(Debug, Error)]
pub enum FatalStartupError {
    #[error("writer id must not be empty")]
    EmptyWriterId,
    #[error("initial connection failed: {0}")]
    Connect(#[source] ConnectionError),
    #[error("table initialization failed: {0}")]
    Schema(#[source] ApplyError),
    #[error("resume-state query failed: {0}")]
    Resume(#[source] ApplyError),
}

/// Read-path failure raised while verifying stored records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record source {source_name} unavailable: {cause}")]
    Unavailable { source_name: String, cause: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("column {column} holds out-of-range value {value}")]
    OutOfRange { column: &'static str, value: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_text_matches_both_spellings() {
        assert!(is_read_only_text(
            "cannot execute INSERT in a read-only transaction"
        ));
        assert!(is_read_only_text(
            "The MariaDB server is running with the --read-only option"
        ));
        assert!(is_read_only_text("database is READ ONLY"));
        assert!(!is_read_only_text("duplicate key value violates constraint"));
    }

    #[test]
    fn rejected_promotes_read_only_causes() {
        let err = ApplyError::rejected("cannot execute INSERT in a read-only transaction");
        assert_eq!(err.kind, ApplyErrorKind::ReadOnly);
        assert!(err.invalidates_session());

        let err = ApplyError::rejected("could not serialize access");
        assert_eq!(err.kind, ApplyErrorKind::Rejected);
        assert!(!err.invalidates_session());
    }

    #[test]
    fn write_error_reports_read_only_only_for_apply_failures() {
        let read_only = WriteError::Apply(ApplyError::rejected("server is read only"));
        assert!(read_only.is_read_only());
        let lost = WriteError::ConnectionLost(ConnectionError::failed("db:5432", "refused"));
        assert!(!lost.is_read_only());
    }
}
