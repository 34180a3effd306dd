//! Error types for the variable store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::Operation;
use crate::id::SessionId;

/// Errors returned by store operations.
///
/// Every failure is detected before any state is touched, so receiving an
/// error means the session is exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// No session with this id exists.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    /// The session was reaped after sitting idle past its TTL.
    #[error("session expired: {0}")]
    SessionExpired(SessionId),

    /// The manager is already hosting its maximum number of sessions.
    #[error("session limit reached ({max})")]
    SessionLimit { max: usize },

    /// Neither an id nor a name matched the identifier.
    #[error("variable not found: {0}")]
    VariableNotFound(String),

    /// The name is already registered in this session.
    #[error("duplicate variable name: {0}")]
    DuplicateName(String),

    /// The type tag is not registered.
    #[error("unknown variable type: {0}")]
    UnknownType(String),

    /// The value has the wrong kind for the variable's type.
    #[error("type error: expected {expected}, found {found}")]
    TypeError { expected: String, found: String },

    /// The value is well-typed but breaks a constraint or a session rule.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// The constraint map itself is malformed.
    #[error("invalid constraint: {message}")]
    InvalidConstraint { message: String },

    /// Optimistic concurrency check failed.
    #[error("version conflict: expected {expected}, current {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Rollback target was never recorded or has been evicted.
    #[error("version not found in history: {version}")]
    VersionNotFound { version: u64 },

    /// The edge would close a cycle in the dependency graph.
    #[error("dependency cycle: {from} -> {to}")]
    CycleDetected { from: String, to: String },

    /// The variable is already locked for optimization.
    #[error("already optimizing (held by {holder})")]
    AlreadyOptimizing { holder: String },

    /// No lock is held by the caller.
    #[error("not optimizing")]
    NotOptimizing,

    /// An access rule denied the operation.
    #[error("access denied: {caller} may not {operation}")]
    AccessDenied { caller: String, operation: Operation },

    /// A non-atomic batch applied some updates and rejected others.
    #[error("partial failure: {} update(s) rejected", failed.len())]
    PartialFailure { failed: Vec<String> },

    /// Internal invariant broken (e.g. a poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of an [`Error`], stable across releases and safe to put
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    SessionExists,
    SessionExpired,
    ResourceExhausted,
    DuplicateName,
    UnknownType,
    TypeError,
    ConstraintViolation,
    InvalidConstraint,
    VersionConflict,
    VersionNotFound,
    CycleDetected,
    AlreadyOptimizing,
    NotOptimizing,
    AccessDenied,
    PartialFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::SessionExists => "session_exists",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::UnknownType => "unknown_type",
            ErrorKind::TypeError => "type_error",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::InvalidConstraint => "invalid_constraint",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::VersionNotFound => "version_not_found",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::AlreadyOptimizing => "already_optimizing",
            ErrorKind::NotOptimizing => "not_optimizing",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SessionNotFound(_) | Error::VariableNotFound(_) => ErrorKind::NotFound,
            Error::SessionExists(_) => ErrorKind::SessionExists,
            Error::SessionExpired(_) => ErrorKind::SessionExpired,
            Error::SessionLimit { .. } => ErrorKind::ResourceExhausted,
            Error::DuplicateName(_) => ErrorKind::DuplicateName,
            Error::UnknownType(_) => ErrorKind::UnknownType,
            Error::TypeError { .. } => ErrorKind::TypeError,
            Error::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Error::InvalidConstraint { .. } => ErrorKind::InvalidConstraint,
            Error::VersionConflict { .. } => ErrorKind::VersionConflict,
            Error::VersionNotFound { .. } => ErrorKind::VersionNotFound,
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::AlreadyOptimizing { .. } => ErrorKind::AlreadyOptimizing,
            Error::NotOptimizing => ErrorKind::NotOptimizing,
            Error::AccessDenied { .. } => ErrorKind::AccessDenied,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn type_error(expected: impl Into<String>, found: &crate::Value) -> Self {
        Error::TypeError {
            expected: expected.into(),
            found: found.kind().to_string(),
        }
    }

    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Error::ConstraintViolation {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_constraint(message: impl Into<String>) -> Self {
        Error::InvalidConstraint {
            message: message.into(),
        }
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn not_found_covers_sessions_and_variables() {
        assert_eq!(
            Error::SessionNotFound(SessionId::new("s")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::VariableNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn display_includes_details() {
        let e = Error::VersionConflict {
            expected: 0,
            actual: 1,
        };
        assert_eq!(e.to_string(), "version conflict: expected 0, current 1");

        let e = Error::type_error("float", &Value::from("x"));
        assert_eq!(e.to_string(), "type error: expected float, found string");

        let e = Error::PartialFailure {
            failed: vec!["a".into(), "b".into()],
        };
        assert!(e.to_string().contains("2 update(s)"));
    }

    #[test]
    fn access_denied_names_operation() {
        let e = Error::AccessDenied {
            caller: "worker-1".into(),
            operation: Operation::Write,
        };
        assert_eq!(e.to_string(), "access denied: worker-1 may not write");
        assert_eq!(e.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::VersionConflict).unwrap();
        assert_eq!(json, "\"version_conflict\"");
        assert_eq!(ErrorKind::VersionConflict.as_str(), "version_conflict");
    }
}
