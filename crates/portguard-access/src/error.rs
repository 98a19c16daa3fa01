//! Error taxonomy for the access-control plane.
//!
//! Every operation that can fail returns one of these variants; nothing
//! crosses the control-API boundary as a panic. Each variant maps to a
//! stable [`ErrorCategory`] the facade serializes to callers.

use crate::store::StoreError;
use portguard_types::{MacAddress, ParseError, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure categories surfaced over the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Malformed input; never retried.
    InvalidInput,
    /// Refused by policy (blocked device, ceilings); retry after remediation.
    PolicyDenied,
    /// A conflicting claim was detected and resolved; warning, not failure.
    Conflict,
    /// The rule backend failed transiently; state is consistent and
    /// reconciliation will retry.
    EnforcerTransient,
    /// The rule backend rejected the rules permanently.
    EnforcerPermanent,
    /// Ledger and backend diverge beyond what reconciliation resolves.
    Inconsistent,
    /// The referenced record does not exist.
    NotFound,
}

/// Error type for access-control operations.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("device {mac} is blocked: {reason}")]
    BlockedDevice { mac: MacAddress, reason: String },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} is already terminated")]
    AlreadyTerminated(SessionId),

    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    #[error("extension would exceed the session duration ceiling")]
    DurationCeiling,

    #[error("a session with the requested id already exists")]
    DuplicateSession(SessionId),

    #[error("superseded by a concurrent grant for {0}")]
    Superseded(MacAddress),

    #[error("rule backend failed: {0}")]
    EnforcerFailed(String),

    #[error("rule backend rejected rules: {0}")]
    EnforcerRejected(String),

    #[error("ledger and backend state diverged: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl AccessError {
    /// The category serialized across the API boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AccessError::InvalidInput(_) | AccessError::Parse(_) | AccessError::DurationCeiling => {
                ErrorCategory::InvalidInput
            }
            AccessError::BlockedDevice { .. } => ErrorCategory::PolicyDenied,
            AccessError::Superseded(_) | AccessError::DuplicateSession(_) => ErrorCategory::Conflict,
            AccessError::EnforcerFailed(_) => ErrorCategory::EnforcerTransient,
            AccessError::EnforcerRejected(_) => ErrorCategory::EnforcerPermanent,
            AccessError::Inconsistent(_) | AccessError::Store(_) => ErrorCategory::Inconsistent,
            AccessError::SessionNotFound(_) => ErrorCategory::NotFound,
            AccessError::AlreadyTerminated(_) | AccessError::SessionExpired(_) => {
                ErrorCategory::InvalidInput
            }
        }
    }

    /// The session the failure refers to, when one exists.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            AccessError::SessionNotFound(id)
            | AccessError::AlreadyTerminated(id)
            | AccessError::SessionExpired(id)
            | AccessError::DuplicateSession(id) => Some(id),
            _ => None,
        }
    }
}

/// Result type for access-control operations.
pub type AccessResult<T> = Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(
            AccessError::BlockedDevice {
                mac,
                reason: "abuse".into()
            }
            .category(),
            ErrorCategory::PolicyDenied
        );
        assert_eq!(
            AccessError::EnforcerFailed("timeout".into()).category(),
            ErrorCategory::EnforcerTransient
        );
        assert_eq!(
            AccessError::EnforcerRejected("bad syntax".into()).category(),
            ErrorCategory::EnforcerPermanent
        );
        assert_eq!(
            AccessError::Superseded(mac).category(),
            ErrorCategory::Conflict
        );
    }

    #[test]
    fn test_session_extraction() {
        let id = SessionId::generate();
        assert_eq!(
            AccessError::SessionNotFound(id.clone()).session(),
            Some(&id)
        );
        assert!(AccessError::InvalidInput("x".into()).session().is_none());
    }
}
