//! Enforcer error types.
//!
//! Backend failures fall into two classes that callers treat differently:
//! transient faults (timeouts, tool invocation trouble) leave the ledger
//! authoritative and are retried by reconciliation, while permanent rejects
//! mean the rule can never land on this backend and must escalate.

use std::time::Duration;
use thiserror::Error;

/// Error type for enforcement backend operations.
#[derive(Debug, Error)]
pub enum EnforcerError {
    /// The operation did not complete within its deadline.
    #[error("rule backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend tool could not be invoked at all.
    #[error("failed to invoke {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend parsed the rule and refused it.
    #[error("backend rejected rule: {message}")]
    Rejected { message: String },

    /// The backend is not reachable or not initialized.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
}

impl EnforcerError {
    /// Creates a rejection error with a message.
    pub fn rejected(message: impl Into<String>) -> Self {
        EnforcerError::Rejected {
            message: message.into(),
        }
    }

    /// Creates an unavailability error with a message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        EnforcerError::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EnforcerError::Timeout(_)
                | EnforcerError::Spawn { .. }
                | EnforcerError::Unavailable { .. }
        )
    }
}

/// Result type for enforcement backend operations.
pub type EnforcerResult<T> = Result<T, EnforcerError>;
