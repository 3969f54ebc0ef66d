//! Fleet error types.
//!
//! Two families of errors live here:
//!
//! - [`FleetError`]: something went wrong while *driving* the engine
//!   (unknown session, invalid operation for the current state, transport
//!   or configuration failure). Returned from `Agency` methods.
//! - [`ProtocolFailure`]: the terminal outcome of a protocol instance that did
//!   not succeed. This is what `notify_finish()` resolves with on failure and is
//!   an expected value, not a bug.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::SessionId;

/// Engine and API errors.
#[derive(Error, Debug)]
pub enum FleetError {
    /// No session with this id is owned by the agency.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Operation is not valid in the session's current state.
    #[error("Cannot {operation} session {session_id} in state {state}")]
    InvalidState {
        /// Session the operation targeted.
        session_id: SessionId,
        /// Current state, rendered for display.
        state: String,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// No interest registered for this protocol.
    #[error("No interest registered for protocol {0}")]
    UnknownInterest(String),

    /// Interest registered twice for the same protocol.
    #[error("Interest already registered for protocol {0}")]
    DuplicateInterest(String),

    /// Transport failure while posting or binding.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Replay journal does not match the operations being replayed.
    #[error("Replay error: {0}")]
    Replay(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

/// Why a protocol instance ended without a result.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ProtocolFailure {
    /// A timeout fired and no further progress was possible.
    #[error("Protocol expired")]
    Expired,

    /// The protocol was cancelled explicitly, by us or by the peer.
    #[error("Protocol cancelled: {0}")]
    Cancelled(String),

    /// A business hook failed or the peer aborted.
    #[error("Protocol failed: {0}")]
    Failed(String),

    /// A role broke its own state machine contract.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl ProtocolFailure {
    /// Whether a retry against a fresh candidate set can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolFailure::Expired | ProtocolFailure::Failed(_))
    }

    /// Build a `Failed` from a business hook error, keeping the whole chain.
    pub fn from_hook(err: &anyhow::Error) -> Self {
        ProtocolFailure::Failed(format!("{err:#}"))
    }
}

/// Result a finished initiator resolves with.
pub type Outcome = std::result::Result<serde_json::Value, ProtocolFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ProtocolFailure::Expired.is_retryable());
        assert!(ProtocolFailure::Failed("boom".into()).is_retryable());
        assert!(!ProtocolFailure::Cancelled("stop".into()).is_retryable());
        assert!(!ProtocolFailure::InvariantViolation("bid twice".into()).is_retryable());
    }

    #[test]
    fn test_hook_error_keeps_context() {
        let err = anyhow::anyhow!("disk full").context("allocating volume");
        let failure = ProtocolFailure::from_hook(&err);
        assert_eq!(
            failure,
            ProtocolFailure::Failed("allocating volume: disk full".into())
        );
    }

    #[test]
    fn test_failure_serialization() {
        let json = serde_json::to_string(&ProtocolFailure::Cancelled("shutdown".into())).unwrap();
        assert_eq!(json, r#"{"kind":"cancelled","reason":"shutdown"}"#);
        let expired = serde_json::to_string(&ProtocolFailure::Expired).unwrap();
        assert_eq!(expired, r#"{"kind":"expired"}"#);
    }
}
