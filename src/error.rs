//! Error types for the coordinator
//!
//! Defines a unified error type that can represent errors from the log store,
//! the participants, the wire protocol and the coordinator itself.

use std::io;

use thiserror::Error;

use crate::coordinator::fault::ControlPoint;
use crate::coordinator::types::{TxnId, TxnState};

/// Unified error type for coordinator operations
#[derive(Debug, Error)]
pub enum TwoPcError {
    /// I/O error (WAL files, network)
    #[error("{0}")]
    Io(#[from] io::Error),
    /// Encoding or decoding failure (bincode, JSON)
    #[error("codec error: {0}")]
    Codec(String),
    /// The log store refused a state change the protocol does not allow
    #[error("transaction {txn_id}: illegal transition {} -> {to}", .from.map(|s| s.as_str()).unwrap_or("(none)"))]
    InvalidTransition {
        txn_id: TxnId,
        from: Option<TxnState>,
        to: TxnState,
    },
    /// Malformed transaction identifier
    #[error("invalid transaction id: {0}")]
    InvalidTxnId(String),
    /// The transaction is already recorded and not yet terminal
    #[error("transaction {0} is already in flight; recovery will resolve it")]
    InFlight(TxnId),
    /// Phase 1 failed because a participant refused or errored
    #[error("prepare failed [{participant}]: {reason}")]
    PrepareFailed { participant: String, reason: String },
    /// Phase 1 ran out of its time budget
    #[error("prepare timed out after {after_ms} ms (waiting on: {})", .pending.join(", "))]
    PrepareTimeout { after_ms: u64, pending: Vec<String> },
    /// A participant reported a failure
    #[error("participant {participant}: {message}")]
    Participant { participant: String, message: String },
    /// The participant could not be reached
    #[error("rpc error [{endpoint}]: {message}")]
    Rpc { endpoint: String, message: String },
    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Handshake rejected
    #[error("authentication failed: {0}")]
    Auth(String),
    /// A fault hook stopped the flow at a control point
    #[error("halted at control point {0}")]
    Halted(ControlPoint),
    /// Bad configuration value
    #[error("configuration error: {0}")]
    Config(String),
    /// Generic internal error
    #[error("{0}")]
    Internal(String),
}

impl TwoPcError {
    /// Shorthand for a participant-side failure
    pub fn participant(participant: impl Into<String>, message: impl Into<String>) -> Self {
        TwoPcError::Participant {
            participant: participant.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from durable storage (log writes and reads)
    pub fn is_storage(&self) -> bool {
        matches!(self, TwoPcError::Io(_) | TwoPcError::Codec(_))
    }
}

impl From<bincode::Error> for TwoPcError {
    fn from(e: bincode::Error) -> Self {
        TwoPcError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for TwoPcError {
    fn from(e: serde_json::Error) -> Self {
        TwoPcError::Codec(e.to_string())
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, TwoPcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = TwoPcError::InvalidTransition {
            txn_id: TxnId::from("tx-1"),
            from: Some(TxnState::Prepared),
            to: TxnState::Aborted,
        };
        assert_eq!(
            err.to_string(),
            "transaction tx-1: illegal transition PREPARED -> ABORTED"
        );

        let err = TwoPcError::InvalidTransition {
            txn_id: TxnId::from("tx-2"),
            from: None,
            to: TxnState::Committed,
        };
        assert!(err.to_string().contains("(none) -> COMMITTED"));
    }

    #[test]
    fn test_prepare_failed_names_participant() {
        let err = TwoPcError::PrepareFailed {
            participant: "ledger-a".to_string(),
            reason: "resource already locked".to_string(),
        };
        assert_eq!(err.to_string(), "prepare failed [ledger-a]: resource already locked");
    }

    #[test]
    fn test_prepare_timeout_lists_pending() {
        let err = TwoPcError::PrepareTimeout {
            after_ms: 5000,
            pending: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().contains("waiting on: a, b"));
    }

    #[test]
    fn test_storage_classification() {
        let io = TwoPcError::from(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(io.is_storage());
        assert!(TwoPcError::Codec("bad frame".into()).is_storage());
        assert!(!TwoPcError::participant("a", "nope").is_storage());
    }
}
