//! Core transaction types and state management

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwoPcError};

/// Longest accepted transaction id, in bytes.
///
/// Participant backends embed the id in their own identifiers, so it has to
/// stay short.
pub const MAX_TXN_ID_LEN: usize = 200;

/// Globally unique transaction identifier, chosen by the caller before the
/// first log write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(String);

impl TxnId {
    /// Validate and wrap a caller-supplied id
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(TwoPcError::InvalidTxnId("empty id".to_string()));
        }
        if raw.len() > MAX_TXN_ID_LEN {
            return Err(TwoPcError::InvalidTxnId(format!(
                "id is {} bytes, limit is {}",
                raw.len(),
                MAX_TXN_ID_LEN
            )));
        }
        if raw.chars().any(|c| c.is_control() || c == '\'') {
            return Err(TwoPcError::InvalidTxnId(format!(
                "id {:?} contains a control character or quote",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh id of the form `{prefix}-{unix_millis}-{random hex}`
    pub fn generate(prefix: &str) -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self(format!("{}-{}-{:08x}", prefix, now_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TxnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator-side transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Logged before any participant is contacted
    Start,
    /// Every participant prepared; the commit decision is durable
    Prepared,
    Committed,
    Aborted,
}

impl TxnState {
    /// Canonical upper-case name, as stored and displayed
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Start => "START",
            TxnState::Prepared => "PREPARED",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    /// Whether the log may move a transaction from `from` to `to`.
    ///
    /// Re-writing the same terminal state is accepted so that a repeated
    /// phase-2 completion is a no-op rather than an error.
    pub fn can_transition(from: Option<TxnState>, to: TxnState) -> bool {
        match (from, to) {
            (None, TxnState::Start) => true,
            (Some(TxnState::Start), TxnState::Prepared) => true,
            (Some(TxnState::Start), TxnState::Aborted) => true,
            (Some(TxnState::Prepared), TxnState::Committed) => true,
            (Some(current), next) if current.is_terminal() => current == next,
            _ => false,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The log store's view of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxnId,
    pub state: TxnState,
    /// Unix epoch millis of the last transition
    pub updated_at: u64,
}

impl TransactionRecord {
    pub fn new(id: TxnId, state: TxnState, updated_at: u64) -> Self {
        Self {
            id,
            state,
            updated_at,
        }
    }

    /// Whether a terminal record has outlived the retention window
    pub fn is_expired(&self, now: u64, retention_ms: u64) -> bool {
        self.state.is_terminal() && now.saturating_sub(self.updated_at) >= retention_ms
    }
}

/// Current time in unix epoch milliseconds
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}
