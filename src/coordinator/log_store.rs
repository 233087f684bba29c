//! Log store contract and the in-memory implementation
//!
//! The log store is the single source of truth for transaction state. The
//! transaction manager and the recovery worker only ever touch state through
//! the [`LogStore`] trait.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TwoPcError};
use super::types::{now_millis, TransactionRecord, TxnId, TxnState};

/// How long terminal records stay queryable by default
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable, queryable record of every transaction's current phase.
///
/// Implementations must apply each `update_state` atomically with respect to
/// the active set, and must not retry internally: a failed write is returned
/// so the coordinator never proceeds past an unconfirmed log entry.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Durably set the transaction's current state.
    ///
    /// START and PREPARED add the id to the active set; COMMITTED and ABORTED
    /// remove it and start the retention clock.
    async fn update_state(&self, txn_id: &TxnId, state: TxnState) -> Result<()>;

    /// True only if the transaction already reached a terminal state
    async fn check_started(&self, txn_id: &TxnId) -> Result<bool>;

    /// Every transaction in the active set with its last recorded state
    async fn get_pending(&self) -> Result<Vec<TransactionRecord>>;

    /// Point lookup; expired terminal records are reported as absent
    async fn get_state(&self, txn_id: &TxnId) -> Result<Option<TransactionRecord>>;

    /// Drop terminal records older than the retention window.
    /// Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory index shared by both log store implementations.
///
/// Holds the latest record per transaction and the active set, and enforces
/// the state machine on every change.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    records: HashMap<TxnId, TransactionRecord>,
    active: HashSet<TxnId>,
}

impl LogIndex {
    /// Reject transitions the protocol does not allow. An expired terminal
    /// record counts as absent, as it does for readers.
    pub(crate) fn check_transition(
        &self,
        txn_id: &TxnId,
        to: TxnState,
        now: u64,
        retention_ms: u64,
    ) -> Result<()> {
        let from = self.get(txn_id, now, retention_ms).map(|r| r.state);
        if TxnState::can_transition(from, to) {
            Ok(())
        } else {
            Err(TwoPcError::InvalidTransition {
                txn_id: txn_id.clone(),
                from,
                to,
            })
        }
    }

    /// Apply an already-validated record, keeping the active set in step
    pub(crate) fn apply(&mut self, record: TransactionRecord) {
        if record.state.is_terminal() {
            self.active.remove(&record.id);
        } else {
            self.active.insert(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    pub(crate) fn get(&self, txn_id: &TxnId, now: u64, retention_ms: u64) -> Option<&TransactionRecord> {
        self.records
            .get(txn_id)
            .filter(|r| !r.is_expired(now, retention_ms))
    }

    pub(crate) fn pending(&self) -> Vec<TransactionRecord> {
        self.active
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    pub(crate) fn count_expired(&self, now: u64, retention_ms: u64) -> usize {
        self.records
            .values()
            .filter(|r| r.is_expired(now, retention_ms))
            .count()
    }

    pub(crate) fn purge_expired(&mut self, now: u64, retention_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now, retention_ms));
        before - self.records.len()
    }

    /// Records that must survive a compaction: everything active plus
    /// terminal records still inside the retention window
    pub(crate) fn live_records(&self, now: u64, retention_ms: u64) -> Vec<TransactionRecord> {
        let mut live: Vec<TransactionRecord> = self
            .records
            .values()
            .filter(|r| !r.is_expired(now, retention_ms))
            .cloned()
            .collect();
        live.sort_by_key(|r| r.updated_at);
        live
    }

    pub(crate) fn active_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Process-local log store.
///
/// Not durable across restarts; used by tests, demos and as the reference
/// for the contract. Each operation is one critical section, so readers never
/// see a state change without its active-set change.
pub struct MemoryLogStore {
    index: Mutex<LogIndex>,
    retention: Duration,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            index: Mutex::new(LogIndex::default()),
            retention,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogIndex>> {
        self.index
            .lock()
            .map_err(|_| TwoPcError::Internal("log index lock poisoned".to_string()))
    }

    fn retention_ms(&self) -> u64 {
        self.retention.as_millis() as u64
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn update_state(&self, txn_id: &TxnId, state: TxnState) -> Result<()> {
        let mut index = self.lock()?;
        let now = now_millis();
        index.check_transition(txn_id, state, now, self.retention_ms())?;
        index.apply(TransactionRecord::new(txn_id.clone(), state, now));
        Ok(())
    }

    async fn check_started(&self, txn_id: &TxnId) -> Result<bool> {
        let index = self.lock()?;
        Ok(index
            .get(txn_id, now_millis(), self.retention_ms())
            .map(|r| r.state.is_terminal())
            .unwrap_or(false))
    }

    async fn get_pending(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.lock()?.pending())
    }

    async fn get_state(&self, txn_id: &TxnId) -> Result<Option<TransactionRecord>> {
        let index = self.lock()?;
        Ok(index.get(txn_id, now_millis(), self.retention_ms()).cloned())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let removed = self.lock()?.purge_expired(now_millis(), self.retention_ms());
        if removed > 0 {
            log::debug!("Purged {} expired transaction records", removed);
        }
        Ok(removed)
    }
}
