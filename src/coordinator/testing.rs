//! Scriptable participant and log store doubles for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TwoPcError};
use super::log_store::{LogStore, MemoryLogStore};
use super::participant::Participant;
use super::types::{TransactionRecord, TxnId, TxnState};

/// Participant that counts calls and fails on request
pub(crate) struct MockParticipant {
    name: String,
    prepare_error: Option<String>,
    prepare_delay: Duration,
    commit_delay: Duration,
    commit_failures_left: AtomicUsize,
    rollback_failures_left: AtomicUsize,
    prepares: AtomicUsize,
    commit_calls: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MockParticipant {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prepare_error: None,
            prepare_delay: Duration::ZERO,
            commit_delay: Duration::ZERO,
            commit_failures_left: AtomicUsize::new(0),
            rollback_failures_left: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_prepare(mut self, message: &str) -> Self {
        self.prepare_error = Some(message.to_string());
        self
    }

    pub(crate) fn slow_prepare(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub(crate) fn slow_commit(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    /// Fail the next `n` commit calls
    pub(crate) fn commit_failures(self, n: usize) -> Self {
        self.commit_failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` rollback calls
    pub(crate) fn rollback_failures(self, n: usize) -> Self {
        self.rollback_failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// Commit calls, including failed ones
    pub(crate) fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Successful commits
    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Participant for MockParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _txn_id: &TxnId) -> Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if !self.prepare_delay.is_zero() {
            tokio::time::sleep(self.prepare_delay).await;
        }
        match &self.prepare_error {
            Some(message) => Err(TwoPcError::participant(&self.name, message.clone())),
            None => Ok(()),
        }
    }

    async fn commit(&self, _txn_id: &TxnId) -> Result<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        if take_failure(&self.commit_failures_left) {
            return Err(TwoPcError::participant(&self.name, "commit unavailable"));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _txn_id: &TxnId) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.rollback_failures_left) {
            return Err(TwoPcError::participant(&self.name, "rollback unavailable"));
        }
        Ok(())
    }
}

/// Memory log store whose writes of one state fail with an I/O error
pub(crate) struct FailingLogStore {
    inner: MemoryLogStore,
    fail_on: TxnState,
}

impl FailingLogStore {
    pub(crate) fn new(fail_on: TxnState) -> Self {
        Self {
            inner: MemoryLogStore::new(),
            fail_on,
        }
    }
}

#[async_trait]
impl LogStore for FailingLogStore {
    async fn update_state(&self, txn_id: &TxnId, state: TxnState) -> Result<()> {
        if state == self.fail_on {
            return Err(TwoPcError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.update_state(txn_id, state).await
    }

    async fn check_started(&self, txn_id: &TxnId) -> Result<bool> {
        self.inner.check_started(txn_id).await
    }

    async fn get_pending(&self) -> Result<Vec<TransactionRecord>> {
        self.inner.get_pending().await
    }

    async fn get_state(&self, txn_id: &TxnId) -> Result<Option<TransactionRecord>> {
        self.inner.get_state(txn_id).await
    }
}
