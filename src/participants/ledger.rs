//! In-memory ledger participant
//!
//! Prepare takes a lease on one account and stages a balance change; commit
//! applies it and releases the lease; rollback just releases. Leases expire
//! so that a coordinator which disappears between phases cannot lock the
//! account forever.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::coordinator::participant::Participant;
use crate::coordinator::types::TxnId;
use crate::error::{Result, TwoPcError};

/// How long a prepared transaction may hold the account
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Lease {
    txn_id: TxnId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    /// account -> lease holder
    leases: HashMap<String, Lease>,
    /// Staged deltas, invisible until commit
    staged: HashMap<TxnId, i64>,
    committed: HashSet<TxnId>,
}

/// A participant that moves a fixed amount on one account per transaction
pub struct LedgerParticipant {
    name: String,
    account: String,
    delta: i64,
    lease_ttl: Duration,
    state: Mutex<LedgerState>,
}

impl LedgerParticipant {
    pub fn new(name: impl Into<String>, account: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            account: account.into(),
            delta,
            lease_ttl: DEFAULT_LEASE_TTL,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Seed an account balance
    pub fn with_balance(self, account: impl Into<String>, balance: i64) -> Self {
        self.lock().balances.insert(account.into(), balance);
        self
    }

    /// Committed balance of `account` (0 if never touched)
    pub fn balance(&self, account: &str) -> i64 {
        self.lock().balances.get(account).copied().unwrap_or(0)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Whether `txn_id` currently holds the account
    pub fn holds_lease(&self, txn_id: &TxnId) -> bool {
        self.lock()
            .leases
            .get(&self.account)
            .map(|lease| lease.txn_id == *txn_id && lease.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Participant for LedgerParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, txn_id: &TxnId) -> Result<()> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.committed.contains(txn_id) {
            return Ok(());
        }

        if let Some(lease) = state.leases.get(&self.account) {
            if lease.txn_id == *txn_id && state.staged.contains_key(txn_id) {
                log::debug!("{}: {} already prepared", self.name, txn_id);
                return Ok(());
            }
            if lease.expires_at > now {
                return Err(TwoPcError::participant(
                    &self.name,
                    format!("resource already locked by another transaction ({})", self.account),
                ));
            }

            // Expired: the holder's coordinator never came back
            let stale = lease.txn_id.clone();
            log::warn!("{}: reclaiming expired lease on {} from {}", self.name, self.account, stale);
            state.staged.remove(&stale);
        }

        state.leases.insert(
            self.account.clone(),
            Lease {
                txn_id: txn_id.clone(),
                expires_at: now + self.lease_ttl,
            },
        );
        state.staged.insert(txn_id.clone(), self.delta);
        log::debug!("{}: {} prepared, staged {} on {}", self.name, txn_id, self.delta, self.account);
        Ok(())
    }

    async fn commit(&self, txn_id: &TxnId) -> Result<()> {
        let mut state = self.lock();

        if state.committed.contains(txn_id) {
            return Ok(());
        }

        let delta = state.staged.remove(txn_id).ok_or_else(|| {
            TwoPcError::participant(&self.name, format!("transaction {} not prepared", txn_id))
        })?;

        *state.balances.entry(self.account.clone()).or_insert(0) += delta;
        if state
            .leases
            .get(&self.account)
            .map_or(false, |lease| lease.txn_id == *txn_id)
        {
            state.leases.remove(&self.account);
        }
        state.committed.insert(txn_id.clone());
        log::info!("{}: {} committed, {} {:+}", self.name, txn_id, self.account, delta);
        Ok(())
    }

    async fn rollback(&self, txn_id: &TxnId) -> Result<()> {
        let mut state = self.lock();
        state.staged.remove(txn_id);
        if state
            .leases
            .get(&self.account)
            .map_or(false, |lease| lease.txn_id == *txn_id)
        {
            state.leases.remove(&self.account);
            log::debug!("{}: {} rolled back, released {}", self.name, txn_id, self.account);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> LedgerParticipant {
        LedgerParticipant::new("ledger-a", "acct-1", -100).with_balance("acct-1", 500)
    }

    #[tokio::test]
    async fn test_prepare_then_commit_applies_delta() {
        let p = ledger();
        let tx = TxnId::from("tx-1");

        p.prepare(&tx).await.unwrap();
        // Staged change is invisible until commit
        assert_eq!(p.balance("acct-1"), 500);
        assert!(p.holds_lease(&tx));

        p.commit(&tx).await.unwrap();
        assert_eq!(p.balance("acct-1"), 400);
        assert!(!p.holds_lease(&tx));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let p = ledger();
        let tx = TxnId::from("tx-1");
        p.prepare(&tx).await.unwrap();
        p.commit(&tx).await.unwrap();
        p.commit(&tx).await.unwrap();
        assert_eq!(p.balance("acct-1"), 400);
    }

    #[tokio::test]
    async fn test_commit_without_prepare_fails() {
        let p = ledger();
        let err = p.commit(&TxnId::from("tx-unknown")).await.unwrap_err();
        assert!(err.to_string().contains("not prepared"));
        assert_eq!(p.balance("acct-1"), 500);
    }

    #[tokio::test]
    async fn test_second_transaction_is_locked_out() {
        let p = ledger();
        let tx1 = TxnId::from("tx-1");
        let tx2 = TxnId::from("tx-2");

        p.prepare(&tx1).await.unwrap();
        let err = p.prepare(&tx2).await.unwrap_err();
        assert!(err.to_string().contains("resource already locked"));

        // Once tx-1 is resolved the account is free again
        p.rollback(&tx1).await.unwrap();
        p.prepare(&tx2).await.unwrap();
        p.commit(&tx2).await.unwrap();
        assert_eq!(p.balance("acct-1"), 400);
    }

    #[tokio::test]
    async fn test_reprepare_same_transaction() {
        let p = ledger();
        let tx = TxnId::from("tx-1");
        p.prepare(&tx).await.unwrap();
        p.prepare(&tx).await.unwrap();
        p.commit(&tx).await.unwrap();
        assert_eq!(p.balance("acct-1"), 400);
    }

    #[tokio::test]
    async fn test_rollback_is_always_safe() {
        let p = ledger();
        let tx = TxnId::from("tx-1");
        p.rollback(&tx).await.unwrap();

        p.prepare(&tx).await.unwrap();
        p.rollback(&tx).await.unwrap();
        p.rollback(&tx).await.unwrap();
        assert_eq!(p.balance("acct-1"), 500);
        assert!(p.commit(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let p = ledger().with_lease_ttl(Duration::from_millis(20));
        let abandoned = TxnId::from("tx-abandoned");
        let next = TxnId::from("tx-next");

        p.prepare(&abandoned).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        p.prepare(&next).await.unwrap();
        assert!(p.holds_lease(&next));
        // The abandoned stage is gone, so it can no longer commit
        assert!(p.commit(&abandoned).await.is_err());

        p.commit(&next).await.unwrap();
        assert_eq!(p.balance("acct-1"), 400);
    }
}
