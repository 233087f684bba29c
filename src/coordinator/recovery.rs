//! Recovery worker: finishes transactions a crash or a failed phase 2 left
//! behind
//!
//! Each sweep reads the active set from the log store and re-drives phase 2:
//!
//! - PREPARED: the commit point was reached, so deliver commit; log
//!   COMMITTED once every participant confirmed
//! - START: no decision was ever logged, so deliver rollback; log ABORTED
//!   once every participant confirmed
//!
//! The decision comes from the log's state at the moment the record is
//! handled, not from the sweep's snapshot, and ids with an `execute` running
//! in this process are skipped. A record any participant failed on is left
//! as it is and retried on the next sweep. Participants treat repeated commit/rollback as no-ops, so
//! re-delivery is harmless.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use super::manager::{Decision, TransactionManager};
use super::types::{TxnId, TxnState};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: Vec<TxnId>,
    pub aborted: Vec<TxnId>,
    /// Left unresolved because a participant or the log failed
    pub deferred: Vec<TxnId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.aborted.is_empty() && self.deferred.is_empty()
    }
}

enum Resolution {
    Committed,
    Aborted,
    Deferred,
    Skipped,
}

impl TransactionManager {
    /// Run a single recovery sweep over every pending transaction
    pub async fn recover_once(&self) -> Result<RecoveryReport> {
        self.recovery_sweep(None).await
    }

    async fn recovery_sweep(&self, cancel: Option<&CancellationToken>) -> Result<RecoveryReport> {
        let pending = self.log_store().get_pending().await?;
        let mut report = RecoveryReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        log::info!("Recovery: {} pending transactions", pending.len());
        for record in pending {
            if cancel.map_or(false, |token| token.is_cancelled()) {
                log::info!("Recovery: cancelled, leaving remaining transactions for later");
                break;
            }
            match self.resolve(&record.id).await {
                Resolution::Committed => report.committed.push(record.id),
                Resolution::Aborted => report.aborted.push(record.id),
                Resolution::Deferred => report.deferred.push(record.id),
                Resolution::Skipped => {}
            }
        }

        log::info!(
            "Recovery sweep complete: {} committed, {} aborted, {} deferred",
            report.committed.len(),
            report.aborted.len(),
            report.deferred.len()
        );
        Ok(report)
    }

    async fn resolve(&self, txn_id: &TxnId) -> Resolution {
        // Held until the terminal state is logged, so `execute` cannot race us
        let _guard = match self.claim(txn_id) {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Recovery: {} is still executing, skipping", txn_id);
                return Resolution::Skipped;
            }
        };

        // The sweep's snapshot may be stale; decide on what the log says now
        let record = match self.log_store().get_state(txn_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Resolution::Skipped,
            Err(e) => {
                log::error!("Recovery: failed to read state of {}: {}", txn_id, e);
                return Resolution::Deferred;
            }
        };

        let (decision, terminal) = match record.state {
            TxnState::Prepared => (Decision::Commit, TxnState::Committed),
            TxnState::Start => (Decision::Rollback, TxnState::Aborted),
            TxnState::Committed | TxnState::Aborted => return Resolution::Skipped,
        };

        log::info!("Recovery: {} is {}, driving {}", txn_id, record.state, decision);
        let report = self.drive_phase2(txn_id, decision).await;
        if !report.is_complete() {
            log::warn!(
                "Recovery: {} {} not confirmed by {}; will retry",
                txn_id,
                decision,
                report.failed.join(", ")
            );
            return Resolution::Deferred;
        }

        if let Err(e) = self.log_store().update_state(txn_id, terminal).await {
            log::error!("Recovery: failed to log {} for {}: {}", terminal, txn_id, e);
            return Resolution::Deferred;
        }
        log::info!("Recovery: {} {}", txn_id, terminal);

        match terminal {
            TxnState::Committed => Resolution::Committed,
            _ => Resolution::Aborted,
        }
    }
}

/// Run recovery in the background until `token` is cancelled.
///
/// The first sweep starts immediately; later ones follow every
/// `recovery_interval`. Each tick also purges expired log records.
pub fn spawn_recovery_worker(manager: Arc<TransactionManager>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = manager.config().recovery_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Recovery worker started (interval {:?})", interval);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = manager.recovery_sweep(Some(&token)).await {
                log::error!("Recovery sweep failed: {}", e);
            }

            match manager.log_store().purge_expired().await {
                Ok(0) => {}
                Ok(n) => log::info!("Recovery: purged {} expired records", n),
                Err(e) => log::warn!("Purging expired records failed: {}", e),
            }
        }

        log::info!("Recovery worker stopped");
    })
}
