use async_trait::async_trait;

use crate::error::Result;
use super::types::TxnId;

/// Trait defining the contract every resource manager presents to the
/// coordinator. Local adapters and network clients implement it alike, so the
/// transaction manager drives all of them through one uniform API.
///
/// The coordinator's correctness depends on `commit` and `rollback` being
/// idempotent: recovery may deliver either of them more than once for the
/// same transaction.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &str;

    /// Reversibly stage the transaction's effect and signal readiness.
    /// Staged effects must not be visible to other transactions.
    async fn prepare(&self, txn_id: &TxnId) -> Result<()>;

    /// Make a prepared transaction's effect permanent.
    /// Repeated calls after success must also succeed.
    async fn commit(&self, txn_id: &TxnId) -> Result<()>;

    /// Discard the transaction's staged effect.
    /// Safe to call when `prepare` never ran or the rollback already happened.
    async fn rollback(&self, txn_id: &TxnId) -> Result<()>;
}
