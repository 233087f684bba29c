//! Two-phase commit coordinator
//!
//! ## Components
//!
//! - [`TransactionManager`]: drives one transaction through prepare and
//!   commit/rollback against a fixed set of participants
//! - [`LogStore`]: the coordinator's write-ahead log; [`MemoryLogStore`] for
//!   tests and demos, [`FileLogStore`] for durable deployments
//! - Recovery: [`spawn_recovery_worker`] periodically re-drives phase 2 for
//!   every transaction the log still lists as active
//! - [`FaultHook`]: named control points for crash testing
//!
//! ## Protocol
//!
//! ```text
//! (none) --START--> START --all prepared--> PREPARED --all committed--> COMMITTED
//!                     |
//!                     +--any prepare failed--> rollback sweep --> ABORTED
//! ```
//!
//! The PREPARED record is the commit point. Once it is durable the only way
//! forward is commit, whether driven by `execute` or by recovery after a
//! crash.

pub mod fault;
pub mod file_store;
pub mod log;
pub mod log_store;
pub mod manager;
pub mod participant;
pub mod recovery;
pub mod types;
pub mod wal;

#[cfg(test)]
pub(crate) mod testing;

pub use fault::{ChaosMode, ControlPoint, FaultAction, FaultHook, HaltOn, NoFaults};
pub use file_store::FileLogStore;
pub use log_store::{LogStore, MemoryLogStore, DEFAULT_RETENTION};
pub use manager::{CoordinatorConfig, Decision, ExecuteOutcome, Phase2Report, TransactionManager};
pub use participant::Participant;
pub use recovery::{spawn_recovery_worker, RecoveryReport};
pub use types::{TransactionRecord, TxnId, TxnState};
pub use wal::WalConfig;
