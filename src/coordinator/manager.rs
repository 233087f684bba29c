//! Transaction Manager: the coordinator's 2PC state machine
//!
//! ## Flow of `execute`
//!
//! 1. Idempotency gate: a transaction the log already resolved is reported as
//!    such without contacting anyone; one that is recorded but not resolved
//!    is left to recovery
//! 2. Log START before any participant is contacted
//! 3. Phase 1: `prepare` on every participant in parallel under one deadline
//! 4. Any failure: roll everyone back, log ABORTED, report the first failure
//! 5. Log PREPARED (the commit point)
//! 6. Phase 2: `commit` on every participant
//! 7. Log COMMITTED once every participant confirmed; otherwise the record
//!    stays PREPARED and recovery keeps re-driving the commit
//!
//! Every log write must succeed before the next step starts. A failed write
//! ends `execute` with that error and leaves the log at its last good state,
//! which recovery knows how to finish.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::{Result, TwoPcError};
use super::fault::{ChaosMode, ControlPoint, FaultAction, FaultHook, NoFaults};
use super::log_store::LogStore;
use super::participant::Participant;
use super::types::{TxnId, TxnState};

/// Coordinator settings.
///
/// # Presets
///
/// - [`CoordinatorConfig::default()`] - 5s prepare budget, 5s per phase-2
///   call, recovery every 10s
/// - [`CoordinatorConfig::fast()`] - short timings for tests and local demos
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shared deadline for the whole prepare phase
    pub prepare_timeout: Duration,
    /// Bound on each commit/rollback call; a call that runs out counts as failed
    pub phase2_timeout: Duration,
    /// Pause between recovery sweeps
    pub recovery_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            phase2_timeout: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn fast() -> Self {
        Self {
            prepare_timeout: Duration::from_millis(500),
            phase2_timeout: Duration::from_millis(500),
            recovery_interval: Duration::from_millis(100),
        }
    }

    /// Defaults overridden by `TWOPC_PREPARE_TIMEOUT_MS`,
    /// `TWOPC_PHASE2_TIMEOUT_MS` and `TWOPC_RECOVERY_INTERVAL_MS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_millis("TWOPC_PREPARE_TIMEOUT_MS")? {
            config.prepare_timeout = ms;
        }
        if let Some(ms) = env_millis("TWOPC_PHASE2_TIMEOUT_MS")? {
            config.phase2_timeout = ms;
        }
        if let Some(ms) = env_millis("TWOPC_RECOVERY_INTERVAL_MS")? {
            config.recovery_interval = ms;
        }
        Ok(config)
    }
}

fn env_millis(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| TwoPcError::Config(format!("{} must be a number of milliseconds, got {:?}", var, raw)))?;
            if ms == 0 {
                return Err(TwoPcError::Config(format!("{} must be greater than zero", var)));
            }
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

/// The decision phase 2 applies to every participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Rollback => write!(f, "rollback"),
        }
    }
}

/// Outcome of one phase-2 sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Report {
    pub decision: Decision,
    /// Participants whose call failed, in participant order
    pub failed: Vec<String>,
}

impl Phase2Report {
    /// Every participant confirmed the decision
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Successful results of [`TransactionManager::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Every participant committed and COMMITTED is logged
    Committed,
    /// The log already holds a terminal state; nothing was done
    AlreadyResolved,
    /// The commit point is durable but some participants have not confirmed
    /// yet. Recovery will keep delivering the commit.
    CommitPending { failed: Vec<String> },
}

/// Coordinates atomic commitment across a fixed set of participants
pub struct TransactionManager {
    log_store: Arc<dyn LogStore>,
    participants: Vec<Arc<dyn Participant>>,
    config: CoordinatorConfig,
    fault_hook: Arc<dyn FaultHook>,
    /// Ids with an `execute` running in this process; recovery skips them
    executing: Mutex<HashSet<TxnId>>,
}

impl TransactionManager {
    pub fn new(log_store: Arc<dyn LogStore>, participants: Vec<Arc<dyn Participant>>) -> Self {
        Self {
            log_store,
            participants,
            config: CoordinatorConfig::default(),
            fault_hook: Arc::new(NoFaults),
            executing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fault_hook(mut self, hook: Arc<dyn FaultHook>) -> Self {
        self.fault_hook = hook;
        self
    }

    pub fn with_chaos(self, mode: ChaosMode) -> Self {
        self.with_fault_hook(Arc::new(mode))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn log_store(&self) -> &Arc<dyn LogStore> {
        &self.log_store
    }

    pub fn participants(&self) -> &[Arc<dyn Participant>] {
        &self.participants
    }

    /// Whether an `execute` for this id is running in this process
    pub fn is_executing(&self, txn_id: &TxnId) -> bool {
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(txn_id)
    }

    /// Mark `txn_id` as being worked on in this process until the guard drops.
    /// Fails with [`TwoPcError::InFlight`] if someone already holds it.
    pub(crate) fn claim(&self, txn_id: &TxnId) -> Result<ExecutingGuard<'_>> {
        ExecutingGuard::enter(&self.executing, txn_id)
    }

    /// Run the full two-phase commit for `txn_id`.
    ///
    /// Safe to call again with the same id: a resolved transaction returns
    /// [`ExecuteOutcome::AlreadyResolved`], one still in flight returns
    /// [`TwoPcError::InFlight`]. Neither re-runs phase 1.
    pub async fn execute(&self, txn_id: &TxnId) -> Result<ExecuteOutcome> {
        let _guard = self.claim(txn_id)?;

        if self.log_store.check_started(txn_id).await? {
            log::info!("Transaction {} already resolved, skipping", txn_id);
            return Ok(ExecuteOutcome::AlreadyResolved);
        }
        if let Some(record) = self.log_store.get_state(txn_id).await? {
            log::warn!(
                "Transaction {} is already {} in the log; leaving it to recovery",
                txn_id,
                record.state
            );
            return Err(TwoPcError::InFlight(txn_id.clone()));
        }

        self.log_store.update_state(txn_id, TxnState::Start).await?;
        log::debug!("Transaction {} started with {} participants", txn_id, self.participants.len());

        // Phase 1
        if let Err(e) = self.prepare_all(txn_id).await {
            log::warn!("Transaction {} aborting: {}", txn_id, e);
            let report = self.drive_phase2(txn_id, Decision::Rollback).await;
            if !report.is_complete() {
                log::warn!(
                    "Transaction {} rollback not confirmed by: {}",
                    txn_id,
                    report.failed.join(", ")
                );
            }
            self.log_store.update_state(txn_id, TxnState::Aborted).await?;
            log::info!("Transaction {} ABORTED", txn_id);
            return Err(e);
        }

        // Commit point
        self.log_store.update_state(txn_id, TxnState::Prepared).await?;
        let point = ControlPoint::AfterCommitPoint;
        if self.fault_hook.at(point, txn_id) == FaultAction::Halt {
            log::warn!("Transaction {} halted at {}", txn_id, point);
            return Err(TwoPcError::Halted(point));
        }

        // Phase 2
        let report = self.drive_phase2(txn_id, Decision::Commit).await;
        if !report.is_complete() {
            log::warn!(
                "Transaction {} committed but not yet confirmed by: {}; recovery will retry",
                txn_id,
                report.failed.join(", ")
            );
            return Ok(ExecuteOutcome::CommitPending { failed: report.failed });
        }

        self.log_store.update_state(txn_id, TxnState::Committed).await?;
        log::info!("Transaction {} COMMITTED", txn_id);
        Ok(ExecuteOutcome::Committed)
    }

    /// Phase 1: prepare everywhere under one deadline.
    ///
    /// The first failure to arrive is the one reported. Calls still running
    /// keep going until they finish or the deadline passes.
    async fn prepare_all(&self, txn_id: &TxnId) -> Result<()> {
        let timeout = self.config.prepare_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut tasks = JoinSet::new();
        let mut pending: Vec<String> = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            let participant = Arc::clone(participant);
            let txn_id = txn_id.clone();
            pending.push(participant.name().to_string());
            tasks.spawn(async move {
                let result = participant.prepare(&txn_id).await;
                (participant.name().to_string(), result)
            });
        }

        let mut first_failure: Option<TwoPcError> = None;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((name, result)))) => {
                    if let Some(pos) = pending.iter().position(|p| *p == name) {
                        pending.remove(pos);
                    }
                    match result {
                        Ok(()) => log::debug!("Transaction {}: {} prepared", txn_id, name),
                        Err(e) => {
                            log::warn!("Transaction {}: prepare failed on {}: {}", txn_id, name, e);
                            if first_failure.is_none() {
                                first_failure = Some(TwoPcError::PrepareFailed {
                                    participant: name,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                Ok(Some(Err(join_err))) => {
                    log::error!("Transaction {}: prepare task failed: {}", txn_id, join_err);
                    if first_failure.is_none() {
                        first_failure = Some(TwoPcError::Internal(format!(
                            "prepare task failed: {}",
                            join_err
                        )));
                    }
                }
                Err(_) => {
                    tasks.abort_all();
                    if let Some(failure) = first_failure {
                        return Err(failure);
                    }
                    return Err(TwoPcError::PrepareTimeout {
                        after_ms: timeout.as_millis() as u64,
                        pending,
                    });
                }
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Deliver `decision` to every participant concurrently and wait for all.
    /// Each call is bounded by `phase2_timeout`.
    ///
    /// Failures are logged and listed in the report; this never fails as a
    /// whole, so callers decide whether to log the terminal state.
    pub async fn drive_phase2(&self, txn_id: &TxnId, decision: Decision) -> Phase2Report {
        let limit = self.config.phase2_timeout;
        let mut handles = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            let participant = Arc::clone(participant);
            let txn_id = txn_id.clone();
            let name = participant.name().to_string();
            let handle = tokio::spawn(async move {
                let call = async {
                    match decision {
                        Decision::Commit => participant.commit(&txn_id).await,
                        Decision::Rollback => participant.rollback(&txn_id).await,
                    }
                };
                match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(TwoPcError::participant(
                        participant.name(),
                        format!("{} timed out after {} ms", decision, limit.as_millis()),
                    )),
                }
            });
            handles.push((name, handle));
        }

        let mut failed = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => log::debug!("Transaction {}: {} confirmed {}", txn_id, name, decision),
                Ok(Err(e)) => {
                    log::warn!("Transaction {}: {} failed on {}: {}", txn_id, decision, name, e);
                    failed.push(name);
                }
                Err(join_err) => {
                    log::error!("Transaction {}: {} task for {} failed: {}", txn_id, decision, name, join_err);
                    failed.push(name);
                }
            }
        }

        Phase2Report { decision, failed }
    }
}

/// Marks an id as executing in this process for the guard's lifetime
pub(crate) struct ExecutingGuard<'a> {
    executing: &'a Mutex<HashSet<TxnId>>,
    txn_id: TxnId,
}

impl<'a> ExecutingGuard<'a> {
    fn enter(executing: &'a Mutex<HashSet<TxnId>>, txn_id: &TxnId) -> Result<Self> {
        let mut set = executing.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(txn_id.clone()) {
            return Err(TwoPcError::InFlight(txn_id.clone()));
        }
        Ok(Self {
            executing,
            txn_id: txn_id.clone(),
        })
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.txn_id);
    }
}
