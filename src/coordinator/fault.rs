//! Fault injection at named control points
//!
//! The transaction manager consults a [`FaultHook`] at fixed points of the
//! protocol. Production managers carry [`NoFaults`]; tests and the binary's
//! chaos mode install hooks that stop the flow or kill the process so that
//! recovery can be exercised.

use std::fmt;

use super::types::TxnId;

/// A named point in the commit protocol where faults can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlPoint {
    /// Immediately after the PREPARED record is durable, before any commit
    AfterCommitPoint,
}

impl fmt::Display for ControlPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPoint::AfterCommitPoint => write!(f, "after-commit-point"),
        }
    }
}

/// What the manager should do at a control point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Continue,
    /// Return `TwoPcError::Halted` without running the rest of the protocol,
    /// leaving the log exactly as a crash would
    Halt,
}

pub trait FaultHook: Send + Sync {
    fn at(&self, point: ControlPoint, txn_id: &TxnId) -> FaultAction;
}

/// The production hook: never interferes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultHook for NoFaults {
    fn at(&self, _point: ControlPoint, _txn_id: &TxnId) -> FaultAction {
        FaultAction::Continue
    }
}

/// Chaos selection for the coordinator entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChaosMode {
    #[default]
    None,
    /// Terminate the process right after the commit point
    CrashAfterPrepare,
    /// Stop `execute` right after the commit point, keeping the process alive
    HaltAfterPrepare,
}

impl ChaosMode {
    /// Parse a chaos mode from its command-line name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "none" => Some(ChaosMode::None),
            "crash-after-prepare" => Some(ChaosMode::CrashAfterPrepare),
            "halt-after-prepare" => Some(ChaosMode::HaltAfterPrepare),
            _ => None,
        }
    }
}

impl FaultHook for ChaosMode {
    fn at(&self, point: ControlPoint, txn_id: &TxnId) -> FaultAction {
        match (self, point) {
            (ChaosMode::None, _) => FaultAction::Continue,
            (ChaosMode::HaltAfterPrepare, ControlPoint::AfterCommitPoint) => {
                log::warn!("Chaos: halting transaction {} at {}", txn_id, point);
                FaultAction::Halt
            }
            (ChaosMode::CrashAfterPrepare, ControlPoint::AfterCommitPoint) => {
                log::error!("Chaos: crashing process at {} for transaction {}", point, txn_id);
                std::process::exit(1);
            }
        }
    }
}

/// Halts only the listed transactions; everything else continues
#[derive(Debug, Clone, Default)]
pub struct HaltOn {
    point: Option<ControlPoint>,
    txn_ids: Vec<TxnId>,
}

impl HaltOn {
    pub fn new(point: ControlPoint, txn_ids: impl IntoIterator<Item = TxnId>) -> Self {
        Self {
            point: Some(point),
            txn_ids: txn_ids.into_iter().collect(),
        }
    }
}

impl FaultHook for HaltOn {
    fn at(&self, point: ControlPoint, txn_id: &TxnId) -> FaultAction {
        if self.point == Some(point) && self.txn_ids.contains(txn_id) {
            FaultAction::Halt
        } else {
            FaultAction::Continue
        }
    }
}
