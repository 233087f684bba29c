//! Resource-manager adapters that implement [`Participant`](crate::coordinator::Participant)

pub mod ledger;

pub use ledger::{LedgerParticipant, DEFAULT_LEASE_TTL};
