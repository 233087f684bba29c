#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use twopc::{LedgerParticipant, Participant, ParticipantServer, Result, ServerConfig, TwoPcError, TxnId};

/// Serve `ledger` on an ephemeral local port until the token is cancelled
pub async fn serve(ledger: Arc<LedgerParticipant>, name: &str, secret: &str) -> (SocketAddr, CancellationToken) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        name: name.to_string(),
        secret: secret.to_string(),
    };
    let server = ParticipantServer::bind(config, ledger).await.unwrap();
    let addr = server.local_addr().unwrap();
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        server.run_until(stop).await.unwrap();
    });
    (addr, token)
}

pub fn ledger(name: &str, account: &str, delta: i64) -> Arc<LedgerParticipant> {
    Arc::new(LedgerParticipant::new(name, account, delta).with_balance(account, 1000))
}

/// Wraps a participant and fails its first `n` commits, as a participant
/// that is briefly unreachable would
pub struct FlakyCommit {
    inner: Arc<dyn Participant>,
    failures_left: AtomicUsize,
    commit_calls: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FlakyCommit {
    pub fn new(inner: Arc<dyn Participant>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            commit_calls: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Participant for FlakyCommit {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn prepare(&self, txn_id: &TxnId) -> Result<()> {
        self.inner.prepare(txn_id).await
    }

    async fn commit(&self, txn_id: &TxnId) -> Result<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TwoPcError::participant(self.inner.name(), "connection refused"));
        }
        self.inner.commit(txn_id).await
    }

    async fn rollback(&self, txn_id: &TxnId) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback(txn_id).await
    }
}
