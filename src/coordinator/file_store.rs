//! Durable, file-backed log store
//!
//! ## Layout
//! - `coordinator.wal`: append-only frames (see [`super::log`]), one per state
//!   transition
//! - `coordinator.checkpoint`: JSON marker written after each compaction, for
//!   operators; never read back for correctness
//!
//! ## Recovery on open
//! 1. Read the WAL front to back, verifying every frame
//! 2. Cut off a torn tail, if any
//! 3. Rebuild the in-memory index (latest record per transaction + active set)
//!
//! The active set is derived from the same record that carries the state, so
//! a crash can never leave the two disagreeing.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, TwoPcError};
use super::log::{decode_frames, Lsn, WalRecord};
use super::log_store::{LogIndex, LogStore};
use super::types::{now_millis, TransactionRecord, TxnId, TxnState};
use super::wal::{WalConfig, WalWriterHandle};

const WAL_FILE: &str = "coordinator.wal";
const CHECKPOINT_FILE: &str = "coordinator.checkpoint";

/// Mutable state guarded by one async lock, so that validate, append and
/// index update happen as a single step per transition
struct StoreState {
    index: LogIndex,
    next_lsn: Lsn,
    bytes_since_compaction: u64,
}

/// File-backed write-ahead log implementing [`LogStore`]
pub struct FileLogStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data_dir: PathBuf,
    writer: WalWriterHandle,
    state: Mutex<StoreState>,
    config: WalConfig,
}

impl FileLogStore {
    /// Open (or create) the log in `data_dir` with default settings
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(data_dir, WalConfig::default())
    }

    /// Open (or create) the log, replaying whatever is already on disk
    pub fn open_with_config(data_dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let wal_path = data_dir.join(WAL_FILE);

        let (index, next_lsn, synced_len) = Self::replay(&wal_path)?;
        let writer = WalWriterHandle::new(wal_path, synced_len, &config)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                writer,
                state: Mutex::new(StoreState {
                    index,
                    next_lsn,
                    bytes_since_compaction: synced_len,
                }),
                config,
            }),
        })
    }

    /// Rebuild the index from the WAL; returns (index, next LSN, valid length)
    fn replay(wal_path: &Path) -> Result<(LogIndex, Lsn, u64)> {
        if !wal_path.exists() {
            return Ok((LogIndex::default(), 1, 0));
        }

        log::info!("Replaying coordinator WAL {}", wal_path.display());
        let buf = fs::read(wal_path)?;
        let replay = decode_frames(&buf);

        if let Some(reason) = &replay.torn {
            log::warn!(
                "WAL has a torn tail ({}); discarding {} trailing bytes",
                reason,
                buf.len() - replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(wal_path)?;
            file.set_len(replay.valid_len as u64)?;
            file.sync_all()?;
        }

        let mut index = LogIndex::default();
        let mut max_lsn: Lsn = 0;
        for record in &replay.records {
            max_lsn = max_lsn.max(record.lsn);
            index.apply(record.to_record());
        }

        log::info!(
            "WAL replay complete: {} records, {} transactions, {} pending. Next LSN: {}",
            replay.records.len(),
            index.len(),
            index.active_ids().len(),
            max_lsn + 1
        );

        Ok((index, max_lsn + 1, replay.valid_len as u64))
    }

    pub fn wal_path(&self) -> PathBuf {
        self.inner.data_dir.join(WAL_FILE)
    }

    /// Highest LSN known to be fsynced
    pub fn durable_lsn(&self) -> Lsn {
        self.inner.writer.durable_lsn()
    }

    /// Rewrite the WAL keeping only active transactions and terminal ones
    /// still inside the retention window.
    pub async fn compact(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        self.inner.compact_locked(&mut state).await
    }
}

impl StoreInner {
    fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    fn retention_ms(&self) -> u64 {
        self.config.retention.as_millis() as u64
    }

    /// Validate, append and apply one transition under the state lock
    async fn append_transition(&self, txn_id: &TxnId, to: TxnState) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        state.index.check_transition(txn_id, to, now, self.retention_ms())?;

        let record = WalRecord {
            lsn: state.next_lsn,
            txn_id: txn_id.clone(),
            state: to,
            timestamp: now,
        };

        // Durable before it becomes visible
        let bytes = self.writer.append(std::slice::from_ref(&record)).await?;
        state.next_lsn += 1;
        state.bytes_since_compaction += bytes as u64;
        state.index.apply(record.to_record());

        log::debug!("WAL: {} -> {} (LSN {})", txn_id, to, record.lsn);

        if state.bytes_since_compaction >= self.config.compaction_threshold_bytes {
            // The transition itself is already durable; a failed compaction
            // only means the log stays longer
            if let Err(e) = self.compact_locked(&mut state).await {
                log::warn!("Automatic WAL compaction failed: {}", e);
            }
        }
        Ok(())
    }

    async fn compact_locked(&self, state: &mut StoreState) -> Result<usize> {
        let now = now_millis();
        let removed = state.index.purge_expired(now, self.retention_ms());
        let live = state.index.live_records(now, self.retention_ms());

        let mut records = Vec::with_capacity(live.len());
        for record in live {
            records.push(WalRecord {
                lsn: state.next_lsn,
                txn_id: record.id,
                state: record.state,
                timestamp: record.updated_at,
            });
            state.next_lsn += 1;
        }
        let last_lsn = state.next_lsn - 1;
        let kept = records.len();

        let new_len = self.writer.rewrite(records).await?;
        state.bytes_since_compaction = 0;

        // Write checkpoint marker
        let checkpoint_data = serde_json::json!({
            "lsn": last_lsn,
            "records": kept,
            "expired": removed,
            "active_txns": state.index.active_ids(),
            "wal_bytes": new_len,
            "timestamp": now,
        });
        let temp_path = self.checkpoint_path().with_extension("checkpoint.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(&checkpoint_data)?)?;
        fs::rename(temp_path, self.checkpoint_path())?;

        log::info!(
            "WAL compacted at LSN {}: kept {} records, dropped {} expired ({} bytes)",
            last_lsn,
            kept,
            removed,
            new_len
        );
        Ok(removed)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn update_state(&self, txn_id: &TxnId, to: TxnState) -> Result<()> {
        // Runs detached: once a frame is handed to the writer, the index and
        // LSN must follow it even if this caller is dropped
        let inner = Arc::clone(&self.inner);
        let txn_id = txn_id.clone();
        tokio::spawn(async move { inner.append_transition(&txn_id, to).await })
            .await
            .map_err(|e| TwoPcError::Internal(format!("WAL append task failed: {}", e)))?
    }

    async fn check_started(&self, txn_id: &TxnId) -> Result<bool> {
        let state = self.inner.state.lock().await;
        Ok(state
            .index
            .get(txn_id, now_millis(), self.inner.retention_ms())
            .map(|r| r.state.is_terminal())
            .unwrap_or(false))
    }

    async fn get_pending(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.inner.state.lock().await.index.pending())
    }

    async fn get_state(&self, txn_id: &TxnId) -> Result<Option<TransactionRecord>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .index
            .get(txn_id, now_millis(), self.inner.retention_ms())
            .cloned())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        if state.index.count_expired(now_millis(), self.inner.retention_ms()) == 0 {
            return Ok(0);
        }
        self.inner.compact_locked(&mut state).await
    }
}
