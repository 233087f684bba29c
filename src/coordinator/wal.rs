//! WAL writer worker and I/O operations
//!
//! All appends to the coordinator's WAL go through one dedicated thread that
//! owns the file handle. Callers hand it encoded frames over a channel and
//! await a reply that is only sent once the frames are fsynced.
//!
//! ## Group commit
//!
//! The worker takes the first queued request, then drains whatever else is
//! already waiting (up to `max_batch_size`) and writes the whole batch with a
//! single fsync. Concurrent transactions therefore share fsyncs, while every
//! individual `append` still returns only after its record is on disk.
//!
//! ## Failure handling
//!
//! If a write or fsync fails, every requester in the batch gets the error and
//! the file is cut back to its last fully-synced length so that later appends
//! never follow a partial frame.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TwoPcError};
use super::log::{encode_frame, Lsn, WalRecord};
use super::log_store::DEFAULT_RETENTION;

/// Configuration for the WAL writer and the file log store.
///
/// # Presets
///
/// - [`WalConfig::default()`] - 24h retention, compaction every 4 MiB
/// - [`WalConfig::compact_eagerly()`] - tiny compaction threshold, for tests
///   and low-volume deployments that want a short log
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum number of records written under one fsync
    pub max_batch_size: usize,
    /// Capacity of the request queue in front of the writer thread
    pub queue_capacity: usize,
    /// Bytes appended since the last compaction before compacting again
    pub compaction_threshold_bytes: u64,
    /// How long terminal records stay queryable
    pub retention: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
            queue_capacity: 1024,
            compaction_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            retention: DEFAULT_RETENTION,
        }
    }
}

impl WalConfig {
    /// Compact after every few kilobytes
    pub fn compact_eagerly() -> Self {
        Self {
            compaction_threshold_bytes: 4096,
            ..Default::default()
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Control messages for the WAL writer thread.
enum WalMessage {
    /// Append encoded frames; reply once durable
    Append {
        frames: Vec<u8>,
        last_lsn: Lsn,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Replace the whole log with the given records (compaction)
    Rewrite {
        records: Vec<WalRecord>,
        responder: oneshot::Sender<Result<u64>>,
    },
}

/// Handle to the WAL writer thread.
///
/// Dropping the handle closes the queue; the thread finishes the requests it
/// already holds and exits.
pub struct WalWriterHandle {
    sender: mpsc::Sender<WalMessage>,
    /// Highest LSN known to be fsynced
    durable_lsn: Arc<AtomicU64>,
}

impl WalWriterHandle {
    /// Spawn the writer thread for the WAL at `wal_path`.
    ///
    /// `synced_len` is the length of the verified prefix found by replay;
    /// the worker appends from there.
    pub fn new(wal_path: PathBuf, synced_len: u64, config: &WalConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        let (tx, rx) = mpsc::channel::<WalMessage>(config.queue_capacity.max(1));
        let durable_lsn = Arc::new(AtomicU64::new(0));

        let max_batch_size = config.max_batch_size.max(1);
        let durable_clone = Arc::clone(&durable_lsn);
        std::thread::Builder::new()
            .name("wal-writer".to_string())
            .spawn(move || {
                wal_writer_thread(file, synced_len, rx, wal_path, max_batch_size, durable_clone);
            })?;

        Ok(Self {
            sender: tx,
            durable_lsn,
        })
    }

    /// Append records and wait until they are durable
    pub async fn append(&self, records: &[WalRecord]) -> Result<usize> {
        let mut frames = Vec::new();
        for record in records {
            frames.extend_from_slice(&encode_frame(record)?);
        }
        let bytes = frames.len();
        let last_lsn = records.iter().map(|r| r.lsn).max().unwrap_or(0);

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WalMessage::Append {
                frames,
                last_lsn,
                responder: tx,
            })
            .await
            .map_err(|_| TwoPcError::Internal("WAL writer channel closed".to_string()))?;

        rx.await
            .map_err(|_| TwoPcError::Internal("WAL writer response lost".to_string()))??;
        Ok(bytes)
    }

    /// Atomically replace the log with `records`; returns the new file size
    pub async fn rewrite(&self, records: Vec<WalRecord>) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WalMessage::Rewrite {
                records,
                responder: tx,
            })
            .await
            .map_err(|_| TwoPcError::Internal("WAL writer channel closed".to_string()))?;

        rx.await
            .map_err(|_| TwoPcError::Internal("WAL rewrite response lost".to_string()))?
    }

    /// Highest LSN that has been fsynced
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }
}

/// WAL writer thread - batches appends and fsyncs once per batch
fn wal_writer_thread(
    mut file: File,
    mut synced_len: u64,
    mut rx: mpsc::Receiver<WalMessage>,
    wal_path: PathBuf,
    max_batch_size: usize,
    durable_lsn: Arc<AtomicU64>,
) {
    log::debug!("WAL writer started for {}", wal_path.display());

    while let Some(first) = rx.blocking_recv() {
        let mut batch = Vec::new();
        let mut rewrites = Vec::new();

        match first {
            WalMessage::Append { frames, last_lsn, responder } => batch.push((frames, last_lsn, responder)),
            WalMessage::Rewrite { records, responder } => rewrites.push((records, responder)),
        }

        // Drain whatever is already queued so it shares this fsync
        while batch.len() < max_batch_size && rewrites.is_empty() {
            match rx.try_recv() {
                Ok(WalMessage::Append { frames, last_lsn, responder }) => {
                    batch.push((frames, last_lsn, responder))
                }
                Ok(WalMessage::Rewrite { records, responder }) => rewrites.push((records, responder)),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let total: usize = batch.iter().map(|(frames, _, _)| frames.len()).sum();
            let write_result = write_batch(&mut file, batch.iter().map(|(frames, _, _)| frames.as_slice()));

            match write_result {
                Ok(()) => {
                    synced_len += total as u64;
                    if let Some(max_lsn) = batch.iter().map(|(_, lsn, _)| *lsn).max() {
                        durable_lsn.fetch_max(max_lsn, Ordering::AcqRel);
                    }
                    if batch.len() > 1 {
                        log::debug!("WAL batch written: {} requests, {} bytes", batch.len(), total);
                    }
                    for (_, _, responder) in batch {
                        let _ = responder.send(Ok(()));
                    }
                }
                Err(e) => {
                    log::error!("WAL write failed: {}", e);
                    if let Err(trunc_err) = file.set_len(synced_len) {
                        log::error!("WAL could not be cut back to {} bytes: {}", synced_len, trunc_err);
                    }
                    let msg = e.to_string();
                    for (_, _, responder) in batch {
                        let _ = responder.send(Err(TwoPcError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            msg.clone(),
                        ))));
                    }
                }
            }
        }

        // Rewrites run after the batch so compaction never loses an append
        for (records, responder) in rewrites {
            match perform_rewrite(&wal_path, &records) {
                Ok((new_file, len)) => {
                    file = new_file;
                    synced_len = len;
                    if let Some(max_lsn) = records.iter().map(|r| r.lsn).max() {
                        durable_lsn.fetch_max(max_lsn, Ordering::AcqRel);
                    }
                    let _ = responder.send(Ok(len));
                }
                Err(e) => {
                    log::error!("WAL rewrite failed: {}", e);
                    let _ = responder.send(Err(e));
                }
            }
        }
    }

    if let Err(e) = file.sync_all() {
        log::warn!("Final WAL fsync failed: {}", e);
    }
    log::debug!("WAL writer shutting down (channel closed)");
}

/// Write a batch of frames and fsync once
fn write_batch<'a>(file: &mut File, frames: impl Iterator<Item = &'a [u8]>) -> std::io::Result<()> {
    for frame in frames {
        file.write_all(frame)?;
    }
    file.flush()?;
    file.sync_data()
}

/// Write `records` to a temp file, fsync it and rename it over the WAL.
/// Returns the reopened append handle and the new length.
fn perform_rewrite(wal_path: &Path, records: &[WalRecord]) -> Result<(File, u64)> {
    let temp_path = wal_path.with_extension("wal.tmp");
    {
        let mut temp = File::create(&temp_path)?;
        for record in records {
            temp.write_all(&encode_frame(record)?)?;
        }
        temp.flush()?;
        temp.sync_all()?;
    }

    // Atomic rename for crash safety
    fs::rename(&temp_path, wal_path)?;
    sync_parent_dir(wal_path);

    let file = OpenOptions::new().append(true).open(wal_path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Best effort: persist the directory entry after a rename
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
