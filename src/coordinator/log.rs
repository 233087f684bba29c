//! WAL record structures and frame encoding
//!
//! Each record is stored as one frame:
//!
//! ```text
//! +-------------------+------------------+------------------------------------+
//! | 4 bytes (LE)      | 4 bytes          | N bytes                            |
//! | Payload Length    | SHA-256 prefix   | bincode(WalRecord)                 |
//! +-------------------+------------------+------------------------------------+
//! ```
//!
//! The checksum lets replay tell a torn tail (crash mid-append) from a clean
//! end of log.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TwoPcError};
use super::types::{TransactionRecord, TxnId, TxnState};

/// Log Sequence Number - unique, increasing identifier for each WAL record
pub type Lsn = u64;

/// Bytes in a frame header (length + checksum)
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound for one payload; anything larger is treated as corruption
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// A WAL record: one state transition of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub state: TxnState,
    /// Unix epoch millis
    pub timestamp: u64,
}

impl WalRecord {
    pub fn to_record(&self) -> TransactionRecord {
        TransactionRecord::new(self.txn_id.clone(), self.state, self.timestamp)
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encode a record as a complete frame
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(TwoPcError::Codec(format!(
            "WAL record for {} is {} bytes, limit is {}",
            record.txn_id,
            payload.len(),
            MAX_RECORD_LEN
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of scanning a WAL image
#[derive(Debug, Default)]
pub struct Replay {
    /// Records in log order
    pub records: Vec<WalRecord>,
    /// Length of the prefix made of whole, verified frames
    pub valid_len: usize,
    /// Why the scan stopped early, if it did
    pub torn: Option<String>,
}

/// Decode every verified frame from the start of `buf`.
///
/// Scanning stops at the first frame that is short, fails its checksum or
/// does not decode; everything after it is considered lost.
pub fn decode_frames(buf: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        if rest.len() < FRAME_HEADER_LEN {
            replay.torn = Some(format!("short frame header at offset {}", offset));
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len > MAX_RECORD_LEN {
            replay.torn = Some(format!("frame length {} at offset {} exceeds limit", len, offset));
            break;
        }
        if rest.len() < FRAME_HEADER_LEN + len {
            replay.torn = Some(format!("truncated frame at offset {}", offset));
            break;
        }
        let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        if checksum(payload) != rest[4..8] {
            replay.torn = Some(format!("checksum mismatch at offset {}", offset));
            break;
        }
        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => replay.records.push(record),
            Err(e) => {
                replay.torn = Some(format!("undecodable record at offset {}: {}", offset, e));
                break;
            }
        }
        offset += FRAME_HEADER_LEN + len;
        replay.valid_len = offset;
    }

    replay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lsn: Lsn, id: &str, state: TxnState) -> WalRecord {
        WalRecord {
            lsn,
            txn_id: TxnId::from(id),
            state,
            timestamp: 1_700_000_000_000 + lsn,
        }
    }

    fn image(records: &[WalRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in records {
            buf.extend_from_slice(&encode_frame(r).unwrap());
        }
        buf
    }

    #[test]
    fn test_decode_clean_log() {
        let records = vec![
            record(1, "tx-1", TxnState::Start),
            record(2, "tx-1", TxnState::Prepared),
            record(3, "tx-1", TxnState::Committed),
        ];
        let buf = image(&records);
        let replay = decode_frames(&buf);
        assert_eq!(replay.records, records);
        assert_eq!(replay.valid_len, buf.len());
        assert!(replay.torn.is_none());
    }

    #[test]
    fn test_empty_log() {
        let replay = decode_frames(&[]);
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
        assert!(replay.torn.is_none());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let records = vec![
            record(1, "tx-1", TxnState::Start),
            record(2, "tx-1", TxnState::Prepared),
        ];
        let mut buf = image(&records);
        let good_len = encode_frame(&records[0]).unwrap().len();
        buf.truncate(buf.len() - 3);

        let replay = decode_frames(&buf);
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.valid_len, good_len);
        assert!(replay.torn.unwrap().contains("truncated"));
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let records = vec![
            record(1, "tx-1", TxnState::Start),
            record(2, "tx-2", TxnState::Start),
        ];
        let mut buf = image(&records);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let replay = decode_frames(&buf);
        assert_eq!(replay.records.len(), 1);
        assert!(replay.torn.unwrap().contains("checksum"));
    }

    #[test]
    fn test_frame_header_layout() {
        let r = record(7, "tx-7", TxnState::Aborted);
        let frame = encode_frame(&r).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), FRAME_HEADER_LEN + len);
    }
}
