// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Write-ahead logging module
// A single append-only file of checksummed, LSN-stamped records. Commit
// records are fsynced before the commit is acknowledged; everything else may
// stay buffered. Checkpointing truncates the obsolete prefix instead of
// rotating segments.

use std::convert::TryInto;
use std::sync::{Arc, Mutex};

use crate::storage_engine::lib::{StorageError, StorageResult, calculate_checksum, current_millis};
use crate::storage_engine::storage::StorageEngine;

/// Upper bound on a single record's size; anything larger in the framing is
/// treated as corruption.
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Operations recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Begin = 0,
    Prepare = 1,
    Commit = 2,
    Rollback = 3,
    Insert = 4,
    Update = 5,
    Delete = 6,
    Checkpoint = 7,
    /// Read audit record written at higher isolation levels
    Read = 8,
    /// Compensation record written during undo
    Compensation = 9,
}

impl TryFrom<u8> for WalOp {
    type Error = StorageError;

    fn try_from(value: u8) -> StorageResult<Self> {
        match value {
            0 => Ok(WalOp::Begin),
            1 => Ok(WalOp::Prepare),
            2 => Ok(WalOp::Commit),
            3 => Ok(WalOp::Rollback),
            4 => Ok(WalOp::Insert),
            5 => Ok(WalOp::Update),
            6 => Ok(WalOp::Delete),
            7 => Ok(WalOp::Checkpoint),
            8 => Ok(WalOp::Read),
            9 => Ok(WalOp::Compensation),
            other => Err(StorageError::CorruptRecord(format!("invalid WAL op {other}"))),
        }
    }
}

/// A single log record. `before` and `after` carry serialized images whose
/// meaning depends on the operation; `key` rides inside the images for the
/// logical document operations.
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// Log sequence number, assigned by the log on append
    pub lsn: u64,
    /// Owning transaction id
    pub tx_id: String,
    pub op: WalOp,
    /// Affected page, 0 when not applicable
    pub page_id: u64,
    /// Image before the change (undo)
    pub before: Vec<u8>,
    /// Image after the change (redo)
    pub after: Vec<u8>,
    /// UTC milliseconds at append time
    pub timestamp: i64,
}

impl WalRecord {
    fn bare(tx_id: &str, op: WalOp) -> Self {
        Self {
            lsn: 0,
            tx_id: tx_id.to_string(),
            op,
            page_id: 0,
            before: Vec::new(),
            after: Vec::new(),
            timestamp: current_millis() as i64,
        }
    }

    pub fn begin(tx_id: &str) -> Self {
        Self::bare(tx_id, WalOp::Begin)
    }

    pub fn prepare(tx_id: &str) -> Self {
        Self::bare(tx_id, WalOp::Prepare)
    }

    pub fn commit(tx_id: &str) -> Self {
        Self::bare(tx_id, WalOp::Commit)
    }

    pub fn rollback(tx_id: &str) -> Self {
        Self::bare(tx_id, WalOp::Rollback)
    }

    pub fn insert(tx_id: &str, page_id: u64, after: Vec<u8>) -> Self {
        Self {
            page_id,
            after,
            ..Self::bare(tx_id, WalOp::Insert)
        }
    }

    pub fn update(tx_id: &str, page_id: u64, before: Vec<u8>, after: Vec<u8>) -> Self {
        Self {
            page_id,
            before,
            after,
            ..Self::bare(tx_id, WalOp::Update)
        }
    }

    pub fn delete(tx_id: &str, page_id: u64, before: Vec<u8>) -> Self {
        Self {
            page_id,
            before,
            ..Self::bare(tx_id, WalOp::Delete)
        }
    }

    pub fn read(tx_id: &str, key: &str) -> Self {
        Self {
            after: key.as_bytes().to_vec(),
            ..Self::bare(tx_id, WalOp::Read)
        }
    }

    pub fn checkpoint(payload: Vec<u8>) -> Self {
        Self {
            after: payload,
            ..Self::bare("", WalOp::Checkpoint)
        }
    }

    /// Compensation record making the undo of `undone` itself crash-safe:
    /// its redo image is the restored before-image.
    pub fn compensation(undone: &WalRecord) -> Self {
        Self {
            page_id: undone.page_id,
            after: undone.before.clone(),
            ..Self::bare(&undone.tx_id, WalOp::Compensation)
        }
    }

    /// Serialize the record body (everything the checksum covers)
    fn serialize(&self) -> Vec<u8> {
        let tx_bytes = self.tx_id.as_bytes();
        let mut out = Vec::with_capacity(37 + tx_bytes.len() + self.before.len() + self.after.len());

        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&(tx_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(tx_bytes);
        out.push(self.op as u8);
        out.extend_from_slice(&self.page_id.to_le_bytes());
        out.extend_from_slice(&(self.before.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.before);
        out.extend_from_slice(&(self.after.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.after);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Deserialize a record body
    fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        fn take<'a>(buffer: &'a [u8], offset: &mut usize, n: usize) -> StorageResult<&'a [u8]> {
            let slice = buffer.get(*offset..*offset + n).ok_or_else(|| StorageError::CorruptRecord("truncated WAL record".to_string()))?;
            *offset += n;
            Ok(slice)
        }
        let corrupt = || StorageError::CorruptRecord("truncated WAL record".to_string());

        let mut offset = 0usize;
        let lsn = u64::from_le_bytes(take(buffer, &mut offset, 8)?.try_into().map_err(|_| corrupt())?);
        let tx_len = u32::from_le_bytes(take(buffer, &mut offset, 4)?.try_into().map_err(|_| corrupt())?) as usize;
        let tx_id = String::from_utf8(take(buffer, &mut offset, tx_len)?.to_vec()).map_err(|e| StorageError::CorruptRecord(format!("invalid tx id: {e}")))?;
        let op = WalOp::try_from(take(buffer, &mut offset, 1)?[0])?;
        let page_id = u64::from_le_bytes(take(buffer, &mut offset, 8)?.try_into().map_err(|_| corrupt())?);
        let before_len = u32::from_le_bytes(take(buffer, &mut offset, 4)?.try_into().map_err(|_| corrupt())?) as usize;
        let before = take(buffer, &mut offset, before_len)?.to_vec();
        let after_len = u32::from_le_bytes(take(buffer, &mut offset, 4)?.try_into().map_err(|_| corrupt())?) as usize;
        let after = take(buffer, &mut offset, after_len)?.to_vec();
        let timestamp = i64::from_le_bytes(take(buffer, &mut offset, 8)?.try_into().map_err(|_| corrupt())?);

        Ok(Self {
            lsn,
            tx_id,
            op,
            page_id,
            before,
            after,
            timestamp,
        })
    }
}

/// Statistics about the log
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub records_written: u64,
    pub last_lsn: u64,
    pub bytes_written: u64,
}

struct WalInner {
    next_lsn: u64,
    first_lsn: u64,
    records_written: u64,
    bytes_written: u64,
}

/// WriteAheadLog assigns LSNs and frames records onto its storage engine as
/// `{ length, record-bytes, checksum }`.
pub struct WriteAheadLog {
    engine: Arc<StorageEngine>,
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// Open the log, scanning existing records to restore the LSN counter.
    /// A torn tail (truncated or checksum-invalid) is cut off so later
    /// appends land on a clean boundary.
    pub fn open(engine: Arc<StorageEngine>) -> StorageResult<Self> {
        let (records, valid_end) = Self::scan(&engine)?;
        if valid_end < engine.size() {
            tracing::warn!(valid_end, size = engine.size(), "discarding torn WAL tail");
            engine.truncate(valid_end)?;
        }

        let first_lsn = records.first().map(|r| r.lsn).unwrap_or(0);
        let last_lsn = records.last().map(|r| r.lsn).unwrap_or(0);

        Ok(Self {
            engine,
            inner: Mutex::new(WalInner {
                next_lsn: last_lsn + 1,
                first_lsn,
                records_written: 0,
                bytes_written: 0,
            }),
        })
    }

    /// Appends a record, assigning it the next LSN.
    ///
    /// Steps:
    /// 1. Take the log mutex so LSN order equals file order.
    /// 2. Stamp the record with the next LSN and serialize it.
    /// 3. Frame it as length + body + CRC32 and append to the engine.
    /// 4. Return the assigned LSN.
    pub fn write(&self, record: &WalRecord) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();

        let mut record = record.clone();
        record.lsn = inner.next_lsn;

        let body = record.serialize();
        let checksum = calculate_checksum(&body);

        let mut framed = Vec::with_capacity(8 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        framed.extend_from_slice(&checksum.to_le_bytes());

        self.engine.append(&framed)?;

        if inner.first_lsn == 0 {
            inner.first_lsn = record.lsn;
        }
        inner.next_lsn += 1;
        inner.records_written += 1;
        inner.bytes_written += framed.len() as u64;

        Ok(record.lsn)
    }

    /// Force the log to stable storage. Called on commit before the commit
    /// is acknowledged.
    pub fn sync(&self) -> StorageResult<()> {
        if self.engine.sync() {
            Ok(())
        } else {
            Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "WAL fsync failed")))
        }
    }

    /// All records with `lsn >= from`, in log order. Scanning stops silently
    /// at the first invalid or truncated record.
    pub fn read_from(&self, from: u64) -> StorageResult<Vec<WalRecord>> {
        let (records, _) = Self::scan(&self.engine)?;
        Ok(records.into_iter().filter(|r| r.lsn >= from).collect())
    }

    /// Every valid record currently in the log
    pub fn read_all(&self) -> StorageResult<Vec<WalRecord>> {
        self.read_from(0)
    }

    /// LSN of the most recently appended record, 0 when the log is empty
    pub fn last_lsn(&self) -> u64 {
        self.inner.lock().unwrap().next_lsn - 1
    }

    /// LSN of the oldest record still in the log, 0 when the log is empty
    pub fn first_lsn(&self) -> u64 {
        self.inner.lock().unwrap().first_lsn
    }

    /// Size of the log file in bytes
    pub fn size(&self) -> u64 {
        self.engine.size()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> WalStats {
        let inner = self.inner.lock().unwrap();
        WalStats {
            records_written: inner.records_written,
            last_lsn: inner.next_lsn - 1,
            bytes_written: inner.bytes_written,
        }
    }

    /// Drop every record with `lsn < keep_from` by rewriting the file.
    /// The caller must ensure all pages dirtied before `keep_from` are
    /// flushed first.
    pub fn truncate_prefix(&self, keep_from: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let (records, _) = Self::scan(&self.engine)?;
        let kept: Vec<&WalRecord> = records.iter().filter(|r| r.lsn >= keep_from).collect();

        self.engine.truncate(0)?;
        for record in &kept {
            let body = record.serialize();
            let checksum = calculate_checksum(&body);
            let mut framed = Vec::with_capacity(8 + body.len());
            framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
            framed.extend_from_slice(&body);
            framed.extend_from_slice(&checksum.to_le_bytes());
            self.engine.append(&framed)?;
        }

        if !self.engine.sync() {
            return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "WAL fsync failed during truncation")));
        }

        inner.first_lsn = kept.first().map(|r| r.lsn).unwrap_or(0);
        Ok(())
    }

    /// Scan the whole file, returning the valid records and the offset where
    /// validity ends.
    fn scan(engine: &StorageEngine) -> StorageResult<(Vec<WalRecord>, u64)> {
        let mut records = Vec::new();
        let mut offset = 0u64;
        let size = engine.size();

        while offset + 4 <= size {
            let len_bytes = engine.read(offset, 4)?;
            if len_bytes.len() < 4 {
                break;
            }
            let body_len = u32::from_le_bytes(len_bytes[..4].try_into().expect("4-byte slice"));
            if body_len == 0 || body_len > MAX_RECORD_SIZE {
                break;
            }

            let frame_end = offset + 4 + body_len as u64 + 4;
            if frame_end > size {
                break;
            }

            let body = engine.read(offset + 4, body_len as usize)?;
            let checksum_bytes = engine.read(offset + 4 + body_len as u64, 4)?;
            if body.len() < body_len as usize || checksum_bytes.len() < 4 {
                break;
            }

            let stored = u32::from_le_bytes(checksum_bytes[..4].try_into().expect("4-byte slice"));
            if stored != calculate_checksum(&body) {
                break;
            }

            match WalRecord::deserialize(&body) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }

            offset = frame_end;
        }

        Ok((records, offset))
    }
}
