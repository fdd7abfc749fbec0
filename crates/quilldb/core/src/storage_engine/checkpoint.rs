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

// Checkpoint module
// Periodically marks a safe point in the WAL and truncates the obsolete
// prefix. A checkpoint record carries the set of active transactions and
// their earliest LSNs; the prefix can only be dropped up to the earliest
// LSN any active transaction might still need for undo.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::page_manager::PageManager;
use crate::storage_engine::wal::{WalRecord, WriteAheadLog};

/// Payload stored inside a Checkpoint WAL record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Active transactions at checkpoint time with their earliest LSNs
    pub active_transactions: Vec<(String, u64)>,
}

impl CheckpointPayload {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StorageError::CorruptRecord(format!("checkpoint payload encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StorageError::CorruptRecord(format!("checkpoint payload decode: {e}")))
    }
}

/// Emitted when a checkpoint completes
#[derive(Debug, Clone)]
pub struct CheckpointEvent {
    pub checkpoint_lsn: u64,
    pub active_transactions: Vec<String>,
}

/// CheckpointManager decides when a checkpoint is due and performs it.
pub struct CheckpointManager {
    wal: Arc<WriteAheadLog>,
    pages: Arc<PageManager>,
    interval: Duration,
    wal_limit: u64,
    last_checkpoint: Mutex<Instant>,
}

impl CheckpointManager {
    pub fn new(wal: Arc<WriteAheadLog>, pages: Arc<PageManager>, interval: Duration, wal_limit: u64) -> Self {
        Self {
            wal,
            pages,
            interval,
            wal_limit,
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    /// Whether the WAL has grown past its limit or the interval has elapsed
    pub fn is_needed(&self) -> bool {
        if self.wal.size() > self.wal_limit {
            return true;
        }
        self.last_checkpoint.lock().unwrap().elapsed() >= self.interval
    }

    /// Creates a checkpoint.
    ///
    /// Steps:
    /// 1. Flush every page dirtied so far.
    /// 2. Append a Checkpoint record carrying the active transaction set.
    /// 3. Fsync the log, then truncate the prefix no active transaction
    ///    still needs.
    /// 4. Return the completion event with the new checkpoint LSN.
    pub fn create_checkpoint(&self, active_transactions: Vec<(String, u64)>) -> StorageResult<CheckpointEvent> {
        self.pages.flush()?;

        let payload = CheckpointPayload {
            active_transactions: active_transactions.clone(),
        };
        let checkpoint_lsn = self.wal.write(&WalRecord::checkpoint(payload.encode()?))?;
        self.wal.sync()?;

        let keep_from = active_transactions.iter().map(|(_, lsn)| *lsn).min().unwrap_or(checkpoint_lsn).min(checkpoint_lsn);
        self.wal.truncate_prefix(keep_from)?;

        *self.last_checkpoint.lock().unwrap() = Instant::now();

        tracing::debug!(checkpoint_lsn, active = active_transactions.len(), "checkpoint complete");

        Ok(CheckpointEvent {
            checkpoint_lsn,
            active_transactions: active_transactions.into_iter().map(|(tx, _)| tx).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::storage::StorageEngine;
    use crate::storage_engine::wal::WalOp;
    use tempfile::tempdir;

    fn setup(dir: &tempfile::TempDir) -> (Arc<WriteAheadLog>, Arc<PageManager>, CheckpointManager) {
        let wal_engine = Arc::new(StorageEngine::open(dir.path().join("test.wal"), false).unwrap());
        let wal = Arc::new(WriteAheadLog::open(wal_engine).unwrap());
        let data_engine = Arc::new(StorageEngine::open(dir.path().join("test.db"), false).unwrap());
        let pages = Arc::new(PageManager::open(data_engine, 16).unwrap());
        let manager = CheckpointManager::new(wal.clone(), pages.clone(), Duration::from_secs(60), 1024 * 1024);
        (wal, pages, manager)
    }

    #[test]
    fn test_checkpoint_truncates_obsolete_prefix() {
        let dir = tempdir().unwrap();
        let (wal, _pages, manager) = setup(&dir);

        for i in 0..4 {
            let tx = format!("TXN_{i}");
            wal.write(&WalRecord::begin(&tx)).unwrap();
            wal.write(&WalRecord::commit(&tx)).unwrap();
        }

        let event = manager.create_checkpoint(Vec::new()).unwrap();
        assert_eq!(event.checkpoint_lsn, 9);

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, WalOp::Checkpoint);
    }

    #[test]
    fn test_checkpoint_keeps_records_of_active_transactions() {
        let dir = tempdir().unwrap();
        let (wal, _pages, manager) = setup(&dir);

        let first = wal.write(&WalRecord::begin("TXN_active")).unwrap();
        wal.write(&WalRecord::begin("TXN_done")).unwrap();
        wal.write(&WalRecord::commit("TXN_done")).unwrap();

        let event = manager.create_checkpoint(vec![("TXN_active".to_string(), first)]).unwrap();
        assert_eq!(event.active_transactions, vec!["TXN_active".to_string()]);

        let records = wal.read_all().unwrap();
        // Everything from the active transaction's first LSN onwards survives
        assert_eq!(records[0].lsn, first);
        assert!(records.iter().any(|r| r.op == WalOp::Checkpoint));
    }

    #[test]
    fn test_checkpoint_payload_roundtrip() {
        let payload = CheckpointPayload {
            active_transactions: vec![("TXN_1".to_string(), 4), ("TXN_2".to_string(), 9)],
        };
        let restored = CheckpointPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(restored.active_transactions.len(), 2);
        assert_eq!(restored.active_transactions[0], ("TXN_1".to_string(), 4));
    }

    #[test]
    fn test_is_needed_on_wal_growth() {
        let dir = tempdir().unwrap();
        let wal_engine = Arc::new(StorageEngine::open(dir.path().join("test.wal"), false).unwrap());
        let wal = Arc::new(WriteAheadLog::open(wal_engine).unwrap());
        let data_engine = Arc::new(StorageEngine::open(dir.path().join("test.db"), false).unwrap());
        let pages = Arc::new(PageManager::open(data_engine, 16).unwrap());
        let manager = CheckpointManager::new(wal.clone(), pages, Duration::from_secs(3600), 64);

        assert!(!manager.is_needed());
        for i in 0..4 {
            wal.write(&WalRecord::begin(&format!("TXN_{i}"))).unwrap();
        }
        assert!(manager.is_needed());
    }

    #[test]
    fn test_idempotent_when_no_writes_between() {
        let dir = tempdir().unwrap();
        let (wal, _pages, manager) = setup(&dir);

        wal.write(&WalRecord::begin("TXN_1")).unwrap();
        wal.write(&WalRecord::commit("TXN_1")).unwrap();

        manager.create_checkpoint(Vec::new()).unwrap();
        let after_first: Vec<u64> = wal.read_all().unwrap().iter().map(|r| r.lsn).collect();

        let event = manager.create_checkpoint(Vec::new()).unwrap();
        let after_second: Vec<u64> = wal.read_all().unwrap().iter().map(|r| r.lsn).collect();

        // The second checkpoint leaves a single checkpoint record, same as the first
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_second.len(), 1);
        assert!(event.checkpoint_lsn > after_first[0]);
    }
}
