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

// Recovery module
// Three-phase crash recovery over the WAL and the page store.
//
// 1. Analysis: scan forward from the last checkpoint, splitting transactions
//    into winners (durable Commit) and losers (no Commit or Rollback).
// 2. Redo: replay every data record's after-image into the page store when
//    the page's stored LSN is older, regardless of winner or loser.
// 3. Undo: walk each loser's records backward applying before-images,
//    emitting compensation records so undo survives its own crash.
//
// Repeating recovery is a no-op: redo is gated on page LSNs and undo sees
// the Rollback records written by the previous pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::storage_engine::file_format::{Page, PageId, PageType};
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::page_manager::PageManager;
use crate::storage_engine::wal::{WalOp, WalRecord, WriteAheadLog};

/// Summary of one recovery pass
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Records scanned during analysis
    pub scanned: usize,
    /// Transactions with a durable commit
    pub winners: Vec<String>,
    /// Transactions rolled back by undo
    pub losers: Vec<String>,
    /// Page images reapplied during redo
    pub redo_applied: usize,
    /// Before-images restored during undo
    pub undo_applied: usize,
    /// Compensation records written
    pub clrs_written: usize,
}

/// RecoveryManager runs on database open when the WAL is non-empty.
pub struct RecoveryManager {
    wal: Arc<WriteAheadLog>,
    pages: Arc<PageManager>,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WriteAheadLog>, pages: Arc<PageManager>) -> Self {
        Self { wal, pages }
    }

    /// Run the full three-phase recovery
    pub fn recover(&self) -> StorageResult<RecoveryReport> {
        let records = self.wal.read_all()?;
        if records.is_empty() {
            return Ok(RecoveryReport::default());
        }

        let analysis_start = Self::last_checkpoint_lsn(&records);
        let (winners, losers) = Self::analyze(&records, analysis_start);

        let mut report = RecoveryReport {
            scanned: records.len(),
            winners: winners.iter().cloned().collect(),
            losers: losers.iter().cloned().collect(),
            ..RecoveryReport::default()
        };
        report.winners.sort();
        report.losers.sort();

        self.redo(&records, &mut report)?;
        self.undo(&records, &losers, &mut report)?;

        tracing::info!(
            scanned = report.scanned,
            winners = report.winners.len(),
            losers = report.losers.len(),
            redone = report.redo_applied,
            undone = report.undo_applied,
            clrs = report.clrs_written,
            "recovery complete"
        );

        Ok(report)
    }

    /// LSN of the most recent checkpoint record, 0 when there is none
    fn last_checkpoint_lsn(records: &[WalRecord]) -> u64 {
        records.iter().rev().find(|r| r.op == WalOp::Checkpoint).map(|r| r.lsn).unwrap_or(0)
    }

    /// Split transactions seen since the checkpoint into winners and losers.
    /// Transactions named active by the checkpoint record itself are part of
    /// the scan even when they wrote nothing afterwards.
    fn analyze(records: &[WalRecord], from_lsn: u64) -> (HashSet<String>, HashSet<String>) {
        let mut winners = HashSet::new();
        let mut finished = HashSet::new();
        let mut seen = HashSet::new();

        if let Some(checkpoint) = records.iter().find(|r| r.lsn == from_lsn && r.op == WalOp::Checkpoint) {
            if let Ok(payload) = crate::storage_engine::checkpoint::CheckpointPayload::decode(&checkpoint.after) {
                for (tx, _) in payload.active_transactions {
                    seen.insert(tx);
                }
            }
        }

        for record in records.iter().filter(|r| r.lsn >= from_lsn) {
            if record.tx_id.is_empty() {
                continue;
            }
            seen.insert(record.tx_id.clone());
            match record.op {
                WalOp::Commit => {
                    winners.insert(record.tx_id.clone());
                    finished.insert(record.tx_id.clone());
                }
                WalOp::Rollback => {
                    finished.insert(record.tx_id.clone());
                }
                _ => {}
            }
        }

        let losers = seen.into_iter().filter(|tx| !finished.contains(tx)).collect();
        (winners, losers)
    }

    /// Replay after-images into the page store, oldest first. A record is
    /// skipped when the page already carries an equal or newer LSN.
    fn redo(&self, records: &[WalRecord], report: &mut RecoveryReport) -> StorageResult<()> {
        for record in records {
            if record.page_id == 0 {
                continue;
            }

            match record.op {
                WalOp::Insert | WalOp::Update | WalOp::Compensation => {
                    if record.after.is_empty() {
                        // A compensation for an undone insert: the page goes back to free
                        self.free_quietly(PageId(record.page_id));
                        report.redo_applied += 1;
                        continue;
                    }
                    if self.apply_image(PageId(record.page_id), record.lsn, &record.after)? {
                        report.redo_applied += 1;
                    }
                }
                WalOp::Delete => {
                    if self.stored_lsn(PageId(record.page_id)) < record.lsn {
                        self.free_quietly(PageId(record.page_id));
                        report.redo_applied += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Roll the losers back, newest record first, writing a compensation
    /// record before each page restore and a final Rollback per loser.
    fn undo(&self, records: &[WalRecord], losers: &HashSet<String>, report: &mut RecoveryReport) -> StorageResult<()> {
        if losers.is_empty() {
            return Ok(());
        }

        // Compensation records already in the log mean a previous undo pass
        // got that far; skip the records they compensated.
        let mut compensated: HashMap<String, usize> = HashMap::new();
        for record in records {
            if record.op == WalOp::Compensation {
                *compensated.entry(record.tx_id.clone()).or_insert(0) += 1;
            }
        }

        for record in records.iter().rev() {
            if !losers.contains(&record.tx_id) {
                continue;
            }

            match record.op {
                WalOp::Insert | WalOp::Update | WalOp::Delete => {
                    if let Some(remaining) = compensated.get_mut(&record.tx_id) {
                        if *remaining > 0 {
                            *remaining -= 1;
                            continue;
                        }
                    }

                    let clr = WalRecord::compensation(record);
                    let clr_lsn = self.wal.write(&clr)?;
                    report.clrs_written += 1;

                    let page_id = PageId(record.page_id);
                    if record.before.is_empty() {
                        // Undoing an insert removes the page
                        self.free_quietly(page_id);
                    } else {
                        self.apply_image(page_id, clr_lsn, &record.before)?;
                    }
                    report.undo_applied += 1;
                }
                _ => {}
            }
        }

        for loser in losers {
            self.wal.write(&WalRecord::rollback(loser))?;
        }
        self.wal.sync()?;

        Ok(())
    }

    /// LSN currently stored on a page; 0 for missing or torn pages
    fn stored_lsn(&self, page_id: PageId) -> u64 {
        match self.pages.get(page_id) {
            Ok(page) => page.header.lsn,
            Err(_) => 0,
        }
    }

    /// Write `image` into the page when its stored LSN is older than `lsn`
    fn apply_image(&self, page_id: PageId, lsn: u64, image: &[u8]) -> StorageResult<bool> {
        if self.stored_lsn(page_id) >= lsn {
            return Ok(false);
        }

        self.pages.ensure_allocated(page_id)?;
        let mut page = Page::new(page_id, PageType::Data);
        page.set_data(image)?;
        page.header.lsn = lsn;
        self.pages.write(&page)?;
        Ok(true)
    }

    fn free_quietly(&self, page_id: PageId) {
        match self.pages.free(page_id) {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(page = page_id.0, error = %e, "failed to free page during recovery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::storage::StorageEngine;
    use tempfile::tempdir;

    fn setup(dir: &tempfile::TempDir) -> (Arc<WriteAheadLog>, Arc<PageManager>, RecoveryManager) {
        let wal_engine = Arc::new(StorageEngine::open(dir.path().join("test.wal"), false).unwrap());
        let wal = Arc::new(WriteAheadLog::open(wal_engine).unwrap());
        let data_engine = Arc::new(StorageEngine::open(dir.path().join("test.db"), false).unwrap());
        let pages = Arc::new(PageManager::open(data_engine, 64).unwrap());
        let recovery = RecoveryManager::new(wal.clone(), pages.clone());
        (wal, pages, recovery)
    }

    #[test]
    fn test_empty_log_is_noop() {
        let dir = tempdir().unwrap();
        let (_wal, _pages, recovery) = setup(&dir);
        let report = recovery.recover().unwrap();
        assert_eq!(report.scanned, 0);
        assert!(report.winners.is_empty());
    }

    #[test]
    fn test_committed_transaction_is_redone() {
        let dir = tempdir().unwrap();
        let (wal, pages, recovery) = setup(&dir);

        // A committed insert whose page write never reached the data file
        wal.write(&WalRecord::begin("TXN_w")).unwrap();
        wal.write(&WalRecord::insert("TXN_w", 1, b"committed doc".to_vec())).unwrap();
        wal.write(&WalRecord::commit("TXN_w")).unwrap();
        wal.sync().unwrap();

        let report = recovery.recover().unwrap();
        assert_eq!(report.winners, vec!["TXN_w".to_string()]);
        assert_eq!(report.redo_applied, 1);

        let page = pages.get(PageId(1)).unwrap();
        assert_eq!(page.data(), b"committed doc");
    }

    #[test]
    fn test_loser_is_undone_with_clr() {
        let dir = tempdir().unwrap();
        let (wal, pages, recovery) = setup(&dir);

        // Seed a committed value
        wal.write(&WalRecord::begin("TXN_a")).unwrap();
        wal.write(&WalRecord::insert("TXN_a", 1, b"v1".to_vec())).unwrap();
        wal.write(&WalRecord::commit("TXN_a")).unwrap();

        // A loser overwrote it but never committed
        wal.write(&WalRecord::begin("TXN_b")).unwrap();
        wal.write(&WalRecord::update("TXN_b", 1, b"v1".to_vec(), b"v2".to_vec())).unwrap();
        wal.sync().unwrap();

        let report = recovery.recover().unwrap();
        assert_eq!(report.losers, vec!["TXN_b".to_string()]);
        assert_eq!(report.clrs_written, 1);

        let page = pages.get(PageId(1)).unwrap();
        assert_eq!(page.data(), b"v1");

        // The log now carries the compensation and the rollback
        let records = wal.read_all().unwrap();
        assert!(records.iter().any(|r| r.op == WalOp::Compensation && r.tx_id == "TXN_b"));
        assert!(records.iter().any(|r| r.op == WalOp::Rollback && r.tx_id == "TXN_b"));
    }

    #[test]
    fn test_uncommitted_insert_is_removed() {
        let dir = tempdir().unwrap();
        let (wal, pages, recovery) = setup(&dir);

        wal.write(&WalRecord::begin("TXN_x")).unwrap();
        wal.write(&WalRecord::insert("TXN_x", 1, b"phantom".to_vec())).unwrap();
        wal.sync().unwrap();

        recovery.recover().unwrap();

        // The page, if it exists at all, is free
        if pages.exists(PageId(1)) {
            let page = pages.get(PageId(1)).unwrap();
            assert_eq!(page.header.page_type, PageType::Free);
        }
    }

    #[test]
    fn test_recovery_is_reentrant() {
        let dir = tempdir().unwrap();
        let (wal, pages, recovery) = setup(&dir);

        wal.write(&WalRecord::begin("TXN_w")).unwrap();
        wal.write(&WalRecord::insert("TXN_w", 1, b"stable".to_vec())).unwrap();
        wal.write(&WalRecord::commit("TXN_w")).unwrap();
        wal.write(&WalRecord::begin("TXN_l")).unwrap();
        wal.write(&WalRecord::update("TXN_l", 1, b"stable".to_vec(), b"dirty".to_vec())).unwrap();
        wal.sync().unwrap();

        let first = recovery.recover().unwrap();
        assert_eq!(first.losers.len(), 1);
        let after_first = pages.get(PageId(1)).unwrap();

        let second = recovery.recover().unwrap();
        let after_second = pages.get(PageId(1)).unwrap();

        // The second pass finds no losers and changes nothing
        assert!(second.losers.is_empty());
        assert_eq!(second.clrs_written, 0);
        assert_eq!(after_first.data(), after_second.data());
        assert_eq!(after_first.data(), b"stable");
    }

    #[test]
    fn test_analysis_starts_at_last_checkpoint() {
        let dir = tempdir().unwrap();
        let (wal, _pages, recovery) = setup(&dir);

        // An old, completed transaction before the checkpoint
        wal.write(&WalRecord::begin("TXN_old")).unwrap();
        wal.write(&WalRecord::commit("TXN_old")).unwrap();
        wal.write(&WalRecord::checkpoint(Vec::new())).unwrap();
        // A new winner after the checkpoint
        wal.write(&WalRecord::begin("TXN_new")).unwrap();
        wal.write(&WalRecord::commit("TXN_new")).unwrap();
        wal.sync().unwrap();

        let report = recovery.recover().unwrap();
        assert_eq!(report.winners, vec!["TXN_new".to_string()]);
    }
}
