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

//! End-to-end engine scenarios: isolation visibility, deadlock victim
//! selection, crash recovery, ordered range scans and two-phase commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quilldb_core::document::entry_key;
use quilldb_core::indices::BTree;
use quilldb_core::serialization::encode_entry;
use quilldb_core::storage_engine::coordinator::{Participant, ParticipantStatus};
use quilldb_core::storage_engine::file_format::{Page, PageId, PageType};
use quilldb_core::storage_engine::page_manager::PageManager;
use quilldb_core::storage_engine::storage::StorageEngine;
use quilldb_core::storage_engine::wal::{WalRecord, WriteAheadLog};
use quilldb_core::{Database, DatabaseOptions, Document, IsolationLevel, StorageError, StorageResult, Value};
use tempfile::tempdir;

fn fields(name: &str, v: i64) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert(name.to_string(), Value::I64(v));
    fields
}

fn value_of(doc: &Document, field: &str) -> i64 {
    doc.get(field).and_then(Value::as_i64).expect("field present")
}

/// Scenario 1: a ReadCommitted reader sees the last committed version while
/// a writer's update is staged, and the new version once it commits.
#[test]
fn read_committed_sees_committed_versions_only() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("quill.db")).unwrap();

    let users = db.collection("users").unwrap();
    users.insert(Document::with_id("1", fields("v", 1))).unwrap();

    let t1 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    t1.write("users/1", fields("v", 10)).unwrap();

    let t2 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    let before = t2.read("users/1").unwrap().expect("committed document visible");
    assert_eq!(value_of(&before, "v"), 1);

    t1.commit().unwrap();

    let after = t2.read("users/1").unwrap().expect("new version visible");
    assert_eq!(value_of(&after, "v"), 10);

    t2.rollback().unwrap();
}

/// Scenario 2: two reads of the same key inside a RepeatableRead
/// transaction return identical results despite a concurrent commit.
#[test]
fn repeatable_read_is_stable_across_concurrent_commit() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("quill.db")).unwrap();

    let users = db.collection("users").unwrap();
    users.insert(Document::with_id("1", fields("v", 1))).unwrap();

    let t1 = db.begin_transaction_with(IsolationLevel::RepeatableRead).unwrap();
    let first = t1.read("users/1").unwrap().expect("document visible");
    assert_eq!(value_of(&first, "v"), 1);

    let t2 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    t2.write("users/1", fields("v", 20)).unwrap();
    t2.commit().unwrap();

    let second = t1.read("users/1").unwrap().expect("document still visible");
    assert_eq!(value_of(&second, "v"), 1);

    t1.rollback().unwrap();

    // A fresh reader sees the committed overwrite
    let t3 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    let latest = t3.read("users/1").unwrap().unwrap();
    assert_eq!(value_of(&latest, "v"), 20);
    t3.rollback().unwrap();
}

/// Scenario 3: two transactions locking `a` and `b` in opposite order
/// deadlock; the younger one is selected as victim within the detection
/// interval and surfaces the deadlock on its next operation, while the
/// older completes and commits.
#[test]
fn deadlock_selects_youngest_victim() {
    let dir = tempdir().unwrap();
    let db = Arc::new(
        DatabaseOptions::new(dir.path().join("quill.db"))
            .deadlock_detection_interval(Duration::from_millis(100))
            .open()
            .unwrap(),
    );

    let t1 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    let t2 = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();

    t1.write("locks/a", fields("n", 1)).unwrap();
    t2.write("locks/b", fields("n", 2)).unwrap();

    // T1 blocks waiting for b in a background thread
    let t1 = Arc::new(t1);
    let t1_clone = t1.clone();
    let t1_done = Arc::new(AtomicBool::new(false));
    let t1_flag = t1_done.clone();
    let blocked = std::thread::spawn(move || {
        let result = t1_clone.write("locks/b", fields("n", 3));
        t1_flag.store(true, Ordering::SeqCst);
        result
    });

    std::thread::sleep(Duration::from_millis(150));
    assert!(!t1_done.load(Ordering::SeqCst), "T1 should be blocked on b");

    // T2 requesting a closes the cycle; being the younger transaction it
    // becomes the victim
    match t2.write("locks/a", fields("n", 4)) {
        Err(StorageError::DeadlockVictim(id)) => assert_eq!(id, t2.id()),
        other => panic!("expected deadlock victim, got {other:?}"),
    }

    // The survivor gets the lock and commits
    blocked.join().unwrap().unwrap();
    t1.commit().unwrap();

    let locks = db.collection("locks").unwrap();
    assert_eq!(value_of(&locks.find_by_id("b").unwrap(), "n"), 3);
}

/// Scenario 4: after a crash, a committed write survives recovery and an
/// uncommitted one is rolled back.
#[test]
fn crash_recovery_keeps_winners_and_drops_losers() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("quill.db");
    let wal_path = dir.path().join("quill.db.wal");

    // Build the crashed disk state with the raw engine components
    {
        let data_engine = Arc::new(StorageEngine::open(&db_path, false).unwrap());
        let pages = PageManager::open(data_engine, 64).unwrap();
        let wal_engine = Arc::new(StorageEngine::open(&wal_path, false).unwrap());
        let wal = WriteAheadLog::open(wal_engine).unwrap();

        let write_entry = |pages: &PageManager, page_id: u64, key: &str, doc: &Document, lsn: u64| -> StorageResult<()> {
            let mut page = Page::new(PageId(page_id), PageType::Data);
            page.set_data(&encode_entry(key, doc))?;
            page.header.lsn = lsn;
            pages.write(&page)
        };

        // Committed: items/x = {"q": 5}
        let doc_x = Document::with_id("x", fields("q", 5));
        let key_x = entry_key("items", "x");
        let page_x = pages.allocate(PageType::Data).unwrap();
        wal.write(&WalRecord::begin("TXN_0000000001_1")).unwrap();
        let lsn = wal.write(&WalRecord::insert("TXN_0000000001_1", page_x.id().0, encode_entry(&key_x, &doc_x))).unwrap();
        write_entry(&pages, page_x.id().0, &key_x, &doc_x, lsn).unwrap();
        wal.write(&WalRecord::commit("TXN_0000000001_1")).unwrap();
        wal.sync().unwrap();

        // Uncommitted: items/y = {"q": 6}; the process dies before commit
        let doc_y = Document::with_id("y", fields("q", 6));
        let key_y = entry_key("items", "y");
        let page_y = pages.allocate(PageType::Data).unwrap();
        wal.write(&WalRecord::begin("TXN_0000000002_2")).unwrap();
        let lsn = wal.write(&WalRecord::insert("TXN_0000000002_2", page_y.id().0, encode_entry(&key_y, &doc_y))).unwrap();
        write_entry(&pages, page_y.id().0, &key_y, &doc_y, lsn).unwrap();
        wal.sync().unwrap();
        pages.flush().unwrap();
    }

    // Reopen: recovery keeps x, undoes y
    let db = Database::open(&db_path).unwrap();
    let report = db.recovery_report().expect("recovery ran");
    assert_eq!(report.winners, vec!["TXN_0000000001_1".to_string()]);
    assert_eq!(report.losers, vec!["TXN_0000000002_2".to_string()]);

    let items = db.collection("items").unwrap();
    let x = items.find_by_id("x").expect("committed document recovered");
    assert_eq!(value_of(&x, "q"), 5);
    assert!(items.find_by_id("y").is_none(), "uncommitted document rolled back");
}

/// Recovery idempotence: a second recovery pass changes nothing.
#[test]
fn recovery_twice_produces_identical_state() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("quill.db")).unwrap();

    let items = db.collection("items").unwrap();
    items.insert(Document::with_id("a", fields("q", 1))).unwrap();

    let first = db.recover().unwrap();
    let second = db.recover().unwrap();
    assert_eq!(first.losers, second.losers);
    assert_eq!(second.redo_applied, 0);
    assert_eq!(second.clrs_written, 0);
    assert_eq!(value_of(&items.find_by_id("a").unwrap(), "q"), 1);
}

/// Scenario 5: degree-3 B-tree range scan before and after a delete.
#[test]
fn btree_range_with_minimum_degree() {
    let mut tree: BTree<i64, String> = BTree::new(3).unwrap();
    for i in 1..=10 {
        tree.insert(i, format!("v{i}"));
    }

    let keys: Vec<i64> = tree.range_iter(&3, &7).unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![3, 4, 5, 6, 7]);

    assert!(tree.delete(&5));

    let keys: Vec<i64> = tree.range_iter(&3, &7).unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![3, 4, 6, 7]);
}

/// Scripted 2PC participant
struct ScriptedParticipant {
    vote: bool,
    log: Mutex<Vec<String>>,
}

impl ScriptedParticipant {
    fn new(vote: bool) -> Arc<Self> {
        Arc::new(Self {
            vote,
            log: Mutex::new(Vec::new()),
        })
    }

    fn saw(&self, event: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == event)
    }
}

impl Participant for ScriptedParticipant {
    fn prepare(&self, _tx_id: &str) -> StorageResult<bool> {
        self.log.lock().unwrap().push("prepare".to_string());
        Ok(self.vote)
    }

    fn commit(&self, _tx_id: &str) -> StorageResult<()> {
        self.log.lock().unwrap().push("commit".to_string());
        Ok(())
    }

    fn abort(&self, _tx_id: &str) -> StorageResult<()> {
        self.log.lock().unwrap().push("abort".to_string());
        Ok(())
    }

    fn status(&self, _tx_id: &str) -> ParticipantStatus {
        let log = self.log.lock().unwrap();
        if log.iter().any(|e| e == "commit") {
            ParticipantStatus::Committed
        } else if log.iter().any(|e| e == "abort") {
            ParticipantStatus::Aborted
        } else if log.iter().any(|e| e == "prepare") {
            ParticipantStatus::Prepared
        } else {
            ParticipantStatus::Unknown
        }
    }
}

/// Scenario 6: one dissenting vote aborts the distributed transaction on
/// both participants.
#[test]
fn coordinator_aborts_on_dissenting_vote() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("quill.db")).unwrap();
    let coordinator = db.coordinator();

    let p1 = ScriptedParticipant::new(true);
    let p2 = ScriptedParticipant::new(false);
    coordinator.register_participant("p1", p1.clone());
    coordinator.register_participant("p2", p2.clone());

    coordinator.begin("DTX_1", &["p1".to_string(), "p2".to_string()]).unwrap();
    assert!(!coordinator.prepare("DTX_1").unwrap());

    // Commit after the failed prepare is rejected
    assert!(coordinator.commit("DTX_1").is_err());

    assert!(p1.saw("abort"));
    assert!(p2.saw("abort"));
    assert_eq!(p1.status("DTX_1"), ParticipantStatus::Aborted);
    assert_eq!(p2.status("DTX_1"), ParticipantStatus::Aborted);
}

/// WAL durability: once commit returns, closing and reopening reproduces
/// exactly the committed changes.
#[test]
fn committed_changes_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("quill.db");

    {
        let db = Database::open(&path).unwrap();
        db.collection("users").unwrap();

        let tx = db.begin_transaction().unwrap();
        tx.write("users/alice", fields("age", 30)).unwrap();
        tx.write("users/bob", fields("age", 40)).unwrap();
        tx.commit().unwrap();

        let tx = db.begin_transaction().unwrap();
        assert!(tx.delete("users/bob").unwrap());
        tx.commit().unwrap();

        db.close().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let users = db.collection("users").unwrap();
    assert_eq!(value_of(&users.find_by_id("alice").unwrap(), "age"), 30);
    assert!(users.find_by_id("bob").is_none());
    assert_eq!(users.count(), 1);
}

/// insert(k); delete(k) leaves the collection observably unchanged.
#[test]
fn insert_then_delete_restores_pre_state() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("quill.db")).unwrap();
    let users = db.collection("users").unwrap();

    users.insert(Document::with_id("stable", fields("v", 1))).unwrap();
    let count_before = users.count();

    users.insert(Document::with_id("ephemeral", fields("v", 2))).unwrap();
    assert!(users.delete("ephemeral").unwrap());

    assert_eq!(users.count(), count_before);
    assert!(users.find_by_id("ephemeral").is_none());
    assert!(users.find_by_id("stable").is_some());
}

/// Serializable readers block conflicting writers until commit.
#[test]
fn serializable_read_blocks_writer() {
    let dir = tempdir().unwrap();
    let db = Arc::new(
        DatabaseOptions::new(dir.path().join("quill.db"))
            .lock_timeout(Duration::from_millis(200))
            .open()
            .unwrap(),
    );
    let users = db.collection("users").unwrap();
    users.insert(Document::with_id("1", fields("v", 1))).unwrap();

    let reader = db.begin_transaction_with(IsolationLevel::Serializable).unwrap();
    reader.read("users/1").unwrap();

    // A writer cannot take the write lock while the read lock is held
    let writer = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    match writer.write("users/1", fields("v", 2)) {
        Err(StorageError::LockTimeout(_)) => {}
        other => panic!("expected lock timeout, got {other:?}"),
    }
    writer.rollback().unwrap();

    reader.commit().unwrap();

    // After the reader commits the lock is free again
    let writer = db.begin_transaction_with(IsolationLevel::ReadCommitted).unwrap();
    writer.write("users/1", fields("v", 2)).unwrap();
    writer.commit().unwrap();
}
