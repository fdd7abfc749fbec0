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

// Transaction management module
// ACID transactions over collection entries keyed as `<collection>/<id>`.
// A transaction stages its mutations locally, takes locks through the lock
// manager per its isolation level, logs every step to the WAL, and applies
// the staged set at commit. Locks are acquired in the order (external
// lock-manager lock, then internal transaction lock) and released in
// reverse; the StagingGuard type owns that combined acquisition.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::document::{entry_key, split_entry_key, Document};
use crate::serialization::encode_entry;
use crate::storage_engine::lib::{current_millis, StorageError, StorageResult};
use crate::storage_engine::lock_manager::LockManager;
use crate::storage_engine::version_manager::{VersionManager, Visibility};
use crate::storage_engine::wal::{WalRecord, WriteAheadLog};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Dirty reads allowed; no read locks at all
    ReadUncommitted,
    /// Short read locks; each read sees the latest committed version
    ReadCommitted,
    /// Reads are stable for the transaction's lifetime via the read cache
    RepeatableRead,
    /// Read locks held to commit; scans take range locks
    Serializable,
    /// Treated as RepeatableRead until a dedicated design lands
    Snapshot,
}

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Kind of staged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A staged mutation for one key. Successive operations on the same key
/// merge into one staged entry, keeping the first observed old state.
#[derive(Debug, Clone)]
pub struct StagedOperation {
    pub kind: OperationKind,
    /// Committed document at first touch, None when the key was absent
    pub old: Option<Document>,
    /// Staged state, None for a delete
    pub new: Option<Document>,
    /// Page backing this key
    pub page_id: u64,
    /// Whether this transaction allocated the page itself
    pub allocated_page: bool,
    /// LSN of the newest WAL record staged for this key
    pub lsn: u64,
    /// Staging timestamp, UTC milliseconds
    pub at: u64,
}

/// Format a transaction identifier, unique within a database lifetime
pub fn format_tx_id(counter: u64, ticks: u64) -> String {
    format!("TXN_{counter:010}_{ticks}")
}

/// The database-side surface a transaction applies itself through. Held
/// weakly so transactions never extend the database's lifetime.
pub trait TransactionContext: Send + Sync {
    /// Committed document currently in the primary index
    fn committed_document(&self, key: &str) -> Option<Document>;

    /// Page currently backing `key`, if any
    fn page_for_key(&self, key: &str) -> Option<u64>;

    /// Allocate a data page for a key this transaction is inserting
    fn allocate_page(&self) -> StorageResult<u64>;

    /// Return a page whose staged insert never committed
    fn release_page(&self, page_id: u64);

    /// Apply a committed write: page image, primary index, version chain
    fn apply_write(&self, key: &str, page_id: u64, document: &Document, lsn: u64, tx_id: &str, commit_time: u64) -> StorageResult<()>;

    /// Apply a committed delete
    fn apply_delete(&self, key: &str, page_id: Option<u64>, tx_id: &str, commit_time: u64) -> StorageResult<()>;

    /// Drop a finished transaction from the registry
    fn deregister(&self, tx_id: &str);
}

/// Mutable transaction workspace, guarded by the internal transaction lock
struct TxWorkspace {
    staged: BTreeMap<String, StagedOperation>,
    read_cache: HashMap<String, Option<Document>>,
    read_versions: HashMap<String, u64>,
}

/// Owns the combined (external lock-manager lock, internal transaction
/// lock) acquisition for one operation and releases in reverse order on
/// every path: the workspace guard is dropped before any short-lived
/// external lock is released.
struct StagingGuard<'a> {
    workspace: Option<MutexGuard<'a, TxWorkspace>>,
    short_read: Option<(&'a LockManager, &'a str, String)>,
}

impl<'a> StagingGuard<'a> {
    fn workspace(&mut self) -> &mut TxWorkspace {
        self.workspace.as_mut().expect("workspace released only on drop")
    }
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        // Internal lock first, then the external lock
        self.workspace.take();
        if let Some((locks, tx_id, resource)) = self.short_read.take() {
            locks.release(tx_id, &resource);
        }
    }
}

/// Shared state of one transaction
pub struct TransactionInner {
    id: String,
    isolation: IsolationLevel,
    /// Logical start timestamp from the version manager's clock
    start_time: u64,
    state: Mutex<TransactionState>,
    workspace: Mutex<TxWorkspace>,
    victim: AtomicBool,
    finalized: AtomicBool,
    timeout: Mutex<Duration>,
    last_activity: Mutex<Instant>,
    first_lsn: Mutex<Option<u64>>,
    locks: Arc<LockManager>,
    versions: Arc<VersionManager>,
    wal: Arc<WriteAheadLog>,
    context: Weak<dyn TransactionContext>,
}

impl TransactionInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        isolation: IsolationLevel,
        start_time: u64,
        timeout: Duration,
        locks: Arc<LockManager>,
        versions: Arc<VersionManager>,
        wal: Arc<WriteAheadLog>,
        context: Weak<dyn TransactionContext>,
    ) -> StorageResult<Arc<Self>> {
        let inner = Arc::new(Self {
            id,
            isolation,
            start_time,
            state: Mutex::new(TransactionState::Active),
            workspace: Mutex::new(TxWorkspace {
                staged: BTreeMap::new(),
                read_cache: HashMap::new(),
                read_versions: HashMap::new(),
            }),
            victim: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            timeout: Mutex::new(timeout),
            last_activity: Mutex::new(Instant::now()),
            first_lsn: Mutex::new(None),
            locks,
            versions,
            wal,
            context,
        });

        let lsn = inner.wal.write(&WalRecord::begin(&inner.id))?;
        *inner.first_lsn.lock().unwrap() = Some(lsn);
        Ok(inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn first_lsn(&self) -> u64 {
        self.first_lsn.lock().unwrap().unwrap_or(0)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Whether the idle timer has expired
    pub fn timed_out(&self) -> bool {
        self.last_activity.lock().unwrap().elapsed() > *self.timeout.lock().unwrap()
    }

    /// Mark this transaction as the victim of a deadlock: flip the state to
    /// Aborted, which cancels its pending lock waits. The victim surfaces
    /// the deadlock error on its next operation.
    pub fn mark_victim(&self) {
        self.victim.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = TransactionState::Aborted;
        self.locks.cancel_waits(&self.id);
    }

    /// Abort from outside (idle timeout): flip the state and cancel waits;
    /// the caller schedules the rollback.
    pub fn mark_aborted(&self) {
        *self.state.lock().unwrap() = TransactionState::Aborted;
        self.locks.cancel_waits(&self.id);
    }

    pub fn is_victim(&self) -> bool {
        self.victim.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn check_active(&self) -> StorageResult<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            TransactionState::Aborted | TransactionState::Aborting => {
                if self.is_victim() {
                    Err(StorageError::DeadlockVictim(self.id.clone()))
                } else {
                    Err(StorageError::TransactionAborted(self.id.clone()))
                }
            }
            state => Err(StorageError::InvalidState(format!("transaction {} is {state:?}", self.id))),
        }
    }

    fn context(&self) -> StorageResult<Arc<dyn TransactionContext>> {
        self.context.upgrade().ok_or_else(|| StorageError::Closed("database".to_string()))
    }

    /// Map a lock-manager outcome onto transaction errors
    fn require_lock(&self, outcome: StorageResult<bool>, resource: &str) -> StorageResult<()> {
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(StorageError::LockTimeout(resource.to_string())),
            Err(StorageError::TransactionAborted(_)) => {
                if self.is_victim() {
                    Err(StorageError::DeadlockVictim(self.id.clone()))
                } else {
                    Err(StorageError::TransactionAborted(self.id.clone()))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read a document by key.
    ///
    /// Steps:
    /// 1. A staged operation for the key wins: a staged delete reads as
    ///    absent, a staged write reads as the staged value.
    /// 2. RepeatableRead and Serializable consult the read cache next.
    /// 3. Serializable takes a read lock held to commit. ReadCommitted
    ///    resolves committed versions lock-free through the chain and only
    ///    brackets the primary-index fallback with a short read lock.
    /// 4. Resolve through the version manager, falling back to the primary
    ///    index when the chain has no visible entry.
    /// 5. RepeatableRead and Serializable record the read in cache and
    ///    read-version map. A Read record lands in the WAL for audit.
    pub fn read(self: &Arc<Self>, key: &str) -> StorageResult<Option<Document>> {
        self.touch();
        self.check_active()?;
        validate_key(key)?;

        let mut guard = self.lock_for_read(key)?;
        let workspace = guard.workspace();

        if let Some(staged) = workspace.staged.get(key) {
            return Ok(staged.new.clone());
        }

        let caches = matches!(self.isolation, IsolationLevel::RepeatableRead | IsolationLevel::Serializable | IsolationLevel::Snapshot);
        if caches {
            if let Some(cached) = workspace.read_cache.get(key) {
                return Ok(cached.clone());
            }
        }

        let document = match self.versions.visible_version(key, &self.id, self.start_time, self.isolation) {
            Visibility::Document(document) => Some(document),
            Visibility::Deleted => None,
            Visibility::NoEntry => self.context()?.committed_document(key),
        };

        if caches {
            workspace.read_cache.insert(key.to_string(), document.clone());
            if let Some(document) = &document {
                workspace.read_versions.insert(key.to_string(), document.version);
            }
        }

        self.wal.write(&WalRecord::read(&self.id, key))?;

        Ok(document)
    }

    /// Stage a write for `key`. The write lock is held until commit; the
    /// WAL record carries the page image the commit will apply.
    pub fn write(self: &Arc<Self>, key: &str, fields: BTreeMap<String, crate::document::Value>) -> StorageResult<()> {
        self.touch();
        self.check_active()?;
        validate_key(key)?;

        self.require_lock(self.locks.acquire_write(&self.id, key, self.locks.default_timeout()), key)
            .map_err(|e| self.abort_on_fatal(e))?;

        let context = self.context()?;
        let mut guard = self.guard_staging();
        let workspace = guard.workspace();

        let (_, doc_id) = split_entry_key(key).ok_or_else(|| StorageError::InvalidArgument(format!("key {key} is not <collection>/<id>")))?;

        let previous = workspace.staged.get(key).cloned();
        let (old, page_id, allocated_page) = match &previous {
            Some(op) => (op.old.clone(), op.page_id, op.allocated_page),
            None => {
                let old = context.committed_document(key);
                match context.page_for_key(key) {
                    Some(page_id) => (old, page_id, false),
                    None => (old, context.allocate_page()?, true),
                }
            }
        };

        // The staged document supersedes whatever came before it
        let base_version = previous
            .as_ref()
            .and_then(|op| op.new.as_ref().map(|d| d.version))
            .or(old.as_ref().map(|d| d.version))
            .unwrap_or(0);
        let created_at = old.as_ref().map(|d| d.created_at).unwrap_or_else(current_millis);
        let document = Document {
            id: doc_id.to_string(),
            version: base_version + 1,
            created_at,
            updated_at: current_millis(),
            fields,
        };

        let prior_state = previous.as_ref().and_then(|op| op.new.as_ref()).or(old.as_ref());
        let after_image = encode_entry(key, &document);
        let record = match prior_state {
            Some(prior) => WalRecord::update(&self.id, page_id, encode_entry(key, prior), after_image),
            None => WalRecord::insert(&self.id, page_id, after_image),
        };
        let lsn = self.wal.write(&record)?;

        let kind = if old.is_some() { OperationKind::Update } else { OperationKind::Insert };
        workspace.staged.insert(
            key.to_string(),
            StagedOperation {
                kind,
                old,
                new: Some(document.clone()),
                page_id,
                allocated_page,
                lsn,
                at: current_millis(),
            },
        );

        if self.isolation != IsolationLevel::ReadCommitted {
            workspace.read_cache.insert(key.to_string(), Some(document));
        }

        Ok(())
    }

    /// Stage a delete for `key`. Returns false when the key neither exists
    /// nor has a staged write.
    pub fn delete(self: &Arc<Self>, key: &str) -> StorageResult<bool> {
        self.touch();
        self.check_active()?;
        validate_key(key)?;

        self.require_lock(self.locks.acquire_write(&self.id, key, self.locks.default_timeout()), key)
            .map_err(|e| self.abort_on_fatal(e))?;

        let context = self.context()?;
        let mut guard = self.guard_staging();
        let workspace = guard.workspace();

        let previous = workspace.staged.get(key).cloned();
        let (old, page_id, allocated_page, prior_state) = match &previous {
            Some(op) => {
                if op.new.is_none() {
                    return Ok(false);
                }
                (op.old.clone(), op.page_id, op.allocated_page, op.new.clone())
            }
            None => match context.committed_document(key) {
                Some(existing) => {
                    let page_id = context.page_for_key(key).unwrap_or(0);
                    (Some(existing.clone()), page_id, false, Some(existing))
                }
                None => return Ok(false),
            },
        };

        let before = prior_state.as_ref().map(|d| encode_entry(key, d)).unwrap_or_default();
        let lsn = self.wal.write(&WalRecord::delete(&self.id, page_id, before))?;

        workspace.staged.insert(
            key.to_string(),
            StagedOperation {
                kind: OperationKind::Delete,
                old,
                new: None,
                page_id,
                allocated_page,
                lsn,
                at: current_millis(),
            },
        );
        workspace.read_cache.remove(key);

        Ok(true)
    }

    /// Commit the staged set.
    ///
    /// Steps:
    /// 1. Active -> Preparing; append Prepare and fsync so every staged
    ///    data record is durable before its page write.
    /// 2. -> Prepared; apply each staged operation to the page store, the
    ///    primary index and the version chain.
    /// 3. -> Committing; append Commit; fsync.
    /// 4. -> Committed; release all locks; deregister.
    /// Any failure rolls the transaction back and re-raises.
    pub fn commit(self: &Arc<Self>) -> StorageResult<()> {
        self.touch();

        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    fn commit_inner(self: &Arc<Self>) -> StorageResult<()> {
        self.transition(TransactionState::Active, TransactionState::Preparing)?;
        self.wal.write(&WalRecord::prepare(&self.id))?;
        self.wal.sync()?;
        self.transition(TransactionState::Preparing, TransactionState::Prepared)?;

        let context = self.context()?;
        let commit_time = self.versions.next_timestamp();

        {
            let workspace = self.workspace.lock().unwrap();
            let mut applied: Vec<(&String, &StagedOperation)> = Vec::new();

            let result = workspace.staged.iter().try_for_each(|(key, op)| {
                match (&op.new, &op.old) {
                    (Some(document), _) => {
                        context.apply_write(key, op.page_id, document, op.lsn, &self.id, commit_time)?;
                        applied.push((key, op));
                    }
                    (None, Some(_)) => {
                        context.apply_delete(key, Some(op.page_id), &self.id, commit_time)?;
                        applied.push((key, op));
                    }
                    (None, None) => {
                        // Inserted and deleted inside this transaction
                        if op.allocated_page {
                            context.release_page(op.page_id);
                        }
                    }
                }
                Ok(())
            });

            if let Err(e) = result {
                // Restore the pre-commit state of everything already applied
                for (key, op) in applied {
                    let undo = match &op.old {
                        Some(old) => context.apply_write(key, op.page_id, old, op.lsn, &self.id, commit_time),
                        None => context.apply_delete(key, Some(op.page_id), &self.id, commit_time),
                    };
                    if let Err(undo_err) = undo {
                        tracing::error!(tx = %self.id, key = %key, error = %undo_err, "failed to revert partial commit");
                    }
                }
                return Err(e);
            }
        }

        self.transition(TransactionState::Prepared, TransactionState::Committing)?;
        self.wal.write(&WalRecord::commit(&self.id))?;
        self.wal.sync()?;
        self.transition(TransactionState::Committing, TransactionState::Committed)?;

        self.finalized.store(true, Ordering::SeqCst);
        self.locks.release_all(&self.id);
        context.deregister(&self.id);

        tracing::debug!(tx = %self.id, "committed");
        Ok(())
    }

    /// Roll back: append a Rollback record, discard the staged set, release
    /// locks and deregister. Idempotent after Committed or Aborted.
    pub fn rollback(self: &Arc<Self>) -> StorageResult<()> {
        if self.state() == TransactionState::Committed {
            return Ok(());
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();
            *state = TransactionState::Aborting;
        }

        self.wal.write(&WalRecord::rollback(&self.id))?;

        if let Ok(context) = self.context() {
            let workspace = self.workspace.lock().unwrap();
            for op in workspace.staged.values() {
                if op.allocated_page {
                    context.release_page(op.page_id);
                }
            }
        }
        {
            let mut workspace = self.workspace.lock().unwrap();
            workspace.staged.clear();
            workspace.read_cache.clear();
            workspace.read_versions.clear();
        }

        *self.state.lock().unwrap() = TransactionState::Aborted;
        self.locks.release_all(&self.id);
        if let Ok(context) = self.context() {
            context.deregister(&self.id);
        }

        tracing::debug!(tx = %self.id, "rolled back");
        Ok(())
    }

    fn transition(&self, from: TransactionState, to: TransactionState) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(match *state {
                TransactionState::Aborted | TransactionState::Aborting => {
                    if self.is_victim() {
                        StorageError::DeadlockVictim(self.id.clone())
                    } else {
                        StorageError::TransactionAborted(self.id.clone())
                    }
                }
                other => StorageError::InvalidState(format!("transaction {} is {other:?}, expected {from:?}", self.id)),
            });
        }
        *state = to;
        Ok(())
    }

    /// Roll back after a fatal operation error, preserving the error
    fn abort_on_fatal(self: &Arc<Self>, error: StorageError) -> StorageError {
        if matches!(error, StorageError::DeadlockVictim(_) | StorageError::TransactionAborted(_)) {
            let _ = self.rollback();
        }
        error
    }

    /// Acquire whatever external lock the isolation level demands for a
    /// read, then the internal transaction lock. External locks always come
    /// before the workspace lock.
    fn lock_for_read<'a>(self: &'a Arc<Self>, key: &str) -> StorageResult<StagingGuard<'a>> {
        let short_read = match self.isolation {
            IsolationLevel::Serializable => {
                // Held until commit
                self.require_lock(self.locks.acquire_read(&self.id, key, self.locks.default_timeout()), key)
                    .map_err(|e| self.abort_on_fatal(e))?;
                None
            }
            IsolationLevel::ReadCommitted => {
                // Committed versions come lock-free from the chain; the
                // short read lock only protects the primary-index fallback.
                // A key this transaction already holds a lock on (a staged
                // write's 2PL lock) must not be re-taken and released here.
                let falls_back = matches!(self.versions.visible_version(key, &self.id, self.start_time, self.isolation), Visibility::NoEntry)
                    && !self.locks.locks_held(&self.id).iter().any(|held| held == key);
                if falls_back {
                    self.require_lock(self.locks.acquire_read(&self.id, key, self.locks.default_timeout()), key)
                        .map_err(|e| self.abort_on_fatal(e))?;
                    Some((self.locks.as_ref() as &LockManager, self.id.as_str(), key.to_string()))
                } else {
                    None
                }
            }
            IsolationLevel::ReadUncommitted | IsolationLevel::RepeatableRead | IsolationLevel::Snapshot => None,
        };

        Ok(StagingGuard {
            workspace: Some(self.workspace.lock().unwrap()),
            short_read,
        })
    }

    fn guard_staging(&self) -> StagingGuard<'_> {
        StagingGuard {
            workspace: Some(self.workspace.lock().unwrap()),
            short_read: None,
        }
    }

    /// Number of staged operations, for tests and stats
    pub fn staged_count(&self) -> usize {
        self.workspace.lock().unwrap().staged.len()
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

/// Public transaction handle. Dropping a handle whose transaction is still
/// running rolls it back synchronously.
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub fn new(inner: Arc<TransactionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    /// Read a document through the `<collection>/<id>` key
    pub fn read(&self, key: &str) -> StorageResult<Option<Document>> {
        self.inner.read(key)
    }

    /// Read via collection and id
    pub fn read_entry(&self, collection: &str, id: &str) -> StorageResult<Option<Document>> {
        self.inner.read(&entry_key(collection, id))
    }

    /// Stage a write of `fields` under the key
    pub fn write(&self, key: &str, fields: BTreeMap<String, crate::document::Value>) -> StorageResult<()> {
        self.inner.write(key, fields)
    }

    /// Stage a write from a JSON object
    pub fn write_json(&self, key: &str, json: serde_json::Value) -> StorageResult<()> {
        match crate::document::Value::from(json) {
            crate::document::Value::Object(fields) => self.inner.write(key, fields),
            other => Err(StorageError::InvalidArgument(format!("expected a JSON object, found {}", other.type_name()))),
        }
    }

    /// Stage a delete; false when the key does not exist
    pub fn delete(&self, key: &str) -> StorageResult<bool> {
        self.inner.delete(key)
    }

    pub fn commit(&self) -> StorageResult<()> {
        self.inner.commit()
    }

    pub fn rollback(&self) -> StorageResult<()> {
        self.inner.rollback()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state(), TransactionState::Active | TransactionState::Preparing | TransactionState::Prepared) {
            let _ = self.inner.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;
    use crate::storage_engine::deadlock_detector::DeadlockDetector;
    use crate::storage_engine::storage::StorageEngine;
    use parking_lot::RwLock;
    use tempfile::tempdir;

    /// A minimal in-memory context standing in for the database
    struct TestContext {
        documents: RwLock<HashMap<String, (Document, u64)>>,
        next_page: Mutex<u64>,
    }

    impl TestContext {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                documents: RwLock::new(HashMap::new()),
                next_page: Mutex::new(1),
            })
        }
    }

    impl TransactionContext for TestContext {
        fn committed_document(&self, key: &str) -> Option<Document> {
            self.documents.read().get(key).map(|(d, _)| d.clone())
        }

        fn page_for_key(&self, key: &str) -> Option<u64> {
            self.documents.read().get(key).map(|(_, p)| *p)
        }

        fn allocate_page(&self) -> StorageResult<u64> {
            let mut next = self.next_page.lock().unwrap();
            let page = *next;
            *next += 1;
            Ok(page)
        }

        fn release_page(&self, _page_id: u64) {}

        fn apply_write(&self, key: &str, page_id: u64, document: &Document, _lsn: u64, _tx_id: &str, _commit_time: u64) -> StorageResult<()> {
            self.documents.write().insert(key.to_string(), (document.clone(), page_id));
            Ok(())
        }

        fn apply_delete(&self, key: &str, _page_id: Option<u64>, _tx_id: &str, _commit_time: u64) -> StorageResult<()> {
            self.documents.write().remove(key);
            Ok(())
        }

        fn deregister(&self, _tx_id: &str) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        locks: Arc<LockManager>,
        versions: Arc<VersionManager>,
        wal: Arc<WriteAheadLog>,
        context: Arc<TestContext>,
        counter: Mutex<u64>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let engine = Arc::new(StorageEngine::open(dir.path().join("tx.wal"), false).unwrap());
            let wal = Arc::new(WriteAheadLog::open(engine).unwrap());
            let detector = Arc::new(DeadlockDetector::new(Duration::from_millis(20)));
            Self {
                _dir: dir,
                locks: Arc::new(LockManager::new(detector, Duration::from_millis(200))),
                versions: Arc::new(VersionManager::new()),
                wal,
                context: TestContext::new(),
                counter: Mutex::new(0),
            }
        }

        fn begin(&self, isolation: IsolationLevel) -> Arc<TransactionInner> {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let id = format_tx_id(*counter, crate::storage_engine::lib::current_ticks());
            let context: Arc<dyn TransactionContext> = self.context.clone();
            TransactionInner::new(
                id,
                isolation,
                self.versions.next_timestamp(),
                Duration::from_secs(60),
                self.locks.clone(),
                self.versions.clone(),
                self.wal.clone(),
                Arc::downgrade(&context),
            )
            .unwrap()
        }

        fn fields(v: i64) -> BTreeMap<String, Value> {
            let mut fields = BTreeMap::new();
            fields.insert("v".to_string(), Value::I64(v));
            fields
        }
    }

    #[test]
    fn test_tx_id_format() {
        let id = format_tx_id(7, 123456);
        assert_eq!(id, "TXN_0000000007_123456");
    }

    #[test]
    fn test_write_then_read_own_staged_value() {
        let f = Fixture::new();
        let _ctx_keepalive: Arc<dyn TransactionContext> = f.context.clone();
        let tx = f.begin(IsolationLevel::ReadCommitted);

        tx.write("users/1", Fixture::fields(10)).unwrap();
        let doc = tx.read("users/1").unwrap().unwrap();
        assert_eq!(doc.get("v"), Some(&Value::I64(10)));
        assert_eq!(doc.version, 1);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_commit_applies_and_releases_locks() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::Serializable);

        tx.write("users/1", Fixture::fields(1)).unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        assert!(f.context.committed_document("users/1").is_some());
        assert!(f.locks.locks_held(tx.id()).is_empty());

        // The version chain carries the committed write
        assert_eq!(f.versions.chain_length("users/1"), 1);
    }

    #[test]
    fn test_rollback_discards_staged_set() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);

        tx.write("users/1", Fixture::fields(1)).unwrap();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::Aborted);

        assert!(f.context.committed_document("users/1").is_none());
        assert_eq!(tx.staged_count(), 0);

        // Operations after rollback fail
        assert!(matches!(tx.read("users/1"), Err(StorageError::TransactionAborted(_))));
    }

    #[test]
    fn test_delete_of_missing_key_returns_false() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);
        assert!(!tx.delete("users/absent").unwrap());
        tx.rollback().unwrap();
    }

    #[test]
    fn test_staged_delete_reads_as_absent() {
        let f = Fixture::new();

        let setup = f.begin(IsolationLevel::ReadCommitted);
        setup.write("users/1", Fixture::fields(1)).unwrap();
        setup.commit().unwrap();

        let tx = f.begin(IsolationLevel::ReadCommitted);
        assert!(tx.delete("users/1").unwrap());
        assert!(tx.read("users/1").unwrap().is_none());
        tx.rollback().unwrap();

        // Rolled back: still present
        let check = f.begin(IsolationLevel::ReadCommitted);
        assert!(check.read("users/1").unwrap().is_some());
        check.rollback().unwrap();
    }

    #[test]
    fn test_version_bumped_on_update() {
        let f = Fixture::new();

        let t1 = f.begin(IsolationLevel::ReadCommitted);
        t1.write("users/1", Fixture::fields(1)).unwrap();
        t1.commit().unwrap();

        let t2 = f.begin(IsolationLevel::ReadCommitted);
        t2.write("users/1", Fixture::fields(2)).unwrap();
        t2.commit().unwrap();

        let doc = f.context.committed_document("users/1").unwrap();
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn test_repeatable_read_uses_cache() {
        let f = Fixture::new();

        let setup = f.begin(IsolationLevel::ReadCommitted);
        setup.write("users/1", Fixture::fields(1)).unwrap();
        setup.commit().unwrap();

        let reader = f.begin(IsolationLevel::RepeatableRead);
        let first = reader.read("users/1").unwrap().unwrap();

        // Another transaction overwrites and commits
        let writer = f.begin(IsolationLevel::ReadCommitted);
        writer.write("users/1", Fixture::fields(2)).unwrap();
        writer.commit().unwrap();

        let second = reader.read("users/1").unwrap().unwrap();
        assert_eq!(first.get("v"), second.get("v"));
        reader.rollback().unwrap();
    }

    #[test]
    fn test_commit_after_commit_is_invalid() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);
        tx.write("users/1", Fixture::fields(1)).unwrap();
        tx.commit().unwrap();

        assert!(matches!(tx.commit(), Err(StorageError::InvalidState(_))));
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);
        tx.write("users/1", Fixture::fields(1)).unwrap();
        tx.rollback().unwrap();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_victim_surfaces_deadlock_error() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);
        tx.mark_victim();

        match tx.read("users/1") {
            Err(StorageError::DeadlockVictim(id)) => assert_eq!(id, tx.id()),
            other => panic!("expected deadlock victim, got {other:?}"),
        }
    }

    #[test]
    fn test_write_conflict_times_out() {
        let f = Fixture::new();
        let t1 = f.begin(IsolationLevel::ReadCommitted);
        let t2 = f.begin(IsolationLevel::ReadCommitted);

        t1.write("users/1", Fixture::fields(1)).unwrap();
        // t2 blocks on the same key and times out (200ms default in fixture)
        match t2.write("users/1", Fixture::fields(2)) {
            Err(StorageError::LockTimeout(_)) => {}
            other => panic!("expected lock timeout, got {other:?}"),
        }

        t1.commit().unwrap();
        t2.rollback().unwrap();
    }

    #[test]
    fn test_empty_key_rejected() {
        let f = Fixture::new();
        let tx = f.begin(IsolationLevel::ReadCommitted);
        assert!(matches!(tx.read(""), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(tx.write("", BTreeMap::new()), Err(StorageError::InvalidArgument(_))));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_handle_drop_rolls_back() {
        let f = Fixture::new();
        let inner = f.begin(IsolationLevel::ReadCommitted);
        {
            let handle = Transaction::new(inner.clone());
            handle.write("users/9", Fixture::fields(9)).unwrap();
        }
        assert_eq!(inner.state(), TransactionState::Aborted);
        assert!(f.context.committed_document("users/9").is_none());
    }
}
