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

//! Database root object
//!
//! Owns the storage engine, page manager, WAL, recovery and checkpoint
//! managers, deadlock detector, lock manager, transaction coordinator and
//! the collection registry. Opening runs crash recovery when the WAL is
//! non-empty and rebuilds the in-memory collections from the page store;
//! closing rolls back active transactions, checkpoints, and stops every
//! background service deterministically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::document::collection::{Collection, CollectionServices};
use crate::document::{split_entry_key, Document, DocumentResult};
use crate::memory::cache::CacheStats;
use crate::serialization::decode_entry;
use crate::storage_engine::checkpoint::CheckpointManager;
use crate::storage_engine::coordinator::{CoordinatorRecoveryService, TransactionCoordinator};
use crate::storage_engine::deadlock_detector::{DeadlockDetectionService, DeadlockDetector, DeadlockStatistics};
use crate::storage_engine::file_format::{PageId, PageType};
use crate::storage_engine::lib::{current_ticks, StorageConfig, StorageError, StorageResult};
use crate::storage_engine::lock_manager::{LockManager, LockStatistics};
use crate::storage_engine::page_manager::PageManager;
use crate::storage_engine::recovery::{RecoveryManager, RecoveryReport};
use crate::storage_engine::storage::StorageEngine;
use crate::storage_engine::transaction::{format_tx_id, IsolationLevel, Transaction, TransactionContext, TransactionInner, TransactionState};
use crate::storage_engine::version_manager::{VersionManager, VersionStatistics};
use crate::storage_engine::wal::{WalStats, WriteAheadLog};

/// How often the maintenance thread sweeps timeouts, checkpoints and
/// version cleanup
const MAINTENANCE_TICK: Duration = Duration::from_millis(250);
/// How often the coordinator re-drives forgotten decisions
const COORDINATOR_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Builder over [`StorageConfig`]
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    config: StorageConfig,
}

impl DatabaseOptions {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            config: StorageConfig {
                path: path.as_ref().to_path_buf(),
                ..StorageConfig::default()
            },
        }
    }

    pub fn btree_degree(mut self, degree: usize) -> Self {
        self.config.btree_degree = degree;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    pub fn deadlock_detection_interval(mut self, interval: Duration) -> Self {
        self.config.deadlock_detection_interval = interval;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    pub fn wal_segment_limit(mut self, limit: u64) -> Self {
        self.config.wal_segment_limit = limit;
        self
    }

    pub fn direct_io(mut self, direct_io: bool) -> Self {
        self.config.direct_io = direct_io;
        self
    }

    /// Open the database with these options
    pub fn open(self) -> DocumentResult<Database> {
        Database::open_with(self.config)
    }
}

/// Aggregated statistics snapshot
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub collections: usize,
    pub active_transactions: usize,
    pub locks: LockStatistics,
    pub deadlocks: DeadlockStatistics,
    pub versions: VersionStatistics,
    pub page_cache: CacheStats,
    pub wal: WalStats,
}

struct DatabaseInner {
    config: StorageConfig,
    path: PathBuf,
    data_engine: Arc<StorageEngine>,
    wal: Arc<WriteAheadLog>,
    pages: Arc<PageManager>,
    versions: Arc<VersionManager>,
    detector: Arc<DeadlockDetector>,
    locks: Arc<LockManager>,
    checkpoints: CheckpointManager,
    coordinator: Arc<TransactionCoordinator>,
    services: Arc<CollectionServices>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    transactions: Mutex<HashMap<String, Arc<TransactionInner>>>,
    tx_counter: Arc<AtomicU64>,
    open: AtomicBool,
}

impl DatabaseInner {
    fn check_open(&self) -> StorageResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Closed(format!("database {}", self.path.display())))
        }
    }

    fn collection(&self, name: &str) -> DocumentResult<Arc<Collection>> {
        {
            let collections = self.collections.read().unwrap();
            if let Some(collection) = collections.get(name) {
                return Ok(collection.clone());
            }
        }

        let mut collections = self.collections.write().unwrap();
        if let Some(collection) = collections.get(name) {
            return Ok(collection.clone());
        }
        let collection = Arc::new(Collection::new(name, self.services.clone())?);
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Active transactions with their first LSNs, for checkpointing
    fn active_transaction_info(&self) -> Vec<(String, u64)> {
        let transactions = self.transactions.lock().unwrap();
        transactions.values().map(|tx| (tx.id().to_string(), tx.first_lsn())).collect()
    }

    fn active_start_times(&self) -> Vec<u64> {
        let transactions = self.transactions.lock().unwrap();
        transactions.values().map(|tx| tx.start_time()).collect()
    }
}

impl TransactionContext for DatabaseInner {
    fn committed_document(&self, key: &str) -> Option<Document> {
        let (collection, id) = split_entry_key(key)?;
        let collection = self.collections.read().unwrap().get(collection).cloned()?;
        collection.find_by_id(id)
    }

    fn page_for_key(&self, key: &str) -> Option<u64> {
        let (collection, id) = split_entry_key(key)?;
        let collection = self.collections.read().unwrap().get(collection).cloned()?;
        collection.page_of(id)
    }

    fn allocate_page(&self) -> StorageResult<u64> {
        Ok(self.pages.allocate(PageType::Data)?.id().0)
    }

    fn release_page(&self, page_id: u64) {
        match self.pages.free(PageId(page_id)) {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(page = page_id, error = %e, "failed to release staged page"),
        }
    }

    fn apply_write(&self, key: &str, page_id: u64, document: &Document, lsn: u64, tx_id: &str, commit_time: u64) -> StorageResult<()> {
        let (collection_name, id) = split_entry_key(key).ok_or_else(|| StorageError::InvalidArgument(format!("key {key} is not <collection>/<id>")))?;
        let collection = self.collection(collection_name).map_err(|e| StorageError::InvalidState(e.to_string()))?;
        collection.apply_committed_write(id, page_id, document, lsn, tx_id, commit_time)
    }

    fn apply_delete(&self, key: &str, page_id: Option<u64>, tx_id: &str, commit_time: u64) -> StorageResult<()> {
        let (collection_name, id) = split_entry_key(key).ok_or_else(|| StorageError::InvalidArgument(format!("key {key} is not <collection>/<id>")))?;
        let collection = self.collection(collection_name).map_err(|e| StorageError::InvalidState(e.to_string()))?;
        collection.apply_committed_delete(id, page_id, tx_id, commit_time)
    }

    fn deregister(&self, tx_id: &str) {
        self.transactions.lock().unwrap().remove(tx_id);
        self.detector.remove_transaction(tx_id);
    }
}

/// Maintenance thread: transaction idle timeouts, interval checkpoints and
/// version-chain cleanup.
struct MaintenanceService {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MaintenanceService {
    fn start(inner: &Arc<DatabaseInner>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let weak = Arc::downgrade(inner);
        let flag = running.clone();

        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Acquire) {
                std::thread::sleep(MAINTENANCE_TICK);

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.open.load(Ordering::SeqCst) {
                    continue;
                }

                // Abort idle transactions past their timeout
                let expired: Vec<Arc<TransactionInner>> = {
                    let transactions = inner.transactions.lock().unwrap();
                    transactions.values().filter(|tx| tx.state() == TransactionState::Active && tx.timed_out()).cloned().collect()
                };
                for tx in expired {
                    tracing::warn!(tx = tx.id(), "transaction idle timeout; rolling back");
                    tx.mark_aborted();
                    if let Err(e) = tx.rollback() {
                        tracing::warn!(tx = tx.id(), error = %e, "timeout rollback failed");
                    }
                }

                // Interval / size driven checkpoint; failures stay inside
                // the timer so the engine keeps running
                if inner.checkpoints.is_needed() {
                    if let Err(e) = inner.checkpoints.create_checkpoint(inner.active_transaction_info()) {
                        tracing::warn!(error = %e, "background checkpoint failed");
                    }
                }

                // Drop versions no active transaction can still see
                inner.versions.cleanup(&inner.active_start_times());
            }
        });

        Self {
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The embedded database
pub struct Database {
    inner: Arc<DatabaseInner>,
    deadlock_service: DeadlockDetectionService,
    coordinator_service: CoordinatorRecoveryService,
    maintenance: MaintenanceService,
    /// Report of the recovery pass that ran at open, if any
    recovery_report: Option<RecoveryReport>,
}

impl Database {
    /// Open (or create) the database at `path` with default options
    pub fn open(path: impl AsRef<Path>) -> DocumentResult<Self> {
        DatabaseOptions::new(path).open()
    }

    /// Open with explicit configuration
    pub fn open_with(config: StorageConfig) -> DocumentResult<Self> {
        let path = config.path.clone();
        tracing::info!(path = %path.display(), "opening database");

        let data_engine = Arc::new(StorageEngine::open(&path, config.direct_io)?);
        let wal_engine = Arc::new(StorageEngine::open(wal_path(&path), config.direct_io)?);
        let coordinator_engine = Arc::new(StorageEngine::open(coordinator_log_path(&path), false)?);

        let wal = Arc::new(WriteAheadLog::open(wal_engine)?);
        let pages = Arc::new(PageManager::open(data_engine.clone(), config.cache_capacity)?);
        let versions = Arc::new(VersionManager::new());
        let detector = Arc::new(DeadlockDetector::new(config.deadlock_detection_interval));
        let locks = Arc::new(LockManager::new(detector.clone(), config.lock_timeout));
        let checkpoints = CheckpointManager::new(wal.clone(), pages.clone(), config.checkpoint_interval, config.wal_segment_limit);
        let coordinator = Arc::new(TransactionCoordinator::open(coordinator_engine)?);

        let tx_counter = Arc::new(AtomicU64::new(0));
        let services = Arc::new(CollectionServices {
            wal: wal.clone(),
            pages: pages.clone(),
            versions: versions.clone(),
            tx_counter: tx_counter.clone(),
            btree_degree: config.btree_degree,
        });

        // ARIES recovery when the log carries anything
        let recovery_report = if wal.last_lsn() > 0 {
            let recovery = RecoveryManager::new(wal.clone(), pages.clone());
            Some(recovery.recover()?)
        } else {
            None
        };

        let inner = Arc::new(DatabaseInner {
            config,
            path: path.clone(),
            data_engine,
            wal,
            pages,
            versions,
            detector,
            locks,
            checkpoints,
            coordinator,
            services,
            collections: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            tx_counter,
            open: AtomicBool::new(true),
        });

        // Rebuild the in-memory collections from the page store
        Self::load_collections(&inner)?;

        // Recovery completes with a fresh checkpoint
        if recovery_report.is_some() {
            inner.checkpoints.create_checkpoint(Vec::new())?;
        }

        inner.coordinator.recover()?;

        // The deadlock detector's event sink flips victims to Aborted,
        // cancelling their waits
        {
            let weak = Arc::downgrade(&inner);
            inner.detector.set_victim_handler(Box::new(move |_cycle, victim| {
                if let Some(inner) = weak.upgrade() {
                    let tx = inner.transactions.lock().unwrap().get(victim).cloned();
                    if let Some(tx) = tx {
                        tx.mark_victim();
                    }
                }
            }));
        }

        let deadlock_service = DeadlockDetectionService::new(inner.detector.clone());
        deadlock_service.start();
        let coordinator_service = CoordinatorRecoveryService::new(inner.coordinator.clone(), COORDINATOR_RECOVERY_INTERVAL);
        coordinator_service.start();
        let maintenance = MaintenanceService::start(&inner);

        if let Some(report) = &recovery_report {
            tracing::info!(
                winners = report.winners.len(),
                losers = report.losers.len(),
                redone = report.redo_applied,
                "database recovered"
            );
        }

        Ok(Self {
            inner,
            deadlock_service,
            coordinator_service,
            maintenance,
            recovery_report,
        })
    }

    fn load_collections(inner: &Arc<DatabaseInner>) -> DocumentResult<()> {
        for page_id in 1..inner.pages.page_count() {
            let page = match inner.pages.get(PageId(page_id)) {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(page = page_id, error = %e, "skipping unreadable page while loading");
                    continue;
                }
            };

            if page.header.page_type != PageType::Data || page.header.payload_length == 0 {
                continue;
            }

            match decode_entry(page.data()) {
                Ok((key, document)) => {
                    if let Some((collection_name, _)) = split_entry_key(&key) {
                        let collection = inner.collection(collection_name)?;
                        collection.load_recovered(document, page_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(page = page_id, error = %e, "skipping undecodable data page");
                }
            }
        }
        Ok(())
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// What recovery did at open, when it ran
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery_report.as_ref()
    }

    /// Fetch or create a collection
    pub fn collection(&self, name: &str) -> DocumentResult<Arc<Collection>> {
        self.inner.check_open()?;
        self.inner.collection(name)
    }

    /// Names of the collections currently materialized
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Begin a transaction at the default Serializable isolation
    pub fn begin_transaction(&self) -> DocumentResult<Transaction> {
        self.begin_transaction_with(IsolationLevel::Serializable)
    }

    /// Begin a transaction at an explicit isolation level
    pub fn begin_transaction_with(&self, isolation: IsolationLevel) -> DocumentResult<Transaction> {
        self.inner.check_open()?;

        let counter = self.inner.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format_tx_id(counter, current_ticks());
        let start_time = self.inner.versions.next_timestamp();

        let context: Arc<dyn TransactionContext> = self.inner.clone();
        let tx = TransactionInner::new(
            id.clone(),
            isolation,
            start_time,
            self.inner.config.transaction_timeout,
            self.inner.locks.clone(),
            self.inner.versions.clone(),
            self.inner.wal.clone(),
            Arc::downgrade(&context),
        )?;

        self.inner.transactions.lock().unwrap().insert(id.clone(), tx.clone());
        self.inner.detector.register_transaction(&id, start_time);

        Ok(Transaction::new(tx))
    }

    /// The two-phase commit coordinator
    pub fn coordinator(&self) -> Arc<TransactionCoordinator> {
        self.inner.coordinator.clone()
    }

    /// Force a checkpoint now
    pub fn checkpoint(&self) -> DocumentResult<u64> {
        self.inner.check_open()?;
        let event = self.inner.checkpoints.create_checkpoint(self.inner.active_transaction_info())?;
        Ok(event.checkpoint_lsn)
    }

    /// Re-run crash recovery; a no-op when the engine is already consistent
    pub fn recover(&self) -> DocumentResult<RecoveryReport> {
        self.inner.check_open()?;
        let recovery = RecoveryManager::new(self.inner.wal.clone(), self.inner.pages.clone());
        Ok(recovery.recover()?)
    }

    /// Aggregated statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            collections: self.inner.collections.read().unwrap().len(),
            active_transactions: self.inner.transactions.lock().unwrap().len(),
            locks: self.inner.locks.statistics(),
            deadlocks: self.inner.detector.statistics(),
            versions: self.inner.versions.statistics(),
            page_cache: self.inner.pages.cache_stats(),
            wal: self.inner.wal.stats(),
        }
    }

    /// Close: roll back whatever is still active, checkpoint, flush, and
    /// release resources in reverse construction order.
    pub fn close(&self) -> DocumentResult<()> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(path = %self.inner.path.display(), "closing database");

        // Background services first so nothing races the teardown
        self.maintenance.stop();
        self.deadlock_service.stop();
        self.coordinator_service.stop();

        let active: Vec<Arc<TransactionInner>> = {
            let transactions = self.inner.transactions.lock().unwrap();
            transactions.values().cloned().collect()
        };
        for tx in active {
            if let Err(e) = tx.rollback() {
                tracing::warn!(tx = tx.id(), error = %e, "rollback during close failed");
            }
        }

        self.inner.checkpoints.create_checkpoint(Vec::new())?;
        self.inner.pages.flush()?;
        self.inner.data_engine.sync();

        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.data_engine.close()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "error while closing database");
        }
    }
}

fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".wal");
    PathBuf::from(os)
}

fn coordinator_log_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".2pc");
    PathBuf::from(os)
}
