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

// Lock management module
// Per-resource read/write locks with a FIFO wait queue. Waiters park on a
// completion slot (mutex + condvar) that a release resolves with Granted or
// a cancellation resolves with Cancelled; timeouts return false. A pending
// write request blocks later read requests so writers cannot starve. Wait-for
// edges are added to the deadlock detector before parking and removed on
// grant, timeout or cancellation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::storage_engine::deadlock_detector::DeadlockDetector;
use crate::storage_engine::lib::{StorageError, StorageResult};

/// Kind of lock requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// How a parked wait was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Granted,
    Cancelled,
}

/// Completion slot a waiter parks on
struct WaitSlot {
    state: Mutex<Option<WaitOutcome>>,
    cv: Condvar,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn resolve(&self, outcome: WaitOutcome) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(outcome);
            self.cv.notify_all();
        }
    }
}

struct WaitingRequest {
    tx_id: String,
    kind: LockKind,
    is_upgrade: bool,
    slot: Arc<WaitSlot>,
}

/// State of one lockable resource
#[derive(Default)]
struct ResourceLock {
    readers: HashSet<String>,
    writer: Option<String>,
    queue: VecDeque<WaitingRequest>,
}

impl ResourceLock {
    fn is_unheld(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.queue.is_empty()
    }

    fn holders(&self) -> Vec<String> {
        let mut holders: Vec<String> = self.readers.iter().cloned().collect();
        if let Some(writer) = &self.writer {
            holders.push(writer.clone());
        }
        holders
    }

    fn has_pending_write(&self) -> bool {
        self.queue.iter().any(|r| r.kind == LockKind::Write)
    }
}

struct LockTables {
    resources: HashMap<String, ResourceLock>,
    /// tx -> resources it holds
    held: HashMap<String, HashSet<String>>,
}

/// Statistics about the lock manager
#[derive(Debug, Clone, Default)]
pub struct LockStatistics {
    pub granted: usize,
    pub waiting: usize,
    pub resources: usize,
    pub holders: usize,
}

/// LockManager mediates every resource lock in the database.
pub struct LockManager {
    tables: Mutex<LockTables>,
    detector: Arc<DeadlockDetector>,
    default_timeout: Duration,
}

impl LockManager {
    pub fn new(detector: Arc<DeadlockDetector>, default_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(LockTables {
                resources: HashMap::new(),
                held: HashMap::new(),
            }),
            detector,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Acquire a read lock on `resource`.
    ///
    /// Granted immediately when there is no writer and no queued write, when
    /// the transaction is itself the writer, or when it already holds the
    /// read lock. Otherwise the request queues.
    pub fn acquire_read(&self, tx_id: &str, resource: &str, timeout: Duration) -> StorageResult<bool> {
        let (slot, holders) = {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables.resources.entry(resource.to_string()).or_default();

            if entry.writer.as_deref() == Some(tx_id) {
                // Already the writer; the read is implied
                tables.held.entry(tx_id.to_string()).or_default().insert(resource.to_string());
                return Ok(true);
            }

            if entry.readers.contains(tx_id) || (entry.writer.is_none() && !entry.has_pending_write()) {
                entry.readers.insert(tx_id.to_string());
                tables.held.entry(tx_id.to_string()).or_default().insert(resource.to_string());
                return Ok(true);
            }

            let slot = WaitSlot::new();
            let holders = entry.holders();
            entry.queue.push_back(WaitingRequest {
                tx_id: tx_id.to_string(),
                kind: LockKind::Read,
                is_upgrade: false,
                slot: slot.clone(),
            });
            (slot, holders)
        };

        self.detector.add_wait_edges(tx_id, &holders, resource);
        self.wait(tx_id, resource, slot, timeout)
    }

    /// Acquire a write lock on `resource`.
    ///
    /// Granted immediately when the resource is unheld, when the transaction
    /// is the sole reader and no writer exists (in-place upgrade), or when
    /// it is already the writer.
    pub fn acquire_write(&self, tx_id: &str, resource: &str, timeout: Duration) -> StorageResult<bool> {
        let (slot, holders) = {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables.resources.entry(resource.to_string()).or_default();

            if entry.writer.as_deref() == Some(tx_id) {
                return Ok(true);
            }

            let sole_reader = entry.writer.is_none() && entry.readers.len() == 1 && entry.readers.contains(tx_id);
            if sole_reader || (entry.writer.is_none() && entry.readers.is_empty()) {
                entry.readers.remove(tx_id);
                entry.writer = Some(tx_id.to_string());
                tables.held.entry(tx_id.to_string()).or_default().insert(resource.to_string());
                return Ok(true);
            }

            let is_upgrade = entry.readers.contains(tx_id);
            let slot = WaitSlot::new();
            let holders: Vec<String> = entry.holders().into_iter().filter(|h| h != tx_id).collect();
            entry.queue.push_back(WaitingRequest {
                tx_id: tx_id.to_string(),
                kind: LockKind::Write,
                is_upgrade,
                slot: slot.clone(),
            });
            (slot, holders)
        };

        self.detector.add_wait_edges(tx_id, &holders, resource);
        self.wait(tx_id, resource, slot, timeout)
    }

    /// Upgrade an already-held read lock to a write lock. An upgrade request
    /// in the queue blocks new readers the same way a plain write does.
    pub fn upgrade(&self, tx_id: &str, resource: &str, timeout: Duration) -> StorageResult<bool> {
        {
            let tables = self.tables.lock().unwrap();
            let holds_read = tables.resources.get(resource).map(|entry| entry.readers.contains(tx_id)).unwrap_or(false);
            if !holds_read {
                return Err(StorageError::InvalidState(format!("transaction {tx_id} holds no read lock on {resource} to upgrade")));
            }
        }
        self.acquire_write(tx_id, resource, timeout)
    }

    /// Lock a synthetic resource representing an inclusive key interval,
    /// used for serializable scans.
    pub fn acquire_range(&self, tx_id: &str, collection: &str, low: &str, high: &str, kind: LockKind, timeout: Duration) -> StorageResult<bool> {
        let resource = Self::range_resource(collection, low, high);
        match kind {
            LockKind::Read => self.acquire_read(tx_id, &resource, timeout),
            LockKind::Write => self.acquire_write(tx_id, &resource, timeout),
        }
    }

    /// Resource id for a range lock
    pub fn range_resource(collection: &str, low: &str, high: &str) -> String {
        format!("{collection}:range:{low}:{high}")
    }

    /// Release one resource held by `tx_id`, then drain the wait queue in
    /// order, granting whatever prefix became compatible.
    pub fn release(&self, tx_id: &str, resource: &str) {
        let mut tables = self.tables.lock().unwrap();

        if let Some(entry) = tables.resources.get_mut(resource) {
            entry.readers.remove(tx_id);
            if entry.writer.as_deref() == Some(tx_id) {
                entry.writer = None;
            }
        }
        if let Some(held) = tables.held.get_mut(tx_id) {
            held.remove(resource);
            if held.is_empty() {
                tables.held.remove(tx_id);
            }
        }

        self.drain_queue(&mut tables, resource);
        if tables.resources.get(resource).map(|e| e.is_unheld()).unwrap_or(false) {
            tables.resources.remove(resource);
        }
    }

    /// Release every resource `tx_id` holds and forget it in the detector
    pub fn release_all(&self, tx_id: &str) {
        let resources: Vec<String> = {
            let tables = self.tables.lock().unwrap();
            tables.held.get(tx_id).map(|set| set.iter().cloned().collect()).unwrap_or_default()
        };

        for resource in resources {
            self.release(tx_id, &resource);
        }

        self.detector.remove_transaction(tx_id);
    }

    /// Cancel every queued wait of `tx_id`, resolving its slots with a
    /// cancellation result. Called when the transaction aborts.
    pub fn cancel_waits(&self, tx_id: &str) {
        let mut affected = Vec::new();
        {
            let mut tables = self.tables.lock().unwrap();
            for (resource, entry) in tables.resources.iter_mut() {
                let mut removed = false;
                entry.queue.retain(|request| {
                    if request.tx_id == tx_id {
                        request.slot.resolve(WaitOutcome::Cancelled);
                        removed = true;
                        false
                    } else {
                        true
                    }
                });
                if removed {
                    affected.push(resource.clone());
                }
            }
            // Removing a queued writer can unblock the readers behind it
            for resource in &affected {
                self.drain_queue(&mut tables, resource);
            }
        }

        self.detector.remove_wait_edges(tx_id);
    }

    /// Resources currently held by `tx_id`
    pub fn locks_held(&self, tx_id: &str) -> Vec<String> {
        let tables = self.tables.lock().unwrap();
        let mut held: Vec<String> = tables.held.get(tx_id).map(|set| set.iter().cloned().collect()).unwrap_or_default();
        held.sort();
        held
    }

    /// Whether any transaction holds `resource`
    pub fn is_locked(&self, resource: &str) -> bool {
        let tables = self.tables.lock().unwrap();
        tables.resources.get(resource).map(|e| !e.readers.is_empty() || e.writer.is_some()).unwrap_or(false)
    }

    pub fn statistics(&self) -> LockStatistics {
        let tables = self.tables.lock().unwrap();
        LockStatistics {
            granted: tables.resources.values().map(|e| e.readers.len() + usize::from(e.writer.is_some())).sum(),
            waiting: tables.resources.values().map(|e| e.queue.len()).sum(),
            resources: tables.resources.len(),
            holders: tables.held.len(),
        }
    }

    /// Grant the longest compatible prefix of the wait queue
    fn drain_queue(&self, tables: &mut LockTables, resource: &str) {
        let mut granted: Vec<(String, Arc<WaitSlot>)> = Vec::new();

        if let Some(entry) = tables.resources.get_mut(resource) {
            loop {
                let Some(front) = entry.queue.front() else {
                    break;
                };

                let grantable = match front.kind {
                    LockKind::Write => {
                        if front.is_upgrade {
                            entry.writer.is_none() && entry.readers.len() == 1 && entry.readers.contains(&front.tx_id)
                        } else {
                            entry.writer.is_none() && entry.readers.is_empty()
                        }
                    }
                    LockKind::Read => entry.writer.is_none(),
                };

                if !grantable {
                    break;
                }

                let request = entry.queue.pop_front().expect("front was just observed");
                match request.kind {
                    LockKind::Write => {
                        entry.readers.remove(&request.tx_id);
                        entry.writer = Some(request.tx_id.clone());
                    }
                    LockKind::Read => {
                        entry.readers.insert(request.tx_id.clone());
                    }
                }
                request.slot.resolve(WaitOutcome::Granted);
                granted.push((request.tx_id, request.slot));
            }
        }

        for (tx_id, _) in &granted {
            tables.held.entry(tx_id.clone()).or_default().insert(resource.to_string());
            self.detector.remove_wait_edges(tx_id);
        }
    }

    /// Park on the slot until granted, cancelled, or timed out
    fn wait(&self, tx_id: &str, resource: &str, slot: Arc<WaitSlot>, timeout: Duration) -> StorageResult<bool> {
        let deadline = Instant::now() + timeout;

        {
            let mut state = slot.state.lock().unwrap();
            while state.is_none() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (next, wait_result) = slot.cv.wait_timeout(state, remaining).unwrap();
                state = next;
                if wait_result.timed_out() && state.is_none() {
                    break;
                }
            }
        }

        // Re-check under the tables lock: a grant may have raced the timeout
        let mut tables = self.tables.lock().unwrap();
        let outcome = *slot.state.lock().unwrap();
        match outcome {
            Some(WaitOutcome::Granted) => {
                drop(tables);
                // A grant can race the edge registration; drop any leftovers
                self.detector.remove_wait_edges(tx_id);
                Ok(true)
            }
            Some(WaitOutcome::Cancelled) => Err(StorageError::TransactionAborted(tx_id.to_string())),
            None => {
                if let Some(entry) = tables.resources.get_mut(resource) {
                    entry.queue.retain(|request| !Arc::ptr_eq(&request.slot, &slot));
                    self.drain_queue(&mut tables, resource);
                }
                drop(tables);
                self.detector.remove_wait_edges(tx_id);
                tracing::debug!(tx = tx_id, resource, "lock wait timed out");
                Ok(false)
            }
        }
    }
}
