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

// Two-phase commit coordinator
// Drives prepare/commit/abort across a set of registered participants with a
// durable decision log. On startup (and periodically) the log is replayed:
// a transaction whose last record is Begin or Prepared is aborted, a Commit
// or Rollback without a completion record is re-driven.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage_engine::lib::{calculate_checksum, current_millis, StorageError, StorageResult};
use crate::storage_engine::storage::StorageEngine;

/// Commit fan-out retry attempts
const COMMIT_ATTEMPTS: u32 = 3;
/// Base backoff between fan-out attempts; doubles per attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// What a participant reports about a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Unknown,
    Prepared,
    Committed,
    Aborted,
}

/// A resource manager taking part in a distributed transaction
pub trait Participant: Send + Sync {
    /// Vote on whether the transaction can commit
    fn prepare(&self, tx_id: &str) -> StorageResult<bool>;

    fn commit(&self, tx_id: &str) -> StorageResult<()>;

    fn abort(&self, tx_id: &str) -> StorageResult<()>;

    fn status(&self, tx_id: &str) -> ParticipantStatus;
}

/// Decisions persisted in the coordinator log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Begin,
    Prepared,
    Commit,
    Rollback,
    /// The commit or abort fan-out finished
    Complete,
}

/// One record in the coordinator's decision log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionRecord {
    decision: Decision,
    tx_id: String,
    /// Participant names; recovery can only re-drive participants that are
    /// re-registered under the same name
    participants: Vec<String>,
    timestamp: i64,
}

/// Coordinator-side view of one distributed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatedState {
    Begun,
    Prepared,
    Committed,
    Aborted,
}

struct CoordinatedTx {
    participants: Vec<String>,
    state: CoordinatedState,
}

/// TransactionCoordinator implements the two-phase commit façade.
pub struct TransactionCoordinator {
    participants: RwLock<HashMap<String, Arc<dyn Participant>>>,
    log: Arc<StorageEngine>,
    /// Serializes decision-log appends
    log_lock: Mutex<()>,
    transactions: Mutex<HashMap<String, CoordinatedTx>>,
}

impl TransactionCoordinator {
    /// Open the coordinator over its decision log file
    pub fn open(log: Arc<StorageEngine>) -> StorageResult<Self> {
        Ok(Self {
            participants: RwLock::new(HashMap::new()),
            log,
            log_lock: Mutex::new(()),
            transactions: Mutex::new(HashMap::new()),
        })
    }

    /// Register a participant under a stable name
    pub fn register_participant(&self, name: &str, participant: Arc<dyn Participant>) {
        self.participants.write().unwrap().insert(name.to_string(), participant);
    }

    /// Start a distributed transaction over the named participants
    pub fn begin(&self, tx_id: &str, participant_names: &[String]) -> StorageResult<()> {
        if participant_names.is_empty() {
            return Err(StorageError::InvalidArgument("a distributed transaction needs at least one participant".to_string()));
        }
        {
            let registered = self.participants.read().unwrap();
            for name in participant_names {
                if !registered.contains_key(name) {
                    return Err(StorageError::NotFound(format!("participant {name}")));
                }
            }
        }

        let mut transactions = self.transactions.lock().unwrap();
        if transactions.contains_key(tx_id) {
            return Err(StorageError::InvalidState(format!("distributed transaction {tx_id} already begun")));
        }

        self.append(Decision::Begin, tx_id, participant_names)?;
        transactions.insert(
            tx_id.to_string(),
            CoordinatedTx {
                participants: participant_names.to_vec(),
                state: CoordinatedState::Begun,
            },
        );
        Ok(())
    }

    /// Phase one: collect votes. All yes persists Prepared and returns true;
    /// any no persists Rollback, aborts everyone and returns false. An
    /// unreachable participant aborts the round with an insufficient-quorum
    /// error.
    pub fn prepare(&self, tx_id: &str) -> StorageResult<bool> {
        let names = self.expect_state(tx_id, CoordinatedState::Begun)?;

        let mut all_yes = true;
        for name in &names {
            match self.participant(name)?.prepare(tx_id) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(tx = tx_id, participant = %name, "participant voted abort");
                    all_yes = false;
                    break;
                }
                Err(e) => {
                    self.append(Decision::Rollback, tx_id, &names)?;
                    self.fan_out_abort(tx_id, &names);
                    self.append(Decision::Complete, tx_id, &names)?;
                    self.set_state(tx_id, CoordinatedState::Aborted);
                    return Err(StorageError::InsufficientQuorum(format!("participant {name} unreachable during prepare: {e}")));
                }
            }
        }

        if all_yes {
            self.append(Decision::Prepared, tx_id, &names)?;
            self.set_state(tx_id, CoordinatedState::Prepared);
            Ok(true)
        } else {
            self.append(Decision::Rollback, tx_id, &names)?;
            self.fan_out_abort(tx_id, &names);
            self.append(Decision::Complete, tx_id, &names)?;
            self.set_state(tx_id, CoordinatedState::Aborted);
            Ok(false)
        }
    }

    /// Phase two: requires a successful prepare. Persists the Commit
    /// decision, fans out with bounded retry, then persists completion.
    pub fn commit(&self, tx_id: &str) -> StorageResult<()> {
        let names = self.expect_state(tx_id, CoordinatedState::Prepared)?;

        self.append(Decision::Commit, tx_id, &names)?;

        if let Err(failed) = self.fan_out_commit(tx_id, &names) {
            // No completion record: recovery will re-drive the commit
            return Err(StorageError::InsufficientQuorum(format!("participant {failed} did not acknowledge commit")));
        }

        self.append(Decision::Complete, tx_id, &names)?;
        self.set_state(tx_id, CoordinatedState::Committed);
        Ok(())
    }

    /// Abort the transaction, fanning abort out to every participant
    pub fn abort(&self, tx_id: &str) -> StorageResult<()> {
        let names = {
            let transactions = self.transactions.lock().unwrap();
            let tx = transactions.get(tx_id).ok_or_else(|| StorageError::NotFound(format!("distributed transaction {tx_id}")))?;
            match tx.state {
                CoordinatedState::Committed => {
                    return Err(StorageError::InvalidState(format!("distributed transaction {tx_id} already committed")));
                }
                CoordinatedState::Aborted => return Ok(()),
                _ => tx.participants.clone(),
            }
        };

        self.append(Decision::Rollback, tx_id, &names)?;
        self.fan_out_abort(tx_id, &names);
        self.append(Decision::Complete, tx_id, &names)?;
        self.set_state(tx_id, CoordinatedState::Aborted);
        Ok(())
    }

    /// Coordinator-side state of a transaction
    pub fn state(&self, tx_id: &str) -> Option<CoordinatedState> {
        self.transactions.lock().unwrap().get(tx_id).map(|tx| tx.state)
    }

    /// Replay the decision log, finishing whatever a crash interrupted.
    ///
    /// Last record Begin or Prepared: abort. Commit without completion:
    /// re-drive the commit. Rollback without completion: re-drive the abort.
    pub fn recover(&self) -> StorageResult<()> {
        let records = self.read_log()?;

        // Last decision per transaction, with completion tracked separately
        let mut last: HashMap<String, DecisionRecord> = HashMap::new();
        let mut completed: HashMap<String, bool> = HashMap::new();
        for record in records {
            match record.decision {
                Decision::Complete => {
                    completed.insert(record.tx_id.clone(), true);
                }
                _ => {
                    completed.insert(record.tx_id.clone(), false);
                    last.insert(record.tx_id.clone(), record);
                }
            }
        }

        for (tx_id, record) in last {
            if completed.get(&tx_id).copied().unwrap_or(false) {
                continue;
            }

            match record.decision {
                Decision::Begin | Decision::Prepared => {
                    tracing::info!(tx = %tx_id, "aborting in-doubt distributed transaction");
                    self.fan_out_abort(&tx_id, &record.participants);
                    self.append(Decision::Rollback, &tx_id, &record.participants)?;
                    self.append(Decision::Complete, &tx_id, &record.participants)?;
                    self.set_state(&tx_id, CoordinatedState::Aborted);
                }
                Decision::Commit => {
                    tracing::info!(tx = %tx_id, "re-driving interrupted commit");
                    if self.fan_out_commit(&tx_id, &record.participants).is_ok() {
                        self.append(Decision::Complete, &tx_id, &record.participants)?;
                        self.set_state(&tx_id, CoordinatedState::Committed);
                    }
                }
                Decision::Rollback => {
                    tracing::info!(tx = %tx_id, "re-driving interrupted abort");
                    self.fan_out_abort(&tx_id, &record.participants);
                    self.append(Decision::Complete, &tx_id, &record.participants)?;
                    self.set_state(&tx_id, CoordinatedState::Aborted);
                }
                Decision::Complete => {}
            }
        }

        Ok(())
    }

    fn fan_out_commit(&self, tx_id: &str, names: &[String]) -> Result<(), String> {
        for name in names {
            let Ok(participant) = self.participant(name) else {
                tracing::warn!(tx = tx_id, participant = %name, "participant not registered; cannot re-drive");
                return Err(name.clone());
            };

            let mut delivered = false;
            let mut backoff = RETRY_BACKOFF;
            for attempt in 0..COMMIT_ATTEMPTS {
                match participant.commit(tx_id) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(tx = tx_id, participant = %name, attempt, error = %e, "commit delivery failed");
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
            if !delivered {
                return Err(name.clone());
            }
        }
        Ok(())
    }

    fn fan_out_abort(&self, tx_id: &str, names: &[String]) {
        for name in names {
            if let Ok(participant) = self.participant(name) {
                if let Err(e) = participant.abort(tx_id) {
                    tracing::warn!(tx = tx_id, participant = %name, error = %e, "abort delivery failed");
                }
            }
        }
    }

    fn participant(&self, name: &str) -> StorageResult<Arc<dyn Participant>> {
        self.participants.read().unwrap().get(name).cloned().ok_or_else(|| StorageError::NotFound(format!("participant {name}")))
    }

    fn expect_state(&self, tx_id: &str, expected: CoordinatedState) -> StorageResult<Vec<String>> {
        let transactions = self.transactions.lock().unwrap();
        let tx = transactions.get(tx_id).ok_or_else(|| StorageError::NotFound(format!("distributed transaction {tx_id}")))?;
        if tx.state != expected {
            return Err(StorageError::InvalidState(format!("distributed transaction {tx_id} is {:?}, expected {expected:?}", tx.state)));
        }
        Ok(tx.participants.clone())
    }

    fn set_state(&self, tx_id: &str, state: CoordinatedState) {
        let mut transactions = self.transactions.lock().unwrap();
        match transactions.get_mut(tx_id) {
            Some(tx) => tx.state = state,
            None => {
                // Reconstructed from the log during recovery
                transactions.insert(
                    tx_id.to_string(),
                    CoordinatedTx {
                        participants: Vec::new(),
                        state,
                    },
                );
            }
        }
    }

    /// Append one decision, framed and checksummed, fsynced before return
    fn append(&self, decision: Decision, tx_id: &str, participants: &[String]) -> StorageResult<()> {
        let _guard = self.log_lock.lock().unwrap();

        let record = DecisionRecord {
            decision,
            tx_id: tx_id.to_string(),
            participants: participants.to_vec(),
            timestamp: current_millis() as i64,
        };
        let body = bincode::serialize(&record).map_err(|e| StorageError::CorruptRecord(format!("decision record encode: {e}")))?;

        let mut framed = Vec::with_capacity(8 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        framed.extend_from_slice(&calculate_checksum(&body).to_le_bytes());

        self.log.append(&framed)?;
        if !self.log.sync() {
            return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "decision log fsync failed")));
        }
        Ok(())
    }

    fn read_log(&self) -> StorageResult<Vec<DecisionRecord>> {
        let mut records = Vec::new();
        let mut offset = 0u64;
        let size = self.log.size();

        while offset + 4 <= size {
            let len_bytes = self.log.read(offset, 4)?;
            if len_bytes.len() < 4 {
                break;
            }
            let body_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
            if body_len == 0 || offset + 4 + body_len as u64 + 4 > size {
                break;
            }

            let body = self.log.read(offset + 4, body_len)?;
            let checksum_bytes = self.log.read(offset + 4 + body_len as u64, 4)?;
            if checksum_bytes.len() < 4 {
                break;
            }
            let stored = u32::from_le_bytes([checksum_bytes[0], checksum_bytes[1], checksum_bytes[2], checksum_bytes[3]]);
            if stored != calculate_checksum(&body) {
                break;
            }

            match bincode::deserialize::<DecisionRecord>(&body) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }

            offset += 4 + body_len as u64 + 4;
        }

        Ok(records)
    }
}

/// Periodic re-drive of forgotten decisions, owned by the database
pub struct CoordinatorRecoveryService {
    coordinator: Arc<TransactionCoordinator>,
    running: Arc<std::sync::atomic::AtomicBool>,
    interval: Duration,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CoordinatorRecoveryService {
    pub fn new(coordinator: Arc<TransactionCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            interval,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        use std::sync::atomic::Ordering;
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let coordinator = self.coordinator.clone();
        let running = self.running.clone();
        let interval = self.interval;

        let handle = std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Err(e) = coordinator.recover() {
                    tracing::warn!(error = %e, "coordinator recovery pass failed");
                }
                std::thread::sleep(interval);
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        use std::sync::atomic::Ordering;
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CoordinatorRecoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}
