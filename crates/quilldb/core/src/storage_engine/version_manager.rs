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

//! Version chains for read visibility
//!
//! Each key (`<collection>/<id>`) owns an ordered chain of committed
//! versions: the document or a tombstone, the creating transaction, and the
//! commit timestamp. Visibility is keyed on the reader's isolation level.
//! Versions are inserted at transaction apply time, so a chain only ever
//! holds committed entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::document::Document;
use crate::storage_engine::lib::current_ticks;
use crate::storage_engine::transaction::IsolationLevel;

/// One link in a version chain
#[derive(Debug, Clone)]
pub struct VersionEntry {
    /// The document, or None for a tombstone
    pub document: Option<Document>,
    /// Per-document version counter at this point
    pub version: u64,
    /// Transaction that committed this version
    pub tx_id: String,
    /// Logical commit timestamp
    pub commit_time: u64,
}

impl VersionEntry {
    pub fn is_tombstone(&self) -> bool {
        self.document.is_none()
    }
}

/// What the chain has to say about a key for a given reader
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    /// The chain holds no entry visible to the reader
    NoEntry,
    /// The visible entry is a tombstone: the key is deleted
    Deleted,
    /// The visible document
    Document(Document),
}

/// Statistics about the version chains
#[derive(Debug, Clone, Default)]
pub struct VersionStatistics {
    pub chains: usize,
    pub versions: usize,
    pub average_chain_length: f64,
}

type Chain = Arc<RwLock<Vec<VersionEntry>>>;

/// VersionManager owns every chain plus the logical clock that orders
/// transaction starts against commits.
pub struct VersionManager {
    /// Each chain has its own reader-writer lock
    chains: RwLock<HashMap<String, Chain>>,
    /// Taken by the cleanup pass so it never overlaps itself
    cleanup_lock: Mutex<()>,
    /// Logical clock; strictly increasing across starts and commits
    timestamp_counter: AtomicU64,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            cleanup_lock: Mutex::new(()),
            timestamp_counter: AtomicU64::new(current_ticks()),
        }
    }

    /// Next logical timestamp; used for transaction starts and commits
    pub fn next_timestamp(&self) -> u64 {
        self.timestamp_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append a committed version to the key's chain
    pub fn add_version(&self, key: &str, document: Document, tx_id: &str, commit_time: u64) {
        let chain = self.chain_for(key);
        let mut entries = chain.write();
        let version = document.version;
        entries.push(VersionEntry {
            document: Some(document),
            version,
            tx_id: tx_id.to_string(),
            commit_time,
        });
    }

    /// Append a tombstone to the key's chain
    pub fn mark_deleted(&self, key: &str, tx_id: &str, commit_time: u64) {
        let chain = self.chain_for(key);
        let mut entries = chain.write();
        let version = entries.last().map(|e| e.version + 1).unwrap_or(1);
        entries.push(VersionEntry {
            document: None,
            version,
            tx_id: tx_id.to_string(),
            commit_time,
        });
    }

    /// Resolve the version visible to a reader.
    ///
    /// Own committed writes always win. Otherwise: ReadUncommitted and
    /// ReadCommitted see the most recent committed version; RepeatableRead,
    /// Serializable and Snapshot see the most recent version with
    /// `commit_time <= tx_start`.
    pub fn visible_version(&self, key: &str, tx_id: &str, tx_start: u64, isolation: IsolationLevel) -> Visibility {
        let chain = {
            let chains = self.chains.read();
            match chains.get(key) {
                Some(chain) => chain.clone(),
                None => return Visibility::NoEntry,
            }
        };

        let entries = chain.read();
        if entries.is_empty() {
            return Visibility::NoEntry;
        }

        if let Some(own) = entries.iter().rev().find(|e| e.tx_id == tx_id) {
            return Self::materialize(own);
        }

        let candidate = match isolation {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => entries.last(),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable | IsolationLevel::Snapshot => entries.iter().rev().find(|e| e.commit_time <= tx_start),
        };

        match candidate {
            Some(entry) => Self::materialize(entry),
            None => Visibility::NoEntry,
        }
    }

    fn materialize(entry: &VersionEntry) -> Visibility {
        match &entry.document {
            Some(document) => Visibility::Document(document.clone()),
            None => Visibility::Deleted,
        }
    }

    /// Remove versions no active transaction can still see. The retention
    /// floor is the earliest start time across active transactions; the
    /// latest version of each chain is always kept, except that a chain
    /// whose only remnant is an old tombstone is dropped whole.
    pub fn cleanup(&self, active_starts: &[u64]) -> usize {
        let _guard = self.cleanup_lock.lock();

        let floor = active_starts.iter().copied().min().unwrap_or(u64::MAX);
        let mut removed = 0;
        let mut empty_keys = Vec::new();

        let chains = self.chains.read();
        for (key, chain) in chains.iter() {
            let mut entries = chain.write();
            let len = entries.len();
            if len > 1 {
                let keep_from = entries.len() - 1;
                let mut index = 0;
                entries.retain(|entry| {
                    let keep = index == keep_from || entry.commit_time >= floor;
                    index += 1;
                    keep
                });
                removed += len - entries.len();
            }

            if entries.len() == 1 && entries[0].is_tombstone() && entries[0].commit_time < floor {
                removed += 1;
                entries.clear();
            }
            if entries.is_empty() {
                empty_keys.push(key.clone());
            }
        }
        drop(chains);

        if !empty_keys.is_empty() {
            let mut chains = self.chains.write();
            for key in empty_keys {
                let still_empty = chains.get(&key).map(|c| c.read().is_empty()).unwrap_or(false);
                if still_empty {
                    chains.remove(&key);
                }
            }
        }

        removed
    }

    /// Number of entries in one chain, for tests and stats
    pub fn chain_length(&self, key: &str) -> usize {
        self.chains.read().get(key).map(|c| c.read().len()).unwrap_or(0)
    }

    pub fn statistics(&self) -> VersionStatistics {
        let chains = self.chains.read();
        let count = chains.len();
        let versions: usize = chains.values().map(|c| c.read().len()).sum();
        VersionStatistics {
            chains: count,
            versions,
            average_chain_length: if count > 0 { versions as f64 / count as f64 } else { 0.0 },
        }
    }

    fn chain_for(&self, key: &str) -> Chain {
        {
            let chains = self.chains.read();
            if let Some(chain) = chains.get(key) {
                return chain.clone();
            }
        }
        let mut chains = self.chains.write();
        chains.entry(key.to_string()).or_insert_with(|| Arc::new(RwLock::new(Vec::new()))).clone()
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}
