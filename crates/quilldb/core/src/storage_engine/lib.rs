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

// Common types and utilities for the storage engine

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Error types specific to the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handle is closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt page {0}: checksum mismatch")]
    CorruptPage(u64),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock timeout on resource {0}")]
    LockTimeout(String),

    #[error("transaction {0} was chosen as deadlock victim")]
    DeadlockVictim(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient quorum: {0}")]
    InsufficientQuorum(String),
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the database file; the WAL lives next to it with a `.wal` suffix
    pub path: PathBuf,
    /// Size of each page in bytes
    pub page_size: usize,
    /// Degree of the primary B-tree
    pub btree_degree: usize,
    /// Maximum number of pages to keep in the page cache
    pub cache_capacity: usize,
    /// How long a single lock acquisition may wait
    pub lock_timeout: Duration,
    /// Idle timeout after which a transaction is aborted
    pub transaction_timeout: Duration,
    /// How often the deadlock detector scans the wait-for graph
    pub deadlock_detection_interval: Duration,
    /// How often a checkpoint is taken regardless of WAL growth
    pub checkpoint_interval: Duration,
    /// WAL size past which a checkpoint is considered needed
    pub wal_segment_limit: u64,
    /// Whether to use direct I/O (bypassing filesystem cache)
    pub direct_io: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./quill.db"),
            page_size: 4096,
            btree_degree: 64,
            cache_capacity: 1024,
            lock_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(300),
            deadlock_detection_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(60),
            wal_segment_limit: 64 * 1024 * 1024,
            direct_io: false,
        }
    }
}

/// Current time in UTC milliseconds since the Unix epoch
pub fn current_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Monotonic-ish tick counter used in transaction identifiers
pub fn current_ticks() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// Calculate CRC32 checksum for data integrity
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Trait for components that need periodic flushing to disk
pub trait Flushable {
    /// Flush any in-memory data to disk
    fn flush(&self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.btree_degree, 64);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.deadlock_detection_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_checksum_is_stable() {
        let data = b"quilldb";
        assert_eq!(calculate_checksum(data), calculate_checksum(data));
        assert_ne!(calculate_checksum(data), calculate_checksum(b"quilldc"));
    }

    #[test]
    fn test_timestamps_advance() {
        let a = current_ticks();
        let b = current_ticks();
        assert!(b >= a);
    }
}
