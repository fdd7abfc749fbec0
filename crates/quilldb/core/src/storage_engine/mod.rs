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

// Storage Engine Module
// The transactional storage stack: byte store, paged file, write-ahead log,
// checkpointing and recovery, locking with deadlock detection, version
// chains, transactions and the two-phase commit coordinator.

pub mod checkpoint;
pub mod coordinator;
pub mod deadlock_detector;
pub mod file_format;
pub mod lib;
pub mod lock_manager;
pub mod page_manager;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod version_manager;
pub mod wal;

// Public exports
pub use checkpoint::{CheckpointEvent, CheckpointManager, CheckpointPayload};
pub use coordinator::{CoordinatedState, CoordinatorRecoveryService, Participant, ParticipantStatus, TransactionCoordinator};
pub use deadlock_detector::{DeadlockCycle, DeadlockDetectionService, DeadlockDetector, DeadlockStatistics, WaitForEdge};
pub use file_format::{FileHeader, Page, PageHeader, PageId, PageType, PAGE_SIZE};
pub use lib::{calculate_checksum, current_millis, current_ticks, Flushable, StorageConfig, StorageError, StorageResult};
pub use lock_manager::{LockKind, LockManager, LockStatistics};
pub use page_manager::PageManager;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use storage::StorageEngine;
pub use transaction::{format_tx_id, IsolationLevel, Transaction, TransactionContext, TransactionInner, TransactionState};
pub use version_manager::{VersionEntry, VersionManager, VersionStatistics, Visibility};
pub use wal::{WalOp, WalRecord, WalStats, WriteAheadLog};
