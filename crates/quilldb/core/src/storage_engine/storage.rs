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

// Storage engine module
// A durable byte sequence over a single file, accessed by position. Reads may
// run concurrently; appends and positional writes are serialized through a
// single writer lock. Positions handed out by append become durable only
// after sync().

use std::fs::{File, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::storage_engine::lib::{StorageError, StorageResult};

struct EngineState {
    /// The backing file; None once the engine has been closed
    file: Option<File>,
    /// Current length of the file, which is also the append cursor
    len: u64,
}

/// StorageEngine owns one on-disk file and exposes positional reads,
/// serialized appends and page-aligned rewrites to the layers above it.
pub struct StorageEngine {
    path: PathBuf,
    state: RwLock<EngineState>,
}

impl StorageEngine {
    /// Create or open the file at `path`
    pub fn open<P: AsRef<Path>>(path: P, direct_io: bool) -> StorageResult<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        #[cfg(target_os = "linux")]
        if direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct_io;

        let file = options.open(path.as_ref())?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(EngineState { file: Some(file), len }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `len` bytes starting at `pos`.
    ///
    /// Returns an empty buffer when `pos` is at or past the end of the file,
    /// and fewer bytes than requested when the read crosses the end.
    pub fn read(&self, pos: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.read().unwrap();
        let file = state.file.as_ref().ok_or_else(|| self.closed())?;

        if pos >= state.len || len == 0 {
            return Ok(Vec::new());
        }

        let available = (state.len - pos).min(len as u64) as usize;
        let mut buffer = vec![0u8; available];
        file.read_exact_at(&mut buffer, pos)?;
        Ok(buffer)
    }

    /// Appends `bytes` atomically at the end of the file and returns the
    /// pre-append length, i.e. the position the bytes were written at.
    pub fn append(&self, bytes: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write().unwrap();
        let pos = state.len;
        let file = state.file.as_ref().ok_or_else(|| self.closed())?;

        file.write_all_at(bytes, pos)?;
        state.len = pos + bytes.len() as u64;
        Ok(pos)
    }

    /// Rewrites `bytes` at `pos`. Used by the page manager for page-aligned
    /// writes; never extends the append cursor past the written region.
    pub fn write_at(&self, pos: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let file = state.file.as_ref().ok_or_else(|| self.closed())?;

        file.write_all_at(bytes, pos)?;
        let end = pos + bytes.len() as u64;
        if end > state.len {
            state.len = end;
        }
        Ok(())
    }

    /// Flush buffered writes to the operating system
    pub fn flush(&self) -> StorageResult<()> {
        let state = self.state.read().unwrap();
        let file = state.file.as_ref().ok_or_else(|| self.closed())?;
        (&mut &*file).flush()?;
        Ok(())
    }

    /// Force data to stable storage. Reports failure instead of raising so
    /// callers can decide whether a failed sync is fatal.
    pub fn sync(&self) -> bool {
        let state = self.state.read().unwrap();
        match state.file.as_ref() {
            Some(file) => file.sync_all().is_ok(),
            None => false,
        }
    }

    /// Truncate (or extend with zeros) the file to `size` bytes
    pub fn truncate(&self, size: u64) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let file = state.file.as_ref().ok_or_else(|| self.closed())?;
        file.set_len(size)?;
        state.len = size;
        Ok(())
    }

    /// Current file size in bytes
    pub fn size(&self) -> u64 {
        self.state.read().unwrap().len
    }

    /// Whether the engine still holds its file handle
    pub fn is_open(&self) -> bool {
        self.state.read().unwrap().file.is_some()
    }

    /// Sync and drop the file handle; subsequent operations fail with a
    /// closed-handle error.
    pub fn close(&self) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(file) = state.file.take() {
            let _ = file.sync_all();
        }
        Ok(())
    }

    fn closed(&self) -> StorageError {
        StorageError::Closed(format!("storage engine for {}", self.path.display()))
    }
}

impl crate::storage_engine::lib::Flushable for StorageEngine {
    fn flush(&self) -> StorageResult<()> {
        StorageEngine::flush(self)
    }
}
