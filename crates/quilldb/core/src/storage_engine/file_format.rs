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

// File format module
// On-disk layout of the paged data file: fixed 4 KiB pages, each with a
// checksummed header, and a reserved header page at page id 0 carrying the
// file magic and format version.

use std::convert::TryInto;

use crate::storage_engine::lib::{StorageError, StorageResult, calculate_checksum};

/// Magic number identifying a QuillDB data file (QLDB)
pub const FILE_MAGIC: [u8; 4] = [0x51, 0x4C, 0x44, 0x42];
/// Current format version
pub const FORMAT_VERSION: u32 = 1;
/// Fixed page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Unique identifier for a page within the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Byte offset of this page inside the data file
    pub fn offset(&self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Types of pages in the storage system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// Free (unused) page
    Free = 0,
    /// File header page (page id 0)
    Header = 1,
    /// Document data page
    Data = 2,
    /// Index page
    Index = 3,
    /// Continuation of an oversized payload
    Overflow = 4,
}

impl From<u8> for PageType {
    fn from(value: u8) -> Self {
        match value {
            1 => PageType::Header,
            2 => PageType::Data,
            3 => PageType::Index,
            4 => PageType::Overflow,
            _ => PageType::Free,
        }
    }
}

/// Page header structure (fixed size, stored at the front of every page)
#[derive(Debug, Clone)]
pub struct PageHeader {
    /// Identifier of the page; stable for the page's lifetime
    pub page_id: PageId,
    /// Type of page
    pub page_type: PageType,
    /// Checksum over the payload
    pub checksum: u32,
    /// Number of meaningful payload bytes
    pub payload_length: u16,
    /// LSN of the last WAL record applied to this page
    pub lsn: u64,
}

impl PageHeader {
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            checksum: 0,
            payload_length: 0,
            lsn: 0,
        }
    }

    /// Size of the header in bytes
    pub const fn size() -> usize {
        // page_id(8) + page_type(1) + payload_length(2) + checksum(4) + lsn(8) = 23
        // Aligned to 32 bytes
        32
    }

    /// Serialize the header into the front of `buffer`
    pub fn serialize(&self, buffer: &mut [u8]) -> StorageResult<()> {
        if buffer.len() < Self::size() {
            return Err(StorageError::InvalidArgument("buffer too small for page header".to_string()));
        }

        buffer[0..8].copy_from_slice(&self.page_id.0.to_le_bytes());
        buffer[8] = self.page_type as u8;
        buffer[9..11].copy_from_slice(&self.payload_length.to_le_bytes());
        buffer[11..15].copy_from_slice(&self.checksum.to_le_bytes());
        buffer[15..23].copy_from_slice(&self.lsn.to_le_bytes());
        buffer[23..Self::size()].fill(0);

        Ok(())
    }

    /// Deserialize the header from bytes
    pub fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < Self::size() {
            return Err(StorageError::CorruptRecord("truncated page header".to_string()));
        }

        let page_id = PageId(u64::from_le_bytes(buffer[0..8].try_into().map_err(|_| StorageError::CorruptRecord("invalid page_id bytes".to_string()))?));
        let page_type = PageType::from(buffer[8]);
        let payload_length = u16::from_le_bytes(buffer[9..11].try_into().map_err(|_| StorageError::CorruptRecord("invalid payload_length bytes".to_string()))?);
        let checksum = u32::from_le_bytes(buffer[11..15].try_into().map_err(|_| StorageError::CorruptRecord("invalid checksum bytes".to_string()))?);
        let lsn = u64::from_le_bytes(buffer[15..23].try_into().map_err(|_| StorageError::CorruptRecord("invalid lsn bytes".to_string()))?);

        Ok(Self {
            page_id,
            page_type,
            checksum,
            payload_length,
            lsn,
        })
    }
}

/// A fixed-size page: header plus opaque payload bytes
#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    /// Payload buffer, always `PAGE_SIZE - PageHeader::size()` bytes
    pub payload: Vec<u8>,
}

impl Page {
    /// Number of payload bytes a page can carry
    pub const fn capacity() -> usize {
        PAGE_SIZE - PageHeader::size()
    }

    /// Create an empty page of the given type
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            header: PageHeader::new(page_id, page_type),
            payload: vec![0; Self::capacity()],
        }
    }

    /// Identifier of this page
    pub fn id(&self) -> PageId {
        self.header.page_id
    }

    /// The meaningful slice of the payload
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.header.payload_length as usize]
    }

    /// Replace the payload with `data`, updating length and checksum
    pub fn set_data(&mut self, data: &[u8]) -> StorageResult<()> {
        if data.len() > Self::capacity() {
            return Err(StorageError::InvalidArgument(format!("payload of {} bytes exceeds page capacity {}", data.len(), Self::capacity())));
        }

        self.payload.fill(0);
        self.payload[..data.len()].copy_from_slice(data);
        self.header.payload_length = data.len() as u16;
        self.update_checksum();
        Ok(())
    }

    /// Calculate the checksum of the meaningful payload
    pub fn calculate_checksum(&self) -> u32 {
        calculate_checksum(self.data())
    }

    /// Update the page checksum
    pub fn update_checksum(&mut self) {
        self.header.checksum = self.calculate_checksum();
    }

    /// Verify the page checksum
    pub fn verify_checksum(&self) -> bool {
        self.header.checksum == self.calculate_checksum()
    }

    /// Serialize the full page to a `PAGE_SIZE` buffer
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let mut buffer = vec![0u8; PAGE_SIZE];
        self.header.serialize(&mut buffer[..PageHeader::size()])?;
        buffer[PageHeader::size()..].copy_from_slice(&self.payload);
        Ok(buffer)
    }

    /// Deserialize a full page from a `PAGE_SIZE` buffer
    pub fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < PAGE_SIZE {
            return Err(StorageError::CorruptRecord(format!("page buffer of {} bytes, expected {}", buffer.len(), PAGE_SIZE)));
        }

        let header = PageHeader::deserialize(&buffer[..PageHeader::size()])?;
        let payload = buffer[PageHeader::size()..PAGE_SIZE].to_vec();

        Ok(Self { header, payload })
    }
}

/// Contents of the reserved header page (page id 0)
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub page_size: u32,
    /// Page id of the root collection directory, 0 when absent
    pub root_collection_page: u64,
}

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            page_size,
            root_collection_page: 0,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; 20];
        buffer[0..4].copy_from_slice(&self.magic);
        buffer[4..8].copy_from_slice(&self.version.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buffer[12..20].copy_from_slice(&self.root_collection_page.to_le_bytes());
        buffer
    }

    pub fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < 20 {
            return Err(StorageError::CorruptRecord("truncated file header".to_string()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buffer[0..4]);
        if magic != FILE_MAGIC {
            return Err(StorageError::CorruptRecord("not a QuillDB data file".to_string()));
        }

        let version = u32::from_le_bytes(buffer[4..8].try_into().map_err(|_| StorageError::CorruptRecord("invalid version bytes".to_string()))?);
        if version > FORMAT_VERSION {
            return Err(StorageError::CorruptRecord(format!("unsupported format version {version}")));
        }

        let page_size = u32::from_le_bytes(buffer[8..12].try_into().map_err(|_| StorageError::CorruptRecord("invalid page_size bytes".to_string()))?);
        let root_collection_page = u64::from_le_bytes(buffer[12..20].try_into().map_err(|_| StorageError::CorruptRecord("invalid root page bytes".to_string()))?);

        Ok(Self {
            magic,
            version,
            page_size,
            root_collection_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_roundtrip() {
        let mut header = PageHeader::new(PageId(42), PageType::Data);
        header.payload_length = 128;
        header.checksum = 0xDEADBEEF;
        header.lsn = 7;

        let mut buffer = vec![0u8; PageHeader::size()];
        header.serialize(&mut buffer).unwrap();
        let restored = PageHeader::deserialize(&buffer).unwrap();

        assert_eq!(restored.page_id, PageId(42));
        assert_eq!(restored.page_type, PageType::Data);
        assert_eq!(restored.payload_length, 128);
        assert_eq!(restored.checksum, 0xDEADBEEF);
        assert_eq!(restored.lsn, 7);
    }

    #[test]
    fn test_page_checksum_matches_payload() {
        let mut page = Page::new(PageId(3), PageType::Data);
        page.set_data(b"document bytes").unwrap();

        assert!(page.verify_checksum());
        page.payload[0] ^= 0xFF;
        assert!(!page.verify_checksum());
    }

    #[test]
    fn test_page_roundtrip() {
        let mut page = Page::new(PageId(9), PageType::Index);
        page.set_data(&[5u8; 100]).unwrap();
        page.header.lsn = 12;

        let bytes = page.serialize().unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);

        let restored = Page::deserialize(&bytes).unwrap();
        assert_eq!(restored.id(), PageId(9));
        assert_eq!(restored.header.page_type, PageType::Index);
        assert_eq!(restored.header.lsn, 12);
        assert_eq!(restored.data(), &[5u8; 100]);
        assert!(restored.verify_checksum());
    }

    #[test]
    fn test_payload_capacity_enforced() {
        let mut page = Page::new(PageId(1), PageType::Data);
        let oversized = vec![0u8; Page::capacity() + 1];
        assert!(matches!(page.set_data(&oversized), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader::new(4096);
        let bytes = header.serialize();
        let restored = FileHeader::deserialize(&bytes).unwrap();

        assert_eq!(restored.magic, FILE_MAGIC);
        assert_eq!(restored.version, FORMAT_VERSION);
        assert_eq!(restored.page_size, 4096);
    }

    #[test]
    fn test_file_header_rejects_bad_magic() {
        let mut bytes = FileHeader::new(4096).serialize();
        bytes[0] = b'X';
        assert!(FileHeader::deserialize(&bytes).is_err());
    }
}
