//! Summary: Meta page encoding and validation.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The file starts with two meta pages. Commits alternate between them by
//! txid parity and never overwrite the data section the current meta points
//! at, so an interrupted commit leaves the previous state readable.

use crate::concurrent;
use crate::page::{DATA_OFFSET, MAGIC, PAGE_SIZE, VERSION};

/// Database metadata stored in each of the two meta pages.
///
/// Layout (56 bytes, remainder of the page is zero):
/// ```text
/// [0..4]    magic (u32)
/// [4..8]    version (u32)
/// [8..12]   page_size (u32)
/// [12..16]  reserved
/// [16..24]  txid (u64)
/// [24..32]  entry_count (u64)
/// [32..40]  data_offset (u64) - file offset of the data section
/// [40..48]  data_len (u64) - bytes in the data section
/// [48..52]  data_checksum (u32) - CRC32 of the data section
/// [52..56]  checksum (u32) - CRC32 of bytes [0..52]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    /// Id of the last committed transaction.
    pub txid: u64,
    /// Number of tree entries in the data section.
    pub entry_count: u64,
    /// File offset of the data section.
    pub data_offset: u64,
    /// Length of the data section in bytes.
    pub data_len: u64,
    /// CRC32 of the data section.
    pub data_checksum: u32,
    /// CRC32 of the encoded fields above.
    pub checksum: u32,
}

impl Meta {
    /// Encoded size of the meta fields.
    pub const SIZE: usize = 56;

    /// Creates meta for an empty database.
    pub fn new() -> Self {
        Self::for_data(0, 0, DATA_OFFSET, &[])
    }

    /// Creates meta describing a data section stored at `data_offset`.
    pub fn for_data(txid: u64, entry_count: u64, data_offset: u64, data: &[u8]) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: VERSION,
            page_size: PAGE_SIZE as u32,
            txid,
            entry_count,
            data_offset,
            data_len: data.len() as u64,
            data_checksum: concurrent::checksum(data),
            checksum: 0,
        };
        meta.checksum = meta.compute_checksum();
        meta
    }

    /// File offset just past the data section.
    #[inline]
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_len
    }

    fn encode_fields(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.txid.to_le_bytes());
        buf[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.data_len.to_le_bytes());
        buf[48..52].copy_from_slice(&self.data_checksum.to_le_bytes());
        buf[52..56].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.encode_fields()[..52])
    }

    /// Serializes the meta into a full page.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..Self::SIZE].copy_from_slice(&self.encode_fields());
        page
    }

    /// Parses meta from the start of a page. Returns `None` if the buffer
    /// is too short; use [`Meta::validate`] to check the contents.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let u32_at = |at: usize| -> Option<u32> {
            Some(u32::from_le_bytes(buf[at..at + 4].try_into().ok()?))
        };
        let u64_at = |at: usize| -> Option<u64> {
            Some(u64::from_le_bytes(buf[at..at + 8].try_into().ok()?))
        };
        Some(Self {
            magic: u32_at(0)?,
            version: u32_at(4)?,
            page_size: u32_at(8)?,
            txid: u64_at(16)?,
            entry_count: u64_at(24)?,
            data_offset: u64_at(32)?,
            data_len: u64_at(40)?,
            data_checksum: u32_at(48)?,
            checksum: u32_at(52)?,
        })
    }

    /// Checks magic, version, page size, data placement and checksum.
    pub fn validate(&self) -> bool {
        self.magic == MAGIC
            && self.version == VERSION
            && self.page_size == PAGE_SIZE as u32
            && self.data_offset >= DATA_OFFSET
            && self.checksum == self.compute_checksum()
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_meta_is_valid() {
        let meta = Meta::new();
        assert!(meta.validate());
        assert_eq!(meta.txid, 0);
        assert_eq!(meta.data_offset, DATA_OFFSET);
        assert_eq!(meta.data_end(), DATA_OFFSET);
    }

    #[test]
    fn test_meta_bytes_roundtrip() {
        let meta = Meta::for_data(7, 3, DATA_OFFSET + 64, b"some data section");
        let page = meta.to_bytes();
        assert_eq!(page.len(), PAGE_SIZE);

        let parsed = Meta::from_bytes(&page).expect("parse should succeed");
        assert_eq!(parsed, meta);
        assert!(parsed.validate());
        assert_eq!(parsed.data_checksum, crc32fast::hash(b"some data section"));
    }

    #[test]
    fn test_corrupted_meta_fails_validation() {
        let mut page = Meta::for_data(1, 0, DATA_OFFSET, &[]).to_bytes();
        page[17] ^= 0xFF; // flip a txid byte

        let parsed = Meta::from_bytes(&page).expect("parse should succeed");
        assert!(!parsed.validate());
    }

    #[test]
    fn test_zeroed_page_is_invalid() {
        let page = vec![0u8; PAGE_SIZE];
        let parsed = Meta::from_bytes(&page).expect("parse should succeed");
        assert!(!parsed.validate());
    }

    #[test]
    fn test_short_buffer() {
        assert!(Meta::from_bytes(&[0u8; 10]).is_none());
    }
}
