//! Summary: File layout constants.
//! Copyright (c) YOAB. All rights reserved.

/// Page size in bytes (4KB). Meta pages occupy exactly one page each.
pub const PAGE_SIZE: usize = 4096;

/// Magic number identifying thunderbox database files.
pub const MAGIC: u32 = 0x54_48_4E_44; // "THND" in ASCII

/// Current database file format version.
pub const VERSION: u32 = 2;

/// Number of meta pages at the start of the file.
pub const META_PAGE_COUNT: u64 = 2;

/// Byte offset where the data section begins (after both meta pages).
pub const DATA_OFFSET: u64 = META_PAGE_COUNT * PAGE_SIZE as u64;

/// Byte offset of the given meta page.
#[inline]
pub const fn meta_page_offset(page_number: u64) -> u64 {
    page_number * PAGE_SIZE as u64
}
