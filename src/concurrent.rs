//! Summary: Parallel entry encoding and checksumming using rayon.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Committing and snapshotting serialize the whole tree. Encoding entries
//! and computing the data checksum are spread across cores with rayon;
//! the I/O that follows stays sequential.
//!
//! Small inputs are processed sequentially since thread overhead would
//! outweigh the gain.

use rayon::prelude::*;

/// Minimum number of entries to trigger parallel processing.
pub const PARALLEL_THRESHOLD: usize = 100;

/// Chunk size in bytes for parallel checksumming.
pub const CHECKSUM_CHUNK_SIZE: usize = 256 * 1024;

/// Encodes one entry as `[key_len:u32][key][value_len:u32][value]`.
#[inline]
fn encode_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_entry_len(key, value));
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Returns the encoded size of one entry.
#[inline]
pub fn encoded_entry_len(key: &[u8], value: &[u8]) -> usize {
    8 + key.len() + value.len()
}

/// Encodes entries in parallel, preserving input order.
///
/// For batches of at least `PARALLEL_THRESHOLD` entries, rayon's parallel
/// iterator distributes the work across the global thread pool.
pub fn prepare_entries_parallel(entries: &[(&[u8], &[u8])]) -> Vec<Vec<u8>> {
    if entries.len() < PARALLEL_THRESHOLD {
        entries
            .iter()
            .map(|(key, value)| encode_entry(key, value))
            .collect()
    } else {
        entries
            .par_iter()
            .map(|(key, value)| encode_entry(key, value))
            .collect()
    }
}

/// Computes the CRC32 of `data`, hashing large inputs chunk-wise in
/// parallel and combining the partial checksums.
pub fn checksum(data: &[u8]) -> u32 {
    if data.len() < 2 * CHECKSUM_CHUNK_SIZE {
        return crc32fast::hash(data);
    }

    let partials: Vec<crc32fast::Hasher> = data
        .par_chunks(CHECKSUM_CHUNK_SIZE)
        .map(|chunk| {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(chunk);
            hasher
        })
        .collect();

    let mut combined = crc32fast::Hasher::new();
    for partial in &partials {
        combined.combine(partial);
    }
    combined.finalize()
}
