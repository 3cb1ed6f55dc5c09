//! Summary: Ordered in-memory tree holding all database entries.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The whole keyspace lives in one ordered map of internal keys to internal
//! values. Buckets are key prefixes (see `bucket.rs`), so every bucket
//! operation reduces to a point lookup or a prefix/range scan here.
//!
//! Transactions share the committed tree through an `Arc<BTree>`; a write
//! transaction clones it on its first mutation.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Bound;

/// An ordered map of byte-string keys to byte-string values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BTree {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl BTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the tree has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retrieves the value stored under `key`.
    #[inline]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Inserts a key-value pair, returning the previous value.
    #[inline]
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key, value)
    }

    /// Removes a key, returning its value.
    #[inline]
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Removes every entry whose key starts with `prefix`.
    ///
    /// Returns the number of removed entries.
    pub fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        let doomed: Vec<Vec<u8>> = self.scan_prefix(prefix).map(|(k, _)| k.to_vec()).collect();
        for key in &doomed {
            self.entries.remove(key.as_slice());
        }
        doomed.len()
    }

    /// Returns an iterator over all entries in key order.
    pub fn iter(&self) -> BTreeIter<'_> {
        BTreeIter {
            inner: self.entries.range::<[u8], _>(..),
        }
    }

    /// Returns an iterator over entries whose key starts with `prefix`,
    /// in key order.
    pub fn scan_prefix<'a, 'p>(
        &'a self,
        prefix: &'p [u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + use<'a, 'p> {
        self.range_from(prefix, true)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Returns an iterator starting at `key` (inclusive or exclusive).
    pub fn range_from<'a>(&'a self, key: &[u8], inclusive: bool) -> BTreeIter<'a> {
        let lower = if inclusive {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        };
        BTreeIter {
            inner: self.entries.range::<[u8], _>((lower, Bound::Unbounded)),
        }
    }

    /// Returns the last entry strictly before `key`.
    pub fn last_before(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        self.entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Returns the last entry whose key starts with `prefix`.
    pub fn last_with_prefix(&self, prefix: &[u8]) -> Option<(&[u8], &[u8])> {
        let entry = match prefix_upper_bound(prefix) {
            Some(upper) => self.last_before(&upper),
            None => self
                .entries
                .iter()
                .next_back()
                .map(|(k, v)| (k.as_slice(), v.as_slice())),
        }?;
        entry.0.starts_with(prefix).then_some(entry)
    }
}

/// Returns the smallest key greater than every key starting with `prefix`,
/// or `None` if no such key exists (empty or all-`0xFF` prefix).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Iterator over tree entries in key order.
pub struct BTreeIter<'a> {
    inner: btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl<'a> Iterator for BTreeIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}
