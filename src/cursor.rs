//! Summary: Bidirectional cursor over the entries of a bucket.
//! Copyright (c) YOAB. All rights reserved.

use crate::bucket::{Bucket, Stored, entries_prefix};
use crate::error::{ErrorKind, Result};

/// A cursor item: the key and its value, or `None` for a nested bucket.
pub type CursorItem = (Vec<u8>, Option<Vec<u8>>);

/// A cursor over the direct entries of a bucket, in key order.
///
/// Every move reads the transaction's current state, so entries written or
/// deleted through the same transaction are observed. The cursor is only
/// valid as long as the transaction is open.
pub struct Cursor<'tx> {
    bucket: Bucket<'tx>,
    entries_prefix: Vec<u8>,
    /// Internal key of the current entry.
    position: Option<Vec<u8>>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(bucket: Bucket<'tx>) -> Self {
        let entries_prefix = entries_prefix(bucket.prefix());
        Self {
            bucket,
            entries_prefix,
            position: None,
        }
    }

    /// Returns the bucket this cursor was created from.
    #[inline]
    pub fn bucket(&self) -> &Bucket<'tx> {
        &self.bucket
    }

    /// Moves to the first entry of the bucket.
    pub fn first(&mut self) -> Option<CursorItem> {
        let tree = self.bucket.snapshot();
        let found = tree.scan_prefix(&self.entries_prefix).next();
        self.settle(found)
    }

    /// Moves to the last entry of the bucket.
    pub fn last(&mut self) -> Option<CursorItem> {
        let tree = self.bucket.snapshot();
        let found = tree.last_with_prefix(&self.entries_prefix);
        self.settle(found)
    }

    /// Moves to the first entry whose key is greater than or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<CursorItem> {
        let tree = self.bucket.snapshot();
        let mut target = self.entries_prefix.clone();
        target.extend_from_slice(key);
        let found = tree
            .range_from(&target, true)
            .next()
            .filter(|(k, _)| k.starts_with(&self.entries_prefix));
        self.settle(found)
    }

    /// Moves to the next entry. An unpositioned cursor moves to the first.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<CursorItem> {
        let Some(current) = self.position.clone() else {
            return self.first();
        };
        let tree = self.bucket.snapshot();
        let found = tree
            .range_from(&current, false)
            .next()
            .filter(|(k, _)| k.starts_with(&self.entries_prefix));
        self.advance(found)
    }

    /// Moves to the previous entry. An unpositioned cursor moves to the last.
    pub fn prev(&mut self) -> Option<CursorItem> {
        let Some(current) = self.position.clone() else {
            return self.last();
        };
        let tree = self.bucket.snapshot();
        let found = tree
            .last_before(&current)
            .filter(|(k, _)| k.starts_with(&self.entries_prefix));
        self.advance(found)
    }

    /// Removes the current key/value from the bucket.
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleValue` if the current entry is a nested bucket
    /// and `TxNotWritable` in a read-only transaction.
    pub fn delete(&self) -> Result<()> {
        self.bucket.tx_state().check_writable()?;
        let Some(current) = &self.position else {
            return Ok(());
        };
        let is_bucket = match self.bucket.snapshot().get(current).and_then(Stored::decode) {
            Some(Stored::Bucket { .. }) => true,
            Some(Stored::Value(_)) => false,
            None => return Ok(()),
        };
        if is_bucket {
            return Err(ErrorKind::IncompatibleValue.into());
        }
        self.bucket.delete(&current[self.entries_prefix.len()..])
    }

    /// Positions the cursor on `found`, or unpositions it.
    fn settle(&mut self, found: Option<(&[u8], &[u8])>) -> Option<CursorItem> {
        match found {
            Some((key, raw)) => {
                self.position = Some(key.to_vec());
                Some(self.item(key, raw))
            }
            None => {
                self.position = None;
                None
            }
        }
    }

    /// Moves to `found`; stays in place when there is no further entry.
    fn advance(&mut self, found: Option<(&[u8], &[u8])>) -> Option<CursorItem> {
        let (key, raw) = found?;
        self.position = Some(key.to_vec());
        Some(self.item(key, raw))
    }

    fn item(&self, key: &[u8], raw: &[u8]) -> CursorItem {
        let user_key = key[self.entries_prefix.len()..].to_vec();
        let value = match Stored::decode(raw) {
            Some(Stored::Value(value)) => Some(value.to_vec()),
            _ => None,
        };
        (user_key, value)
    }
}
