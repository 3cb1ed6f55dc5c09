//! Summary: Bucket implementation for nested, namespaced key-value storage.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Buckets provide logical namespacing for keys within the database. A
//! bucket holds values and further nested buckets, all ordered by key. This
//! design is similar to bbolt/boltdb used in etcd.
//!
//! # Design
//!
//! All data lives in a single ordered tree. A bucket is identified by the
//! path of bucket names leading to it, encoded as a key prefix:
//!
//! `enc(path) = [SEGMENT_TAG][len:u8][name] ...` (one group per name)
//!
//! A direct entry `key` of the bucket is stored at
//! `enc(path) ++ [ENTRY_TAG] ++ key`, so the entries of a bucket form one
//! contiguous range sorted by user key. The stored value starts with a flag:
//! `[VALUE_FLAG] ++ bytes` for a value, `[BUCKET_FLAG] ++ sequence:u64` for a
//! nested bucket marker. Everything below a bucket, including nested buckets,
//! shares the prefix `enc(path)`, so deleting a bucket is one prefix removal.
//!
//! The root bucket has the empty path and holds only buckets.

use std::sync::Arc;

use crate::btree::BTree;
use crate::cursor::Cursor;
use crate::error::{ErrorKind, Result};
use crate::tx::TxState;

/// Tag byte preceding a user key inside a bucket.
const ENTRY_TAG: u8 = 0x00;

/// Tag byte preceding each bucket name in an encoded path.
const SEGMENT_TAG: u8 = 0x01;

/// Flag byte of a stored value.
const VALUE_FLAG: u8 = 0x00;

/// Flag byte of a nested bucket marker.
const BUCKET_FLAG: u8 = 0x01;

/// Maximum allowed bucket name length in bytes.
pub const MAX_BUCKET_NAME_LEN: usize = 255;

/// Maximum allowed key length in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Maximum allowed value length in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Validates a bucket name.
///
/// # Errors
///
/// Returns `InvalidBucketName` if the name is empty or exceeds the maximum length.
pub fn validate_bucket_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(ErrorKind::InvalidBucketName {
            reason: "bucket name cannot be empty",
        }
        .into());
    }
    if name.len() > MAX_BUCKET_NAME_LEN {
        return Err(ErrorKind::InvalidBucketName {
            reason: "bucket name exceeds maximum length of 255 bytes",
        }
        .into());
    }
    Ok(())
}

/// Validates a key.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(ErrorKind::KeyRequired.into());
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(ErrorKind::KeyTooLarge { len: key.len() }.into());
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(ErrorKind::ValueTooLarge { len: value.len() }.into());
    }
    Ok(())
}

/// Returns the encoded prefix of a child bucket.
#[inline]
pub(crate) fn child_prefix(parent_prefix: &[u8], name: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(parent_prefix.len() + 2 + name.len());
    prefix.extend_from_slice(parent_prefix);
    prefix.push(SEGMENT_TAG);
    prefix.push(name.len() as u8);
    prefix.extend_from_slice(name);
    prefix
}

/// Returns the prefix shared by all direct entries of a bucket.
#[inline]
pub(crate) fn entries_prefix(bucket_prefix: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(bucket_prefix.len() + 1);
    prefix.extend_from_slice(bucket_prefix);
    prefix.push(ENTRY_TAG);
    prefix
}

/// Creates the internal key of a direct entry of a bucket.
#[inline]
pub(crate) fn entry_key(bucket_prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut internal = Vec::with_capacity(bucket_prefix.len() + 1 + key.len());
    internal.extend_from_slice(bucket_prefix);
    internal.push(ENTRY_TAG);
    internal.extend_from_slice(key);
    internal
}

/// A decoded internal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stored<'a> {
    Value(&'a [u8]),
    Bucket { sequence: u64 },
}

impl<'a> Stored<'a> {
    /// Decodes an internal value. Returns `None` for malformed data.
    pub(crate) fn decode(raw: &'a [u8]) -> Option<Self> {
        match raw.split_first()? {
            (&VALUE_FLAG, value) => Some(Stored::Value(value)),
            (&BUCKET_FLAG, seq) => Some(Stored::Bucket {
                sequence: u64::from_le_bytes(seq.try_into().ok()?),
            }),
            _ => None,
        }
    }
}

fn encode_value(value: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(1 + value.len());
    raw.push(VALUE_FLAG);
    raw.extend_from_slice(value);
    raw
}

fn encode_bucket_marker(sequence: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(9);
    raw.push(BUCKET_FLAG);
    raw.extend_from_slice(&sequence.to_le_bytes());
    raw
}

/// A handle to a bucket inside a transaction.
///
/// The handle borrows the transaction and cannot outlive it. Mutating
/// methods fail with `TxNotWritable` in a read-only transaction.
#[derive(Clone)]
pub struct Bucket<'tx> {
    tx: &'tx TxState,
    path: Vec<Vec<u8>>,
    /// Encoded path of this bucket.
    prefix: Vec<u8>,
    /// Internal key of this bucket's marker in its parent; `None` for the root.
    marker: Option<Vec<u8>>,
}

impl std::fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path: Vec<String> = self
            .path
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        f.debug_struct("Bucket")
            .field("path", &path)
            .field("writable", &self.tx.writable())
            .finish()
    }
}

impl<'tx> Bucket<'tx> {
    /// Creates a handle to the root bucket of a transaction.
    pub(crate) fn root(tx: &'tx TxState) -> Self {
        Self {
            tx,
            path: Vec::new(),
            prefix: Vec::new(),
            marker: None,
        }
    }

    fn child(&self, name: &[u8]) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        Self {
            tx: self.tx,
            path,
            prefix: child_prefix(&self.prefix, name),
            marker: Some(entry_key(&self.prefix, name)),
        }
    }

    /// Returns the bucket name, or `None` for the root bucket.
    #[inline]
    pub fn name(&self) -> Option<&[u8]> {
        self.path.last().map(Vec::as_slice)
    }

    /// Returns the path of bucket names from the root to this bucket.
    #[inline]
    pub fn path(&self) -> Vec<&[u8]> {
        self.path.iter().map(|p| p.as_slice()).collect()
    }

    /// Returns true for the root bucket of a transaction.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.marker.is_none()
    }

    /// Returns true if the owning transaction is writable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    pub(crate) fn tx_state(&self) -> &'tx TxState {
        self.tx
    }

    pub(crate) fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Fails if this bucket was deleted after the handle was obtained.
    fn ensure_live(&self, tree: &BTree) -> Result<()> {
        match &self.marker {
            Some(marker) if !matches!(tree.get(marker).and_then(Stored::decode), Some(Stored::Bucket { .. })) => {
                Err(ErrorKind::BucketNotFound {
                    name: self.name().unwrap_or_default().to_vec(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Retrieves the value associated with the given key.
    ///
    /// Returns `None` if the key does not exist or names a nested bucket.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let tree = self.tx.snapshot();
        match tree.get(&entry_key(&self.prefix, key)).and_then(Stored::decode) {
            Some(Stored::Value(value)) => Some(value.to_vec()),
            _ => None,
        }
    }

    /// Inserts or updates a key-value pair.
    ///
    /// # Errors
    ///
    /// Returns `TxNotWritable` in a read-only transaction, `KeyRequired`,
    /// `KeyTooLarge` or `ValueTooLarge` for invalid input, and
    /// `IncompatibleValue` if the key names a nested bucket or this is the
    /// root bucket.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        validate_key(key)?;
        validate_value(value)?;
        if self.is_root() {
            return Err(ErrorKind::IncompatibleValue.into());
        }

        let mut tree = self.tx.tree_mut()?;
        self.ensure_live(&tree)?;
        let internal = entry_key(&self.prefix, key);
        if let Some(Stored::Bucket { .. }) = tree.get(&internal).and_then(Stored::decode) {
            return Err(ErrorKind::IncompatibleValue.into());
        }
        tree.insert(internal, encode_value(value));
        Ok(())
    }

    /// Deletes a key from the bucket.
    ///
    /// Deleting a missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TxNotWritable` in a read-only transaction and
    /// `IncompatibleValue` if the key names a nested bucket.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        let internal = entry_key(&self.prefix, key);
        match self.tx.snapshot().get(&internal).and_then(Stored::decode) {
            None => return Ok(()),
            Some(Stored::Bucket { .. }) => return Err(ErrorKind::IncompatibleValue.into()),
            Some(Stored::Value(_)) => {}
        }
        self.tx.tree_mut()?.remove(&internal);
        Ok(())
    }

    /// Retrieves a nested bucket by name.
    ///
    /// Returns `None` if the bucket does not exist or the name holds a value.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'tx>> {
        if validate_bucket_name(name).is_err() {
            return None;
        }
        let tree = self.tx.snapshot();
        match tree.get(&entry_key(&self.prefix, name)).and_then(Stored::decode) {
            Some(Stored::Bucket { .. }) => Some(self.child(name)),
            _ => None,
        }
    }

    /// Creates a nested bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketExists` if it already exists, `IncompatibleValue` if a
    /// value is stored under the name, `InvalidBucketName` for a blank or
    /// too long name, and `TxNotWritable` in a read-only transaction.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket_inner(name)? {
            (bucket, true) => Ok(bucket),
            (_, false) => Err(ErrorKind::BucketExists {
                name: name.to_vec(),
            }
            .into()),
        }
    }

    /// Creates a nested bucket if it doesn't exist and returns it.
    ///
    /// # Errors
    ///
    /// Same as [`Bucket::create_bucket`] except that an existing bucket is
    /// returned instead of failing.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.create_bucket_inner(name).map(|(bucket, _)| bucket)
    }

    /// Returns the bucket and whether it was newly created.
    fn create_bucket_inner(&self, name: &[u8]) -> Result<(Bucket<'tx>, bool)> {
        self.tx.check_writable()?;
        validate_bucket_name(name)?;

        let internal = entry_key(&self.prefix, name);
        match self.tx.snapshot().get(&internal).and_then(Stored::decode) {
            Some(Stored::Bucket { .. }) => return Ok((self.child(name), false)),
            Some(Stored::Value(_)) => return Err(ErrorKind::IncompatibleValue.into()),
            None => {}
        }

        let mut tree = self.tx.tree_mut()?;
        self.ensure_live(&tree)?;
        tree.insert(internal, encode_bucket_marker(0));
        Ok((self.child(name), true))
    }

    /// Deletes a nested bucket and everything below it.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if it doesn't exist, `IncompatibleValue` if
    /// the name holds a value, and `TxNotWritable` in a read-only transaction.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        validate_bucket_name(name)?;

        let internal = entry_key(&self.prefix, name);
        match self.tx.snapshot().get(&internal).and_then(Stored::decode) {
            None => {
                return Err(ErrorKind::BucketNotFound {
                    name: name.to_vec(),
                }
                .into());
            }
            Some(Stored::Value(_)) => return Err(ErrorKind::IncompatibleValue.into()),
            Some(Stored::Bucket { .. }) => {}
        }

        let mut tree = self.tx.tree_mut()?;
        let removed = tree.remove_prefix(&child_prefix(&self.prefix, name));
        tree.remove(&internal);
        tracing::trace!(
            bucket = %String::from_utf8_lossy(name),
            removed,
            "deleted bucket"
        );
        Ok(())
    }

    /// Executes `f` for each key/value pair in the bucket, in key order.
    ///
    /// Nested buckets are skipped; use [`Bucket::for_each_bucket`] for them.
    /// If `f` returns an error the iteration stops and the error is
    /// returned. The iteration walks the bucket as it was when the call
    /// started, so `f` may modify the bucket without affecting it.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let tree = self.tx.snapshot();
        let prefix = entries_prefix(&self.prefix);
        for (key, raw) in tree.scan_prefix(&prefix) {
            if let Some(Stored::Value(value)) = Stored::decode(raw) {
                f(&key[prefix.len()..], value)?;
            }
        }
        Ok(())
    }

    /// Executes `f` for the name of each nested bucket, in key order.
    pub fn for_each_bucket<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let tree = self.tx.snapshot();
        let prefix = entries_prefix(&self.prefix);
        for (key, raw) in tree.scan_prefix(&prefix) {
            if let Some(Stored::Bucket { .. }) = Stored::decode(raw) {
                f(&key[prefix.len()..])?;
            }
        }
        Ok(())
    }

    /// Lists the names of all nested buckets directly under this bucket.
    pub fn buckets(&self) -> Vec<Vec<u8>> {
        let tree = self.tx.snapshot();
        let prefix = entries_prefix(&self.prefix);
        tree.scan_prefix(&prefix)
            .filter(|(_, raw)| matches!(Stored::decode(raw), Some(Stored::Bucket { .. })))
            .map(|(key, _)| key[prefix.len()..].to_vec())
            .collect()
    }

    /// Creates a cursor over the direct entries of this bucket.
    pub fn cursor(&self) -> Cursor<'tx> {
        Cursor::new(self.clone())
    }

    /// Returns the current sequence number of the bucket (0 for the root).
    pub fn sequence(&self) -> u64 {
        let Some(marker) = &self.marker else {
            return 0;
        };
        match self.tx.snapshot().get(marker).and_then(Stored::decode) {
            Some(Stored::Bucket { sequence }) => sequence,
            _ => 0,
        }
    }

    /// Returns an autoincrementing integer for the bucket.
    ///
    /// # Errors
    ///
    /// Returns `TxNotWritable` in a read-only transaction,
    /// `IncompatibleValue` on the root bucket and `SequenceOverflow` once
    /// the sequence is exhausted.
    pub fn next_sequence(&self) -> Result<u64> {
        self.tx.check_writable()?;
        let Some(marker) = &self.marker else {
            return Err(ErrorKind::IncompatibleValue.into());
        };

        let mut tree = self.tx.tree_mut()?;
        self.ensure_live(&tree)?;
        let current = match tree.get(marker).and_then(Stored::decode) {
            Some(Stored::Bucket { sequence }) => sequence,
            _ => 0,
        };
        let next = current
            .checked_add(1)
            .ok_or(ErrorKind::SequenceOverflow)?;
        tree.insert(marker.clone(), encode_bucket_marker(next));
        Ok(next)
    }

    /// Returns a shared snapshot of the tree as seen by this bucket.
    pub(crate) fn snapshot(&self) -> Arc<BTree> {
        self.tx.snapshot()
    }
}
