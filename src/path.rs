//! Summary: Path resolution through nested buckets and path-addressed access.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A path is an ordered list of segments. Every segment but the last names a
//! bucket, descending from a starting bucket; the last names the key the
//! operation acts on. Reads stop at the first missing bucket and report
//! "not found", writes create missing buckets as they go.

use crate::bucket::Bucket;
use crate::error::{ErrorKind, Result};

/// How [`resolve`] treats a missing bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Stop and report the bucket as absent.
    Lookup,
    /// Create the bucket and continue.
    CreateIfMissing,
}

/// Walks from `start` through `folders`, one bucket per segment.
///
/// Returns `Ok(None)` under [`Resolve::Lookup`] when a bucket is missing.
/// Under [`Resolve::CreateIfMissing`] a creation failure is returned as is.
/// An empty `folders` resolves to `start` itself.
pub fn resolve<'tx, K>(start: &Bucket<'tx>, folders: &[K], policy: Resolve) -> Result<Option<Bucket<'tx>>>
where
    K: AsRef<[u8]>,
{
    let mut current = start.clone();
    for folder in folders {
        let name = folder.as_ref();
        current = match policy {
            Resolve::Lookup => match current.bucket(name) {
                Some(next) => next,
                None => {
                    tracing::trace!(bucket = %String::from_utf8_lossy(name), "bucket not found along path");
                    return Ok(None);
                }
            },
            Resolve::CreateIfMissing => current.create_bucket_if_not_exists(name)?,
        };
    }
    Ok(Some(current))
}

/// Splits a path into its bucket segments and terminal key.
///
/// # Errors
///
/// Returns `EmptyPath` if `path` has no segments.
pub fn split_path<K: AsRef<[u8]>>(path: &[K]) -> Result<(&[K], &[u8])> {
    match path.split_last() {
        Some((key, folders)) => Ok((folders, key.as_ref())),
        None => Err(ErrorKind::EmptyPath.into()),
    }
}

impl<'tx> Bucket<'tx> {
    /// Runs `f` with the nested bucket at `folders`.
    ///
    /// Returns `None` without calling `f` if any bucket is missing.
    pub fn open_bucket<K, T, F>(&self, folders: &[K], f: F) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnOnce(&Bucket<'tx>) -> Result<T>,
    {
        match resolve(self, folders, Resolve::Lookup)? {
            Some(bucket) => f(&bucket).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the nested bucket at `folders`, creating missing buckets.
    pub fn create_bucket_path<K: AsRef<[u8]>>(&self, folders: &[K]) -> Result<Bucket<'tx>> {
        // Creation never reports a missing bucket.
        resolve(self, folders, Resolve::CreateIfMissing)?.ok_or_else(|| {
            ErrorKind::BucketNotFound {
                name: folders.last().map(|f| f.as_ref().to_vec()).unwrap_or_default(),
            }
            .into()
        })
    }

    /// Runs `f` with the value at `path`.
    ///
    /// Returns `None` without calling `f` if a bucket along the path or the
    /// key is missing, or if the key names a bucket.
    pub fn value<K, T, F>(&self, path: &[K], f: F) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnOnce(&[u8]) -> Result<T>,
    {
        let (folders, key) = split_path(path)?;
        let Some(bucket) = resolve(self, folders, Resolve::Lookup)? else {
            return Ok(None);
        };
        match bucket.get(key) {
            Some(value) => f(value.as_slice()).map(Some),
            None => Ok(None),
        }
    }

    /// Stores `value` at `path`, creating missing buckets.
    pub fn put_path<K: AsRef<[u8]>>(&self, path: &[K], value: &[u8]) -> Result<()> {
        let (folders, key) = split_path(path)?;
        self.create_bucket_path(folders)?.put(key, value)
    }

    /// Deletes the value at `path`. Missing buckets or keys are not an error.
    pub fn delete_path<K: AsRef<[u8]>>(&self, path: &[K]) -> Result<()> {
        self.tx_state().check_writable()?;
        let (folders, key) = split_path(path)?;
        match resolve(self, folders, Resolve::Lookup)? {
            Some(bucket) => bucket.delete(key),
            None => Ok(()),
        }
    }

    /// Replaces the value at `path` with the result of `f`.
    ///
    /// `f` is called exactly once with the current value. `Some` stores the
    /// returned value and `None` deletes the key. Missing buckets are created.
    pub fn update_path<K, F>(&self, path: &[K], f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        let (folders, key) = split_path(path)?;
        let bucket = self.create_bucket_path(folders)?;
        let current = bucket.get(key);
        match f(current.as_deref())? {
            Some(value) => bucket.put(key, &value),
            None => bucket.delete(key),
        }
    }

    /// Runs `f` for every key/value pair of the bucket at `folders`, in
    /// ascending key order. Nothing is visited if a bucket is missing.
    pub fn for_each_path<K, F>(&self, folders: &[K], f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        self.open_bucket(folders, |bucket| bucket.for_each(f)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::btree::BTree;
    use crate::tx::TxState;

    use super::*;

    fn write_state() -> TxState {
        TxState::new(Arc::new(BTree::new()), true, 0)
    }

    fn read(bucket: &Bucket<'_>, path: &[&str]) -> Option<Vec<u8>> {
        bucket.value(path, |v| Ok(v.to_vec())).unwrap()
    }

    #[test]
    fn test_split_path() {
        let (folders, key) = split_path(&["a", "b", "c"]).unwrap();
        assert_eq!(folders, &["a", "b"]);
        assert_eq!(key, b"c");

        let (folders, key) = split_path(&["only"]).unwrap();
        assert!(folders.is_empty());
        assert_eq!(key, b"only");

        let empty: [&str; 0] = [];
        assert!(matches!(split_path(&empty).unwrap_err().kind(), ErrorKind::EmptyPath));
    }

    #[test]
    fn test_lookup_does_not_create() {
        let state = write_state();
        let root = Bucket::root(&state);

        assert!(resolve(&root, &["a", "b"], Resolve::Lookup).unwrap().is_none());
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn test_create_if_missing_builds_chain() {
        let state = write_state();
        let root = Bucket::root(&state);

        let leaf = resolve(&root, &["a", "b", "c"], Resolve::CreateIfMissing)
            .unwrap()
            .unwrap();
        assert_eq!(leaf.path(), vec![&b"a"[..], b"b", b"c"]);

        let found = resolve(&root, &["a", "b", "c"], Resolve::Lookup).unwrap().unwrap();
        assert_eq!(found.path(), leaf.path());
    }

    #[test]
    fn test_empty_folders_resolve_to_start() {
        let state = write_state();
        let root = Bucket::root(&state);
        let empty: [&[u8]; 0] = [];

        let resolved = resolve(&root, &empty, Resolve::Lookup).unwrap().unwrap();
        assert!(resolved.is_root());
    }

    #[test]
    fn test_create_stops_on_value() {
        let state = write_state();
        let root = Bucket::root(&state);
        root.put_path(&["a", "leaf"], b"v").unwrap();

        let err = resolve(&root, &["a", "leaf", "deeper"], Resolve::CreateIfMissing).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::IncompatibleValue));
    }

    #[test]
    fn test_create_rejects_blank_segment() {
        let state = write_state();
        let root = Bucket::root(&state);

        let err = root.put_path(&["a", "", "k"], b"v").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidBucketName { .. }));
    }

    #[test]
    fn test_value_put_delete() {
        let state = write_state();
        let root = Bucket::root(&state);

        root.put_path(&["a", "b", "k"], b"v").unwrap();
        assert_eq!(read(&root, &["a", "b", "k"]), Some(b"v".to_vec()));
        assert_eq!(read(&root, &["a", "b", "missing"]), None);
        assert_eq!(read(&root, &["x", "y", "k"]), None);
        // A bucket is not a value.
        assert_eq!(read(&root, &["a", "b"]), None);

        root.delete_path(&["a", "b", "k"]).unwrap();
        assert_eq!(read(&root, &["a", "b", "k"]), None);
        root.delete_path(&["nope", "k"]).unwrap();
    }

    #[test]
    fn test_relative_to_nested_bucket() {
        let state = write_state();
        let root = Bucket::root(&state);
        let a = root.create_bucket(b"a").unwrap();

        a.put_path(&["b", "k"], b"v").unwrap();
        a.put_path(&["top"], b"t").unwrap();
        assert_eq!(read(&root, &["a", "b", "k"]), Some(b"v".to_vec()));
        assert_eq!(a.get(b"top"), Some(b"t".to_vec()));
    }

    #[test]
    fn test_update_path() {
        let state = write_state();
        let root = Bucket::root(&state);

        let mut calls = 0;
        root.update_path(&["c", "n"], |current| {
            calls += 1;
            assert_eq!(current, None);
            Ok(Some(b"1".to_vec()))
        })
        .unwrap();
        root.update_path(&["c", "n"], |current| {
            calls += 1;
            let next = current.map(|v| v[0] + 1).unwrap_or(b'0');
            Ok(Some(vec![next]))
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(read(&root, &["c", "n"]), Some(b"2".to_vec()));

        root.update_path(&["c", "n"], |_| Ok(None)).unwrap();
        assert_eq!(read(&root, &["c", "n"]), None);
        // Deleting nothing is fine.
        root.update_path(&["c", "n"], |_| Ok(None)).unwrap();
    }

    #[test]
    fn test_update_error_leaves_value() {
        let state = write_state();
        let root = Bucket::root(&state);
        root.put_path(&["c", "n"], b"keep").unwrap();

        let err = root
            .update_path(&["c", "n"], |_| Err(crate::Error::callback("nope")))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Callback(_)));
        assert_eq!(read(&root, &["c", "n"]), Some(b"keep".to_vec()));
    }

    #[test]
    fn test_for_each_path_yields_own_values() {
        let state = write_state();
        let root = Bucket::root(&state);
        root.put_path(&["a", "k1"], b"v1").unwrap();
        root.put_path(&["a", "k2"], b"v2").unwrap();

        let mut seen = Vec::new();
        root.for_each_path(&["a"], |k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), b"v2".to_vec())]
        );

        let mut visited = 0;
        root.for_each_path(&["missing"], |_, _| {
            visited += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, 0);
    }
}
