//! Summary: Read and write transaction types.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A transaction sees the tree committed when it began. A write transaction
//! holds the database's writer lock for its whole life and clones the tree
//! on its first mutation; `commit` persists the clone and publishes it.

use std::cell::{RefCell, RefMut};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, MutexGuard};

use crate::btree::BTree;
use crate::bucket::Bucket;
use crate::cursor::Cursor;
use crate::db::{self, Database};
use crate::error::{ErrorKind, Result};
use crate::meta::Meta;
use crate::page::DATA_OFFSET;
use crate::path::split_path;

/// Tree state shared by a transaction and the buckets borrowed from it.
pub(crate) struct TxState {
    tree: RefCell<Arc<BTree>>,
    writable: bool,
    /// Id of the snapshot this transaction started from.
    txid: u64,
}

impl TxState {
    pub(crate) fn new(tree: Arc<BTree>, writable: bool, txid: u64) -> Self {
        Self {
            tree: RefCell::new(tree),
            writable,
            txid,
        }
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub(crate) fn txid(&self) -> u64 {
        self.txid
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(ErrorKind::TxNotWritable.into());
        }
        Ok(())
    }

    /// Returns the tree as currently seen by the transaction.
    pub(crate) fn snapshot(&self) -> Arc<BTree> {
        Arc::clone(&self.tree.borrow())
    }

    /// Returns the tree for mutation, detaching it from any shared snapshot.
    pub(crate) fn tree_mut(&self) -> Result<RefMut<'_, BTree>> {
        self.check_writable()?;
        Ok(RefMut::map(self.tree.borrow_mut(), Arc::make_mut))
    }
}

/// A read-only or read-write transaction.
///
/// Read transactions never block each other or the writer. Only one write
/// transaction exists at a time; its changes become visible to transactions
/// started after `commit()` returns. Dropping a transaction without
/// committing rolls it back.
///
/// # Lifetime
///
/// The transaction borrows the database and must not outlive it. Buckets
/// and cursors obtained from it borrow the transaction.
pub struct Tx<'db> {
    db: &'db Database,
    state: TxState,
    /// Held for the whole life of a write transaction.
    _writer: Option<MutexGuard<'db, ()>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db Database, state: TxState, writer: Option<MutexGuard<'db, ()>>) -> Self {
        tracing::trace!(txid = state.txid(), writable = state.writable(), "began transaction");
        Self {
            db,
            state,
            _writer: writer,
        }
    }

    /// Returns the id of the snapshot this transaction reads.
    #[inline]
    pub fn id(&self) -> u64 {
        self.state.txid()
    }

    /// Returns true for a read-write transaction.
    #[inline]
    pub fn writable(&self) -> bool {
        self.state.writable()
    }

    /// Returns the database this transaction belongs to.
    #[inline]
    pub fn db(&self) -> &'db Database {
        self.db
    }

    /// Returns the root bucket. It holds only buckets.
    pub fn root(&self) -> Bucket<'_> {
        Bucket::root(&self.state)
    }

    /// Returns the size in bytes of the database image this transaction
    /// would write with [`Tx::write_to`].
    pub fn size(&self) -> u64 {
        DATA_OFFSET + db::encoded_data_len(&self.state.snapshot())
    }

    /// Writes a complete database image of this transaction's view to `w`.
    ///
    /// Returns the number of bytes written, always equal to [`Tx::size`].
    /// The image can be opened with [`Database::open`].
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let tree = self.state.snapshot();
        let data = db::encode_data(&tree);
        let meta = Meta::for_data(self.state.txid(), tree.len() as u64, DATA_OFFSET, &data);
        let page = meta.to_bytes();

        w.write_all(&page)?;
        w.write_all(&page)?;
        w.write_all(&data)?;
        w.flush()?;
        Ok(2 * page.len() as u64 + data.len() as u64)
    }

    /// Writes a database image of this transaction's view to a new file
    /// at `path`, created with the Unix permission `mode`.
    pub fn copy_file<P: AsRef<Path>>(&self, path: P, mode: u32) -> Result<()> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(path).map_err(|source| ErrorKind::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        self.write_to(&mut file)?;
        file.sync_all()?;
        Ok(())
    }

    /// Persists the changes and publishes them to new transactions.
    ///
    /// # Errors
    ///
    /// Returns `TxNotWritable` for a read-only transaction. If persisting
    /// fails the transaction is rolled back and the committed state is
    /// unchanged.
    pub fn commit(self) -> Result<()> {
        self.state.check_writable()?;
        let tree = self.state.snapshot();
        self.db.commit_tree(tree, self.state.txid() + 1)
    }

    /// Discards the transaction.
    pub fn rollback(self) -> Result<()> {
        tracing::trace!(txid = self.state.txid(), writable = self.state.writable(), "rolled back transaction");
        Ok(())
    }

    // Path-addressed operations. The last segment of a path names a key,
    // every segment before it a bucket descending from the root.

    /// Runs `f` with the bucket at `folders`, or returns `None` if any
    /// bucket along the way is missing.
    pub fn bucket<K, T, F>(&self, folders: &[K], f: F) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnOnce(&Bucket<'_>) -> Result<T>,
    {
        self.root().open_bucket(folders, f)
    }

    /// Returns the bucket at `folders`, creating every missing bucket.
    pub fn create_bucket_if_not_exists<K: AsRef<[u8]>>(&self, folders: &[K]) -> Result<Bucket<'_>> {
        self.root().create_bucket_path(folders)
    }

    /// Runs `f` with a cursor over the bucket at `folders`.
    ///
    /// An empty `folders` yields a cursor over the root, which visits the
    /// top-level bucket names. Returns `None` if a bucket is missing.
    pub fn cursor<K, T, F>(&self, folders: &[K], f: F) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnOnce(&mut Cursor<'_>) -> Result<T>,
    {
        self.root().open_bucket(folders, |bucket| f(&mut bucket.cursor()))
    }

    /// Runs `f` with the value at `path`, or returns `None` if it is absent.
    pub fn value<K, T, F>(&self, path: &[K], f: F) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnOnce(&[u8]) -> Result<T>,
    {
        self.root().value(path, f)
    }

    /// Stores `value` at `path`, creating every missing bucket.
    pub fn put<K: AsRef<[u8]>>(&self, path: &[K], value: &[u8]) -> Result<()> {
        self.root().put_path(path, value)
    }

    /// Deletes the value at `path`.
    ///
    /// A single-segment path deletes the whole top-level bucket of that name.
    /// Missing buckets or keys are not an error.
    pub fn delete<K: AsRef<[u8]>>(&self, path: &[K]) -> Result<()> {
        self.state.check_writable()?;
        let (folders, key) = split_path(path)?;
        if !folders.is_empty() {
            return self.root().delete_path(path);
        }
        match self.root().delete_bucket(key) {
            Err(err) if matches!(err.kind(), ErrorKind::BucketNotFound { .. }) => {
                tracing::trace!(bucket = %String::from_utf8_lossy(key), "delete of missing bucket ignored");
                Ok(())
            }
            other => other,
        }
    }

    /// Replaces the value at `path` with the result of `f`.
    ///
    /// `f` receives the current value, if any. Returning `Some` stores the
    /// new value, returning `None` deletes it. Missing buckets are created.
    pub fn update<K, F>(&self, path: &[K], f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        self.root().update_path(path, f)
    }

    /// Runs `f` for every key/value pair of the bucket at `folders`, in
    /// ascending key order. Nothing is visited if a bucket is missing.
    pub fn for_each<K, F>(&self, folders: &[K], mut f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnMut(&Bucket<'_>, &[u8], &[u8]) -> Result<()>,
    {
        self.root()
            .open_bucket(folders, |bucket| bucket.for_each(|k, v| f(bucket, k, v)))
            .map(|_| ())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.db.release_tx();
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id())
            .field("writable", &self.writable())
            .finish()
    }
}
