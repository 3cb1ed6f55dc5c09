//! Summary: Database open/close and core management logic.
//! Copyright (c) YOAB. All rights reserved.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::batch::{BatchConfig, Batcher};
use crate::btree::BTree;
use crate::concurrent;
use crate::error::{ErrorKind, Result};
use crate::meta::Meta;
use crate::page::{DATA_OFFSET, PAGE_SIZE, meta_page_offset};
use crate::tx::{Tx, TxState};

/// Default Unix permission mode for new database files.
pub const DEFAULT_MODE: u32 = 0o644;

/// Interval between attempts to take a contended file lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How the database file is locked against other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Wait for the lock, up to [`DatabaseOptions::timeout`].
    #[default]
    Blocking,
    /// Fail with `Timeout` at once if the lock is held elsewhere.
    NonBlocking,
    /// Do not lock the file.
    Disabled,
}

/// Options for [`Database::open`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// How long to wait for the file lock. Zero waits indefinitely.
    pub timeout: Duration,
    /// Open read-only with a shared lock. Write transactions fail.
    pub read_only: bool,
    /// Expected size of the data section in bytes; pre-sizes the load buffer.
    pub mmap_size_hint: usize,
    /// File locking behavior.
    pub lock_mode: LockMode,
    /// Preallocate the file to at least this many bytes.
    pub initial_size: u64,
    /// Maximum number of calls coalesced into one batch transaction.
    pub max_batch_size: usize,
    /// Maximum time a batch waits for more calls.
    pub max_batch_delay: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            timeout: Duration::ZERO,
            read_only: false,
            mmap_size_hint: 0,
            lock_mode: LockMode::Blocking,
            initial_size: 0,
            max_batch_size: batch.max_batch_size,
            max_batch_delay: batch.max_wait,
        }
    }
}

/// The committed tree and the meta page describing it on disk.
struct Committed {
    tree: Arc<BTree>,
    meta: Meta,
}

struct Lifecycle {
    open: bool,
    active_txs: usize,
}

/// The main database handle.
///
/// A `Database` represents an open thunderbox database file. It is shared
/// between threads by reference or through an `Arc`.
///
/// # Concurrency
///
/// - Multiple read transactions can be active concurrently.
/// - Only one write transaction can be active at a time; `begin(true)`
///   blocks until the current writer finishes.
/// - Readers never wait for the writer; they see the last committed tree.
pub struct Database {
    /// Path to the database file.
    path: PathBuf,
    options: DatabaseOptions,
    /// The underlying file handle; `None` once closed.
    file: Mutex<Option<File>>,
    committed: RwLock<Committed>,
    /// Held by the active write transaction.
    writer: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    batcher: Batcher,
}

impl Database {
    /// Opens a database at the given path, creating it with the Unix
    /// permission `mode` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created, if the
    /// file lock is not acquired in time, or if the file is corrupted.
    pub fn open<P: AsRef<Path>>(path: P, mode: u32, options: DatabaseOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut open_options = OpenOptions::new();
        open_options.read(true);
        if !options.read_only {
            open_options.write(true).create(true).truncate(false);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = open_options.open(&path).map_err(|source| ErrorKind::FileOpen {
            path: path.clone(),
            source,
        })?;
        Self::lock_file(&file, &options)?;

        let file_len = file.metadata()?.len();
        let (meta, tree) = if file_len == 0 {
            if options.read_only {
                return Err(ErrorKind::Corrupted {
                    context: "opening read-only database",
                    details: "file is empty".to_string(),
                }
                .into());
            }
            (Self::init_db(&file)?, BTree::new())
        } else {
            let meta = Self::load_meta(&file)?;
            let tree = Self::load_tree(&file, &meta, options.mmap_size_hint)?;
            (meta, tree)
        };

        if !options.read_only && options.initial_size > file.metadata()?.len() {
            Self::preallocate(&file, options.initial_size)?;
        }

        tracing::debug!(
            path = %path.display(),
            txid = meta.txid,
            entries = tree.len(),
            read_only = options.read_only,
            "opened database"
        );

        let batcher = Batcher::new(BatchConfig {
            max_wait: options.max_batch_delay,
            max_batch_size: options.max_batch_size,
        });
        Ok(Self {
            path,
            options,
            file: Mutex::new(Some(file)),
            committed: RwLock::new(Committed {
                tree: Arc::new(tree),
                meta,
            }),
            writer: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                open: true,
                active_txs: 0,
            }),
            batcher,
        })
    }

    /// Initializes a new database file with two meta pages and an empty
    /// data section.
    fn init_db(file: &File) -> Result<Meta> {
        let data = encode_data(&BTree::new());
        let meta = Meta::for_data(0, 0, DATA_OFFSET, &data);
        let page = meta.to_bytes();

        write_at(file, meta_page_offset(0), &page)?;
        write_at(file, meta_page_offset(1), &page)?;
        write_at(file, DATA_OFFSET, &data)?;
        file.sync_all()?;

        tracing::debug!("initialized new database file");
        Ok(meta)
    }

    /// Loads and validates meta pages from an existing database file.
    fn load_meta(file: &File) -> Result<Meta> {
        let mut buf = vec![0u8; 2 * PAGE_SIZE];
        read_at(file, 0, &mut buf).map_err(|e| ErrorKind::Corrupted {
            context: "reading meta pages",
            details: e.to_string(),
        })?;
        let meta0 = Meta::from_bytes(&buf[..PAGE_SIZE]);
        let meta1 = Meta::from_bytes(&buf[PAGE_SIZE..]);

        // Select the valid meta page with the highest txid.
        match (meta0, meta1) {
            (Some(m0), Some(m1)) => match (m0.validate(), m1.validate()) {
                (false, false) => Err(ErrorKind::BothMetaPagesInvalid.into()),
                (false, true) => Ok(m1),
                (true, false) => Ok(m0),
                (true, true) if m1.txid > m0.txid => Ok(m1),
                (true, true) => Ok(m0),
            },
            (Some(m), None) if m.validate() => Ok(m),
            (Some(_), None) => Err(ErrorKind::InvalidMetaPage {
                page_number: 0,
                reason: "meta page 0 parsed but failed validation",
            }
            .into()),
            (None, Some(m)) if m.validate() => Ok(m),
            (None, Some(_)) => Err(ErrorKind::InvalidMetaPage {
                page_number: 1,
                reason: "meta page 1 parsed but failed validation",
            }
            .into()),
            (None, None) => Err(ErrorKind::BothMetaPagesInvalid.into()),
        }
    }

    /// Loads the tree from the data section described by `meta`.
    fn load_tree(file: &File, meta: &Meta, size_hint: usize) -> Result<BTree> {
        let file_len = file.metadata()?.len();
        if meta.data_end() > file_len {
            return Err(ErrorKind::Corrupted {
                context: "loading data section",
                details: format!(
                    "data section ends at {} but the file is {file_len} bytes",
                    meta.data_end()
                ),
            }
            .into());
        }

        let data_len = usize::try_from(meta.data_len).map_err(|_| ErrorKind::Corrupted {
            context: "loading data section",
            details: format!("data length {} does not fit in memory", meta.data_len),
        })?;
        let mut data = Vec::with_capacity(data_len.max(size_hint));
        data.resize(data_len, 0);
        read_at(file, meta.data_offset, &mut data)?;

        let checksum = concurrent::checksum(&data);
        if checksum != meta.data_checksum {
            return Err(ErrorKind::Corrupted {
                context: "loading data section",
                details: format!(
                    "checksum mismatch: expected {:#010x}, found {checksum:#010x}",
                    meta.data_checksum
                ),
            }
            .into());
        }

        decode_data(&data, meta.entry_count)
    }

    /// Locks the file against other processes according to `options`.
    #[cfg(unix)]
    fn lock_file(file: &File, options: &DatabaseOptions) -> Result<()> {
        if options.lock_mode == LockMode::Disabled {
            return Ok(());
        }
        let operation = if options.read_only {
            libc::LOCK_SH
        } else {
            libc::LOCK_EX
        };

        let started = Instant::now();
        loop {
            // SAFETY: flock is a standard POSIX call, safe with a valid fd.
            let ret = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
            if ret == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => {}
                _ => return Err(err.into()),
            }
            if options.lock_mode == LockMode::NonBlocking {
                return Err(ErrorKind::Timeout.into());
            }
            if !options.timeout.is_zero() && started.elapsed() >= options.timeout {
                return Err(ErrorKind::Timeout.into());
            }
            thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    #[cfg(not(unix))]
    fn lock_file(_file: &File, _options: &DatabaseOptions) -> Result<()> {
        Ok(())
    }

    /// Grows the file to `size` bytes, allocating blocks where supported.
    fn preallocate(file: &File, size: u64) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let len = libc::off_t::try_from(size).map_err(|_| ErrorKind::Corrupted {
                context: "preallocating database file",
                details: format!("size {size} exceeds the platform limit"),
            })?;
            // SAFETY: posix_fallocate is a standard POSIX call, safe with a valid fd.
            let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
            if ret == 0 {
                return Ok(());
            }
            // Filesystems without fallocate support fall through to set_len.
            if ret != libc::EOPNOTSUPP && ret != libc::EINVAL {
                return Err(io::Error::from_raw_os_error(ret).into());
            }
        }
        file.set_len(size)?;
        Ok(())
    }

    /// Writes `tree` as transaction `txid` and publishes it to new
    /// transactions.
    ///
    /// The data section is placed where it does not overlap the one the
    /// current meta page describes, then the meta page selected by txid
    /// parity is rewritten. Each step is followed by `fdatasync`.
    pub(crate) fn commit_tree(&self, tree: Arc<BTree>, txid: u64) -> Result<()> {
        let current = self.read_committed().meta;
        let data = encode_data(&tree);
        let data_offset = if DATA_OFFSET + data.len() as u64 <= current.data_offset {
            DATA_OFFSET
        } else {
            current.data_end()
        };
        let meta = Meta::for_data(txid, tree.len() as u64, data_offset, &data);
        let meta_page = if txid.is_multiple_of(2) { 0 } else { 1 };

        {
            let guard = lock(&self.file);
            let file = guard.as_ref().ok_or(ErrorKind::DatabaseClosed)?;
            write_at(file, data_offset, &data).map_err(|source| commit_failed("writing data section", source))?;
            fdatasync(file).map_err(|source| commit_failed("syncing data section", source))?;
            write_at(file, meta_page_offset(meta_page), &meta.to_bytes())
                .map_err(|source| commit_failed("writing meta page", source))?;
            fdatasync(file).map_err(|source| commit_failed("syncing meta page", source))?;
        }

        *self.write_committed() = Committed { tree, meta };
        tracing::debug!(
            txid,
            entries = meta.entry_count,
            bytes = meta.data_len,
            offset = data_offset,
            "committed transaction"
        );
        Ok(())
    }

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the options the database was opened with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Returns true if the database was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Returns true once [`Database::close`] has succeeded.
    pub fn is_closed(&self) -> bool {
        !lock(&self.lifecycle).open
    }

    /// Returns the number of transactions currently open.
    pub fn active_transactions(&self) -> usize {
        lock(&self.lifecycle).active_txs
    }

    /// Returns the batch coordinator, for its statistics.
    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    fn read_committed(&self) -> RwLockReadGuard<'_, Committed> {
        self.committed.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_committed(&self) -> RwLockWriteGuard<'_, Committed> {
        self.committed.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begins a transaction.
    ///
    /// Read transactions see the tree committed when they begin. A write
    /// transaction waits until no other write transaction is active.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after close and `DatabaseReadOnly` for a
    /// write transaction on a read-only database.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        if writable && self.options.read_only {
            return Err(ErrorKind::DatabaseReadOnly.into());
        }
        let writer = if writable { Some(lock(&self.writer)) } else { None };

        {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.open {
                return Err(ErrorKind::DatabaseClosed.into());
            }
            lifecycle.active_txs += 1;
        }

        let (tree, txid) = {
            let committed = self.read_committed();
            (Arc::clone(&committed.tree), committed.meta.txid)
        };
        Ok(Tx::new(self, TxState::new(tree, writable, txid), writer))
    }

    /// Called when a transaction is dropped.
    pub(crate) fn release_tx(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.active_txs = lifecycle.active_txs.saturating_sub(1);
    }

    /// Runs `f` in a read-only transaction.
    ///
    /// The transaction is always rolled back. An error from `f` is returned
    /// in preference to a rollback error.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let tx = self.begin(false)?;
        let result = f(&tx);
        match tx.rollback() {
            Ok(()) => result,
            Err(rollback_err) if result.is_err() => {
                tracing::warn!(error = %rollback_err, "rollback failed after view error");
                result
            }
            Err(rollback_err) => Err(rollback_err),
        }
    }

    /// Runs `f` in a read-write transaction.
    ///
    /// The transaction is committed if `f` succeeds and rolled back if it
    /// fails or panics. An error from `f` is returned in preference to a
    /// rollback error.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed after update error");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` in a write transaction shared with concurrent batch calls.
    ///
    /// Calls arriving within `max_batch_delay` of each other, up to
    /// `max_batch_size`, are committed together. If `f` fails it is rerun
    /// alone and its own error is returned, so `f` may run more than once
    /// and must be idempotent. A panic in `f` is caught and returned to this
    /// caller as `BatchPanicked`. If the shared commit fails every caller gets
    /// `BatchFailed`.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Tx<'_>) -> Result<()> + Send + 'static,
    {
        if self.options.read_only {
            return Err(ErrorKind::DatabaseReadOnly.into());
        }
        self.batcher.submit(self, Box::new(f))
    }

    /// Flushes file data to disk.
    pub fn sync(&self) -> Result<()> {
        let guard = lock(&self.file);
        let file = guard.as_ref().ok_or(ErrorKind::DatabaseClosed)?;
        fdatasync(file)?;
        Ok(())
    }

    /// Closes the database, releasing the file and its lock.
    ///
    /// Closing an already closed database is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TxStillOpen` while any transaction is open.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.open {
            return Ok(());
        }
        if lifecycle.active_txs > 0 {
            return Err(ErrorKind::TxStillOpen {
                count: lifecycle.active_txs,
            }
            .into());
        }
        lifecycle.open = false;

        // Dropping the handle closes the descriptor and releases the flock.
        drop(lock(&self.file).take());
        self.write_committed().tree = Arc::new(BTree::new());

        tracing::debug!(path = %self.path.display(), "closed database");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("read_only", &self.options.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn commit_failed(reason: &str, source: io::Error) -> crate::Error {
    ErrorKind::TxCommitFailed {
        reason: reason.to_string(),
        source,
    }
    .into()
}

/// Returns the encoded size of the data section for `tree`.
pub(crate) fn encoded_data_len(tree: &BTree) -> u64 {
    8 + tree
        .iter()
        .map(|(key, value)| concurrent::encoded_entry_len(key, value) as u64)
        .sum::<u64>()
}

/// Encodes the data section: entry count, then each entry in key order.
pub(crate) fn encode_data(tree: &BTree) -> Vec<u8> {
    let entries: Vec<(&[u8], &[u8])> = tree.iter().collect();
    let prepared = concurrent::prepare_entries_parallel(&entries);

    let total = 8 + prepared.iter().map(Vec::len).sum::<usize>();
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in &prepared {
        data.extend_from_slice(entry);
    }
    data
}

/// Sequential reader over an encoded data section.
struct DataReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ErrorKind::Corrupted {
                context: "decoding data section",
                details: format!(
                    "{field} at offset {} runs past the end ({} bytes)",
                    self.pos,
                    self.data.len()
                ),
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, field)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Decodes a data section holding `expected_count` entries.
fn decode_data(data: &[u8], expected_count: u64) -> Result<BTree> {
    let mut tree = BTree::new();
    if data.is_empty() && expected_count == 0 {
        return Ok(tree);
    }

    let mut reader = DataReader { data, pos: 0 };
    let entry_count = reader.u64("entry count")?;
    if entry_count != expected_count {
        return Err(ErrorKind::Corrupted {
            context: "decoding data section",
            details: format!("entry count {entry_count} does not match meta count {expected_count}"),
        }
        .into());
    }

    for _ in 0..entry_count {
        let key_len = reader.u32("key length")? as usize;
        let key = reader.take(key_len, "key")?.to_vec();
        let value_len = reader.u32("value length")? as usize;
        let value = reader.take(value_len, "value")?.to_vec();
        tree.insert(key, value);
    }

    if reader.remaining() != 0 {
        return Err(ErrorKind::Corrupted {
            context: "decoding data section",
            details: format!("{} trailing bytes after the last entry", reader.remaining()),
        }
        .into());
    }
    Ok(tree)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn write_at(mut file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// Performs fdatasync on Unix systems, falling back to sync_all elsewhere.
/// fdatasync is faster than fsync because it doesn't sync file metadata.
#[inline]
fn fdatasync(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
        let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_default(path: &Path) -> Database {
        Database::open(path, DEFAULT_MODE, DatabaseOptions::default()).unwrap()
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.db");

        let db = open_default(&path);
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
        assert!(!db.is_closed());
        assert!(std::fs::metadata(&path).unwrap().len() >= DATA_OFFSET);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.db");
        let _db = Database::open(&path, 0o600, DatabaseOptions::default()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");

        {
            let db = open_default(&path);
            for i in 0..5u32 {
                db.update(|tx| tx.put(&["nums".as_bytes(), &i.to_be_bytes()], &i.to_le_bytes()))
                    .unwrap();
            }
            db.close().unwrap();
        }

        let db = open_default(&path);
        let count = db
            .view(|tx| {
                let mut count = 0u32;
                tx.for_each(&["nums"], |_, k, v| {
                    assert_eq!(k.len(), 4);
                    assert_eq!(v.len(), 4);
                    count += 1;
                    Ok(())
                })?;
                Ok(count)
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_commit_alternates_data_placement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.db");
        let db = open_default(&path);

        let mut offsets = Vec::new();
        for i in 0..4u32 {
            db.update(|tx| tx.put(&["b".as_bytes(), &i.to_be_bytes()], b"v")).unwrap();
            offsets.push(db.read_committed().meta.data_offset);
        }
        for pair in offsets.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        db.close().unwrap();
        let db = open_default(&path);
        let tx = db.begin(false).unwrap();
        assert_eq!(tx.id(), 4);
    }

    #[test]
    fn test_newer_meta_wins_and_corrupt_meta_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let db = open_default(&path);
            db.update(|tx| tx.put(&["b", "k"], b"first")).unwrap();
            db.update(|tx| tx.put(&["b", "k"], b"second")).unwrap();
            db.close().unwrap();
        }

        // txid 2 lives in meta page 0; damage it so page 1 (txid 1) is used.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let db = open_default(&path);
        let value = db.view(|tx| tx.value(&["b", "k"], |v| Ok(v.to_vec()))).unwrap();
        assert_eq!(value, Some(b"first".to_vec()));
    }

    #[test]
    fn test_both_meta_pages_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xABu8; 3 * PAGE_SIZE]).unwrap();

        let err = Database::open(&path, DEFAULT_MODE, DatabaseOptions::default()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BothMetaPagesInvalid));
    }

    #[test]
    fn test_corrupt_data_section_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let data_offset = {
            let db = open_default(&path);
            db.update(|tx| tx.put(&["b", "k"], b"value")).unwrap();
            let offset = db.read_committed().meta.data_offset;
            db.close().unwrap();
            offset
        };

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[data_offset as usize + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = Database::open(&path, DEFAULT_MODE, DatabaseOptions::default()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Corrupted { .. }));
    }

    #[test]
    fn test_close_with_open_tx_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_default(&dir.path().join("close.db"));

        let tx = db.begin(false).unwrap();
        assert_eq!(db.active_transactions(), 1);
        assert!(matches!(
            db.close().unwrap_err().kind(),
            ErrorKind::TxStillOpen { count: 1 }
        ));
        drop(tx);

        db.close().unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.begin(false).unwrap_err().kind(), ErrorKind::DatabaseClosed));
        assert!(matches!(db.sync().unwrap_err().kind(), ErrorKind::DatabaseClosed));
    }

    #[test]
    fn test_update_error_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_default(&dir.path().join("rollback.db"));

        let err = db
            .update(|tx| {
                tx.put(&["b", "k"], b"v")?;
                Err::<(), _>(crate::Error::callback("abort"))
            })
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Callback(_)));

        let value = db.view(|tx| tx.value(&["b", "k"], |v| Ok(v.to_vec()))).unwrap();
        assert_eq!(value, None);
        assert_eq!(db.active_transactions(), 0);
    }

    #[test]
    fn test_update_panic_releases_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_default(&dir.path().join("panic.db"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = db.update(|tx| -> Result<()> {
                tx.put(&["b", "k"], b"v")?;
                panic!("work function panicked");
            });
        }));
        assert!(result.is_err());
        assert_eq!(db.active_transactions(), 0);

        // The writer lock is usable again.
        db.update(|tx| tx.put(&["b", "k"], b"after")).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_read_only_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let db = open_default(&path);
            db.update(|tx| tx.put(&["b", "k"], b"v")).unwrap();
            db.close().unwrap();
        }

        let options = DatabaseOptions {
            read_only: true,
            ..DatabaseOptions::default()
        };
        let db = Database::open(&path, DEFAULT_MODE, options).unwrap();
        assert!(db.is_read_only());
        assert!(matches!(db.begin(true).unwrap_err().kind(), ErrorKind::DatabaseReadOnly));
        let value = db.view(|tx| tx.value(&["b", "k"], |v| Ok(v.to_vec()))).unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let _holder = open_default(&path);

        let options = DatabaseOptions {
            timeout: Duration::from_millis(100),
            ..DatabaseOptions::default()
        };
        let err = Database::open(&path, DEFAULT_MODE, options).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout));

        let options = DatabaseOptions {
            lock_mode: LockMode::NonBlocking,
            ..DatabaseOptions::default()
        };
        let err = Database::open(&path, DEFAULT_MODE, options).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout));
    }

    #[test]
    fn test_initial_size_preallocates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealloc.db");
        let options = DatabaseOptions {
            initial_size: 1 << 20,
            ..DatabaseOptions::default()
        };
        let _db = Database::open(&path, DEFAULT_MODE, options).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() >= 1 << 20);
    }

    #[test]
    fn test_decode_data_rejects_truncation() {
        let mut tree = BTree::new();
        tree.insert(b"key".to_vec(), b"value".to_vec());
        let data = encode_data(&tree);
        assert_eq!(data.len() as u64, encoded_data_len(&tree));

        assert_eq!(decode_data(&data, 1).unwrap(), tree);
        assert!(decode_data(&data[..data.len() - 1], 1).is_err());
        assert!(decode_data(&data, 2).is_err());
    }
}
