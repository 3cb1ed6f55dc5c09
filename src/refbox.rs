//! Summary: Reference-counted, lazily opened shared database handle.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A [`RefCountBox`] lets unrelated owners share one open [`Database`]. The
//! first [`RefCountBox::acquire`] opens the file; every acquire hands out a
//! [`Lease`], and dropping the last lease closes the database again.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::db::{DEFAULT_MODE, Database, DatabaseOptions, lock};
use crate::error::{ErrorKind, Result};
use crate::tx::Tx;

type DataPathFn = Box<dyn Fn() -> PathBuf + Send + Sync + 'static>;
type OpenFn = Box<dyn Fn(&Path) -> Result<Database> + Send + Sync + 'static>;

struct BoxState {
    db: Option<Arc<Database>>,
    count: usize,
}

/// A reference-count guarded, lazily opened database.
///
/// Invariant: the database is open exactly while at least one [`Lease`] is
/// outstanding. The internal mutex is held while opening and closing, never
/// while a transaction runs.
///
/// # Example
///
/// ```no_run
/// use thunderbox::RefCountBox;
///
/// let shared = RefCountBox::new("/var/lib/app/data.db");
/// shared.update(|tx| tx.put(&["users", "alice"], b"admin"))?;
/// let role = shared.view(|tx| tx.value(&["users", "alice"], |v| Ok(v.to_vec())))?;
/// assert_eq!(role.as_deref(), Some(&b"admin"[..]));
/// # Ok::<(), thunderbox::Error>(())
/// ```
pub struct RefCountBox {
    state: Mutex<BoxState>,
    data_path: Option<DataPathFn>,
    open_fn: Option<OpenFn>,
}

impl RefCountBox {
    /// Creates a box for the database file at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self::with_data_path(move || path.clone())
    }

    /// Creates a box that asks `data_path` for the file path each time the
    /// database has to be opened.
    pub fn with_data_path<F>(data_path: F) -> Self
    where
        F: Fn() -> PathBuf + Send + Sync + 'static,
    {
        Self {
            data_path: Some(Box::new(data_path)),
            ..Self::default()
        }
    }

    /// Replaces how the database is opened.
    ///
    /// Without it, [`Database::open`] is used with mode `0o644` and default
    /// options.
    pub fn with_open_fn<F>(mut self, open_fn: F) -> Self
    where
        F: Fn(&Path) -> Result<Database> + Send + Sync + 'static,
    {
        self.open_fn = Some(Box::new(open_fn));
        self
    }

    /// Opens the database if needed and adds a reference to it.
    ///
    /// # Errors
    ///
    /// Returns `DataPathNotSpecified` if the box has no data path, or the
    /// error of the open function. On failure nothing changes.
    pub fn acquire(&self) -> Result<Lease<'_>> {
        let mut state = lock(&self.state);

        let db = match state.db.clone() {
            Some(db) => db,
            None => {
                let db = Arc::new(self.open_database()?);
                state.db = Some(Arc::clone(&db));
                state.count = 0;
                db
            }
        };

        state.count += 1;
        Ok(Lease { owner: self, db })
    }

    fn open_database(&self) -> Result<Database> {
        let data_path = self.data_path.as_ref().ok_or(ErrorKind::DataPathNotSpecified)?;
        let path = data_path();
        let db = match &self.open_fn {
            Some(open_fn) => open_fn(&path),
            None => Database::open(&path, DEFAULT_MODE, DatabaseOptions::default()),
        }
        .inspect_err(|err| {
            tracing::debug!(path = %path.display(), error = %err, "box failed to open database");
        })?;
        tracing::debug!(path = %path.display(), "box opened database");
        Ok(db)
    }

    /// Drops one reference and closes the database when none are left.
    fn release(&self) {
        let mut state = lock(&self.state);
        state.count = state.count.saturating_sub(1);
        if state.count > 0 {
            return;
        }
        let Some(db) = state.db.take() else {
            return;
        };
        match db.close() {
            Ok(()) => tracing::debug!(path = %db.path().display(), "box closed database"),
            Err(err) => {
                // The database still holds its file lock; the next acquire reuses it.
                tracing::warn!(
                    path = %db.path().display(),
                    error = %err,
                    "box failed to close database, keeping it open"
                );
                state.db = Some(db);
            }
        }
    }

    /// Returns the number of outstanding leases.
    pub fn count(&self) -> usize {
        lock(&self.state).count
    }

    /// Returns true while the database is open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).db.is_some()
    }

    /// Runs `f` in a read-only transaction on the shared database.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        self.acquire()?.view(f)
    }

    /// Runs `f` in a read-write transaction on the shared database.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        self.acquire()?.update(f)
    }

    /// Runs `f` through [`Database::batch`] on the shared database.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Tx<'_>) -> Result<()> + Send + 'static,
    {
        self.acquire()?.batch(f)
    }
}

impl Default for RefCountBox {
    /// Creates a box without a data path; every acquire fails with
    /// `DataPathNotSpecified` until one is configured.
    fn default() -> Self {
        Self {
            state: Mutex::new(BoxState { db: None, count: 0 }),
            data_path: None,
            open_fn: None,
        }
    }
}

impl fmt::Debug for RefCountBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RefCountBox")
            .field("open", &state.db.is_some())
            .field("count", &state.count)
            .field("custom_open", &self.open_fn.is_some())
            .finish()
    }
}

/// A reference to the database held by a [`RefCountBox`].
///
/// Dereferences to [`Database`]. Dropping the lease releases the
/// reference; the last one closes the database.
pub struct Lease<'b> {
    owner: &'b RefCountBox,
    db: Arc<Database>,
}

impl Lease<'_> {
    /// Releases the reference. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Deref for Lease<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

impl fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("path", &self.db.path()).finish()
    }
}
