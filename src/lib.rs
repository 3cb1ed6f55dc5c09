//! Summary: Crate root for thunderbox.
//! Copyright (c) YOAB. All rights reserved.
//!
//! thunderbox is an embedded, single-file key-value store organized as a
//! tree of nested buckets, with two conveniences on top:
//!
//! - **Path-addressed access.** Every transaction operation takes an ordered
//!   list of segments: all but the last name buckets descending from the
//!   root, the last names the key. Reads stop at the first missing bucket
//!   and report the value as absent; writes create missing buckets.
//! - **A shared handle.** [`RefCountBox`] opens the database on first use,
//!   hands out [`Lease`]s, and closes it when the last lease is dropped.
//!
//! ```no_run
//! use thunderbox::{Database, DatabaseOptions, DEFAULT_MODE};
//!
//! let db = Database::open("/tmp/example.db", DEFAULT_MODE, DatabaseOptions::default())?;
//! db.update(|tx| tx.put(&["config", "net", "port"], b"8080"))?;
//!
//! let port = db.view(|tx| tx.value(&["config", "net", "port"], |v| Ok(v.to_vec())))?;
//! assert_eq!(port.as_deref(), Some(&b"8080"[..]));
//!
//! // A single segment names a top-level bucket: this removes "config".
//! db.update(|tx| tx.delete(&["config"]))?;
//! # Ok::<(), thunderbox::Error>(())
//! ```

mod batch;
mod btree;
mod bucket;
mod codec;
mod concurrent;
mod cursor;
mod db;
mod error;
mod meta;
mod page;
mod path;
mod refbox;
mod tx;

pub use batch::{BatchConfig, Batcher};
pub use bucket::{Bucket, MAX_BUCKET_NAME_LEN, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use cursor::{Cursor, CursorItem};
pub use db::{DEFAULT_MODE, Database, DatabaseOptions, LockMode};
pub use error::{Error, ErrorKind, Result};
pub use path::{Resolve, resolve, split_path};
pub use refbox::{Lease, RefCountBox};
pub use tx::Tx;
