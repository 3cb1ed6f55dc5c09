//! Summary: Integration tests for path-addressed access through transactions.
//! Copyright (c) YOAB. All rights reserved.
//!
//! These tests drive the public API end to end:
//! - Put, read, iterate and delete along nested paths
//! - Ordering and absence properties over shuffled key sets
//! - Persistence of nested buckets across reopen

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use thunderbox::{DEFAULT_MODE, Database, DatabaseOptions, ErrorKind};

fn open(dir: &TempDir) -> Database {
    Database::open(dir.path().join("paths.db"), DEFAULT_MODE, DatabaseOptions::default())
        .expect("open should succeed")
}

fn read(db: &Database, path: &[&str]) -> Option<Vec<u8>> {
    db.view(|tx| tx.value(path, |v| Ok(v.to_vec())))
        .expect("view should succeed")
}

fn collect(db: &Database, folders: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
    db.view(|tx| {
        let mut seen = Vec::new();
        tx.for_each(folders, |_, k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        Ok(seen)
    })
    .expect("view should succeed")
}

// =============================================================================
// Basic scenario
// =============================================================================

#[test]
fn test_put_value_for_each_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.update(|tx| tx.put(&["a", "b"], b"hello"))
        .expect("put should succeed");
    assert_eq!(read(&db, &["a", "b"]), Some(b"hello".to_vec()));
    assert_eq!(collect(&db, &["a"]), vec![(b"b".to_vec(), b"hello".to_vec())]);

    db.update(|tx| tx.delete(&["a", "b"]))
        .expect("delete should succeed");
    assert_eq!(read(&db, &["a", "b"]), None);
    assert!(collect(&db, &["a"]).is_empty());

    // A single segment removes the top-level bucket; repeating it is a no-op.
    db.update(|tx| tx.delete(&["a"])).expect("delete should succeed");
    assert!(db.view(|tx| tx.bucket(&["a"], |_| Ok(()))).unwrap().is_none());
    db.update(|tx| tx.delete(&["a"])).expect("second delete should succeed");
}

#[test]
fn test_reads_through_missing_buckets_are_absent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    assert_eq!(read(&db, &["nope", "deeper", "key"]), None);
    assert!(collect(&db, &["nope"]).is_empty());

    // Nothing was created by the reads above.
    let created = db
        .view(|tx| tx.cursor(&[] as &[&str], |c| Ok(c.first())))
        .unwrap();
    assert_eq!(created, Some(None));
}

#[test]
fn test_deletes_through_missing_buckets_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.update(|tx| tx.delete(&["x", "y", "z"]))
        .expect("delete should succeed");
    db.update(|tx| tx.delete(&["x"])).expect("delete should succeed");
}

#[test]
fn test_empty_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let err = db.update(|tx| tx.put(&[] as &[&str], b"v")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::EmptyPath));
    let err = db.update(|tx| tx.delete(&[] as &[&str])).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::EmptyPath));
}

#[test]
fn test_put_at_root_is_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let err = db.update(|tx| tx.put(&["lonely"], b"v")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IncompatibleValue));
    assert_eq!(read(&db, &["lonely"]), None);
}

#[test]
fn test_writes_in_read_only_tx_fail() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let err = db.view(|tx| tx.put(&["a", "b"], b"v")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TxNotWritable));
    let err = db.view(|tx| tx.delete(&["a"])).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TxNotWritable));
}

#[test]
fn test_update_transforms_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.update(|tx| {
        tx.update(&["counters", "hits"], |current| {
            assert!(current.is_none());
            Ok(Some(1u64.to_le_bytes().to_vec()))
        })
    })
    .unwrap();

    for _ in 0..4 {
        db.update(|tx| {
            tx.update(&["counters", "hits"], |current| {
                let bytes: [u8; 8] = current.unwrap().try_into().unwrap();
                Ok(Some((u64::from_le_bytes(bytes) + 1).to_le_bytes().to_vec()))
            })
        })
        .unwrap();
    }
    assert_eq!(read(&db, &["counters", "hits"]), Some(5u64.to_le_bytes().to_vec()));

    db.update(|tx| tx.update(&["counters", "hits"], |_| Ok(None)))
        .unwrap();
    assert_eq!(read(&db, &["counters", "hits"]), None);
}

#[test]
fn test_callback_error_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let err = db
        .update(|tx| {
            tx.put(&["a", "b"], b"v")?;
            Err::<(), _>(thunderbox::Error::callback("abort"))
        })
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Callback(_)));
    assert_eq!(read(&db, &["a", "b"]), None);
}

// =============================================================================
// Properties over shuffled key sets
// =============================================================================

#[test]
fn test_for_each_visits_each_key_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let mut rng = StdRng::seed_from_u64(0x7b0c);

    let mut keys: Vec<Vec<u8>> = (0..500u32)
        .map(|i| {
            let mut key = i.to_be_bytes().to_vec();
            key.push(rng.r#gen::<u8>());
            key
        })
        .collect();
    keys.shuffle(&mut rng);

    db.update(|tx| {
        for key in &keys {
            tx.put(&[&b"p"[..], &b"q"[..], key.as_slice()], key)?;
        }
        Ok(())
    })
    .unwrap();

    let seen = db
        .view(|tx| {
            let mut seen = Vec::new();
            tx.for_each(&[&b"p"[..], &b"q"[..]], |_, k, v| {
                assert_eq!(k, v);
                seen.push(k.to_vec());
                Ok(())
            })?;
            Ok(seen)
        })
        .unwrap();

    keys.sort();
    assert_eq!(seen, keys);
}

#[test]
fn test_unwritten_paths_read_absent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let mut rng = StdRng::seed_from_u64(42);

    let mut written: Vec<String> = (0..200).map(|i| format!("k{i:04}")).collect();
    written.shuffle(&mut rng);
    let (kept, never) = written.split_at(100);

    db.update(|tx| {
        for key in kept {
            tx.put(&["bucket", key.as_str()], key.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    for key in kept {
        assert_eq!(read(&db, &["bucket", key.as_str()]), Some(key.as_bytes().to_vec()));
    }
    for key in never {
        assert_eq!(read(&db, &["bucket", key.as_str()]), None);
        assert_eq!(read(&db, &["other", key.as_str()]), None);
    }
}

#[test]
fn test_random_puts_and_deletes_match_model() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let mut rng = StdRng::seed_from_u64(7);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for round in 0..20 {
        db.update(|tx| {
            for _ in 0..25 {
                let key = format!("k{:03}", rng.gen_range(0..60));
                if rng.gen_bool(0.3) {
                    tx.delete(&["m", key.as_str()])?;
                    model.remove(key.as_bytes());
                } else {
                    let value = format!("v{round}");
                    tx.put(&["m", key.as_str()], value.as_bytes())?;
                    model.insert(key.into_bytes(), value.into_bytes());
                }
            }
            Ok(())
        })
        .unwrap();
    }

    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(collect(&db, &["m"]), expected);
}

// =============================================================================
// Nested buckets
// =============================================================================

#[test]
fn test_for_each_skips_nested_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.update(|tx| {
        tx.put(&["top", "k1"], b"v1")?;
        tx.put(&["top", "inner", "k2"], b"v2")?;
        tx.put(&["top", "k3"], b"v3")
    })
    .unwrap();

    assert_eq!(
        collect(&db, &["top"]),
        vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k3".to_vec(), b"v3".to_vec())]
    );
    assert_eq!(collect(&db, &["top", "inner"]), vec![(b"k2".to_vec(), b"v2".to_vec())]);

    // The cursor shows the nested bucket with no value.
    let items = db
        .view(|tx| {
            tx.cursor(&["top"], |c| {
                let mut items = Vec::new();
                let mut item = c.first();
                while let Some(entry) = item {
                    items.push(entry);
                    item = c.next();
                }
                Ok(items)
            })
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        items,
        vec![
            (b"inner".to_vec(), None),
            (b"k1".to_vec(), Some(b"v1".to_vec())),
            (b"k3".to_vec(), Some(b"v3".to_vec())),
        ]
    );
}

#[test]
fn test_deleting_top_level_bucket_removes_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.update(|tx| {
        tx.put(&["a", "b", "c", "d"], b"deep")?;
        tx.put(&["a", "x"], b"shallow")?;
        tx.put(&["z", "k"], b"other")
    })
    .unwrap();

    db.update(|tx| tx.delete(&["a"])).unwrap();

    assert_eq!(read(&db, &["a", "b", "c", "d"]), None);
    assert_eq!(read(&db, &["a", "x"]), None);
    assert_eq!(read(&db, &["z", "k"]), Some(b"other".to_vec()));
}

#[test]
fn test_nested_paths_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(&dir);
        db.update(|tx| {
            tx.put(&["users", "alice", "email"], b"alice@example.com")?;
            tx.put(&["users", "bob", "email"], b"bob@example.com")
        })
        .unwrap();
        db.close().unwrap();
    }

    let db = open(&dir);
    assert_eq!(
        read(&db, &["users", "alice", "email"]),
        Some(b"alice@example.com".to_vec())
    );
    let users = db
        .view(|tx| Ok(tx.bucket(&["users"], |b| Ok(b.buckets()))?.unwrap_or_default()))
        .unwrap();
    assert_eq!(users, vec![b"alice".to_vec(), b"bob".to_vec()]);
}
