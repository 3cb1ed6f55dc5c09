//! Summary: Benchmark suite for thunderbox path-addressed access.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Run with: cargo run --release --manifest-path bench/Cargo.toml --bin thunderbox_bench

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thunderbox::{DEFAULT_MODE, Database, DatabaseOptions, RefCountBox};

const NUM_KEYS: usize = 100_000;
const VALUE_SIZE: usize = 100;
const BATCH_THREADS: usize = 8;
const BATCH_CALLS: usize = 250;
const BOX_CYCLES: usize = 1_000;

fn main() {
    println!("=== thunderbox Benchmark Suite ===");
    println!("Keys: {NUM_KEYS}, Value size: {VALUE_SIZE} bytes\n");

    let db_path = "/tmp/thunderbox_benchmark.db";
    let _ = fs::remove_file(db_path);

    run_benchmarks(db_path);

    let _ = fs::remove_file(db_path);
}

fn run_benchmarks(db_path: &str) {
    bench_sequential_writes(db_path);
    bench_sequential_reads(db_path);
    bench_random_reads(db_path);
    bench_for_each_scan(db_path);
    bench_nested_paths(db_path);
    bench_batch_writes(db_path);
    bench_box_cycles(db_path);
}

fn open(db_path: &str) -> Database {
    Database::open(db_path, DEFAULT_MODE, DatabaseOptions::default()).expect("open should succeed")
}

fn key(i: usize) -> String {
    format!("key_{i:08}")
}

fn bench_sequential_writes(db_path: &str) {
    let _ = fs::remove_file(db_path);

    let db = open(db_path);
    let value = vec![b'v'; VALUE_SIZE];

    let start = Instant::now();
    db.update(|tx| {
        for i in 0..NUM_KEYS {
            tx.put(&["bench", key(i).as_str()], &value)?;
        }
        Ok(())
    })
    .expect("update should succeed");
    let elapsed = start.elapsed();

    let ops_per_sec = NUM_KEYS as f64 / elapsed.as_secs_f64();
    println!(
        "Sequential writes ({}K keys, 1 tx): {:?} ({:.0} ops/sec)",
        NUM_KEYS / 1000,
        elapsed,
        ops_per_sec
    );
}

fn bench_sequential_reads(db_path: &str) {
    let db = open(db_path);

    let start = Instant::now();
    db.view(|tx| {
        for i in 0..NUM_KEYS {
            tx.value(&["bench", key(i).as_str()], |_| Ok(()))?;
        }
        Ok(())
    })
    .expect("view should succeed");
    let elapsed = start.elapsed();

    let ops_per_sec = NUM_KEYS as f64 / elapsed.as_secs_f64();
    println!(
        "Sequential reads ({}K keys): {:?} ({:.0} ops/sec)",
        NUM_KEYS / 1000,
        elapsed,
        ops_per_sec
    );
}

fn bench_random_reads(db_path: &str) {
    let db = open(db_path);

    // Deterministic access pattern.
    let indices: Vec<usize> = (0..NUM_KEYS)
        .map(|i| (i * 7919 + 104729) % NUM_KEYS)
        .collect();

    let start = Instant::now();
    db.view(|tx| {
        for &i in &indices {
            tx.value(&["bench", key(i).as_str()], |_| Ok(()))?;
        }
        Ok(())
    })
    .expect("view should succeed");
    let elapsed = start.elapsed();

    let ops_per_sec = NUM_KEYS as f64 / elapsed.as_secs_f64();
    println!(
        "Random reads ({}K lookups): {:?} ({:.0} ops/sec)",
        NUM_KEYS / 1000,
        elapsed,
        ops_per_sec
    );
}

fn bench_for_each_scan(db_path: &str) {
    let db = open(db_path);

    let start = Instant::now();
    let count = db
        .view(|tx| {
            let mut count = 0;
            tx.for_each(&["bench"], |_, _, _| {
                count += 1;
                Ok(())
            })?;
            Ok(count)
        })
        .expect("view should succeed");
    assert_eq!(count, NUM_KEYS);
    let elapsed = start.elapsed();

    let ops_per_sec = NUM_KEYS as f64 / elapsed.as_secs_f64();
    println!(
        "for_each scan ({}K keys): {:?} ({:.0} ops/sec)",
        NUM_KEYS / 1000,
        elapsed,
        ops_per_sec
    );
}

fn bench_nested_paths(db_path: &str) {
    let _ = fs::remove_file(db_path);

    let db = open(db_path);
    let value = vec![b'v'; VALUE_SIZE];
    const DEPTH: usize = 8;
    const NESTED_KEYS: usize = 10_000;

    let folders: Vec<String> = (0..DEPTH).map(|d| format!("level_{d}")).collect();

    let start = Instant::now();
    db.update(|tx| {
        for i in 0..NESTED_KEYS {
            let mut path: Vec<&str> = folders.iter().map(String::as_str).collect();
            let key = key(i);
            path.push(&key);
            tx.put(&path, &value)?;
        }
        Ok(())
    })
    .expect("update should succeed");
    let elapsed = start.elapsed();

    let ops_per_sec = NESTED_KEYS as f64 / elapsed.as_secs_f64();
    println!(
        "Nested puts ({}K keys, depth {}): {:?} ({:.0} ops/sec)",
        NESTED_KEYS / 1000,
        DEPTH,
        elapsed,
        ops_per_sec
    );
}

fn bench_batch_writes(db_path: &str) {
    let _ = fs::remove_file(db_path);

    let db = Arc::new(open(db_path));

    let start = Instant::now();
    let handles: Vec<_> = (0..BATCH_THREADS)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..BATCH_CALLS {
                    let key = format!("batch_{t:02}_{i:06}");
                    db.batch(move |tx| tx.put(&["batch", key.as_str()], b"v"))
                        .expect("batch should succeed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("batch thread panicked");
    }
    let elapsed = start.elapsed();

    let total_calls = BATCH_THREADS * BATCH_CALLS;
    let calls_per_sec = total_calls as f64 / elapsed.as_secs_f64();
    println!(
        "Batch writes ({} threads x {} calls): {:?} ({:.0} calls/sec)",
        BATCH_THREADS, BATCH_CALLS, elapsed, calls_per_sec
    );
}

fn bench_box_cycles(db_path: &str) {
    let _ = fs::remove_file(db_path);

    let shared = RefCountBox::new(db_path);

    // Every cycle opens and closes the file.
    let start = Instant::now();
    for i in 0..BOX_CYCLES {
        let key = key(i);
        shared
            .update(|tx| tx.put(&["box", key.as_str()], b"v"))
            .expect("update should succeed");
    }
    let elapsed = start.elapsed();

    let cycles_per_sec = BOX_CYCLES as f64 / elapsed.as_secs_f64();
    println!(
        "Box open/update/close ({} cycles): {:?} ({:.0} cycles/sec)",
        BOX_CYCLES, elapsed, cycles_per_sec
    );

    // Held lease: the database stays open across calls.
    let lease = shared.acquire().expect("acquire should succeed");
    let start = Instant::now();
    for i in 0..BOX_CYCLES {
        let key = key(i);
        shared
            .view(|tx| tx.value(&["box", key.as_str()], |_| Ok(())))
            .expect("view should succeed");
    }
    let elapsed = start.elapsed();
    lease.release();

    let ops_per_sec = BOX_CYCLES as f64 / elapsed.as_secs_f64();
    println!(
        "Box views with held lease ({} ops): {:?} ({:.0} ops/sec)",
        BOX_CYCLES, elapsed, ops_per_sec
    );
}
