//! Summary: Coalescing of concurrent batch calls into shared write transactions.
//! Copyright (c) YOAB. All rights reserved.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::db::{Database, lock};
use crate::error::{ErrorKind, Result};
use crate::tx::Tx;

/// A function queued with [`Database::batch`].
pub(crate) type BatchFn = Box<dyn Fn(&Tx<'_>) -> Result<()> + Send + 'static>;

/// Configuration for batch coalescing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum time the leader waits for more calls before running.
    pub max_wait: Duration,
    /// Maximum number of calls run in one transaction.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(10),
            max_batch_size: 1000,
        }
    }
}

type Completion = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

/// A queued call waiting for its batch to run.
///
/// A call dropped without being completed reports `BatchFailed` to its
/// caller, so no caller waits on a leader that is gone.
struct PendingCall {
    f: BatchFn,
    completed: Completion,
    finished: bool,
}

impl PendingCall {
    fn new(f: BatchFn, completed: Completion) -> Self {
        Self {
            f,
            completed,
            finished: false,
        }
    }

    /// Runs the function, turning a panic into an error for this call.
    fn call(&self, tx: &Tx<'_>) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.f)(tx))).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::warn!(message = %message, "batch function panicked");
            Err(ErrorKind::BatchPanicked { message }.into())
        })
    }

    fn complete(mut self, result: Result<()>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<()>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let (slot, condvar) = &*self.completed;
        *lock(slot) = Some(result);
        condvar.notify_one();
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.finish(Err(ErrorKind::BatchFailed {
            reason: "batch leader stopped before running the call".to_string(),
        }
        .into()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Steps the leader down if it unwinds, failing every queued call.
struct LeaderGuard<'a> {
    batcher: &'a Batcher,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let orphaned: Vec<PendingCall> = {
            let mut inner = lock(&self.batcher.inner);
            inner.leader_active = false;
            inner.pending.drain(..).collect()
        };
        tracing::warn!(calls = orphaned.len(), "batch leader unwound");
        drop(orphaned);
    }
}

struct BatcherInner {
    pending: Vec<PendingCall>,
    /// Whether a caller is currently collecting and running batches.
    leader_active: bool,
}

/// Runs concurrent batch calls together in as few write transactions as
/// possible.
///
/// # Algorithm
///
/// 1. A caller queues its function
/// 2. If no leader is active, the caller becomes the leader
/// 3. The leader waits up to `max_wait` or until `max_batch_size` calls are queued
/// 4. The leader runs the queued functions in one write transaction
/// 5. A failing function is removed, rerun alone, and the rest is retried.
///    A panicking function counts as failing; its caller gets `BatchPanicked`
/// 6. The leader keeps going until the queue is empty, then steps down
///
/// Every caller blocks until its own function has been committed or has
/// failed.
pub struct Batcher {
    inner: Mutex<BatcherInner>,
    /// Signalled when the queue reaches `max_batch_size`.
    filled: Condvar,
    config: BatchConfig,
    /// Statistics: number of transactions run for batches.
    batch_count: AtomicU64,
    /// Statistics: number of calls completed.
    call_count: AtomicU64,
}

impl Batcher {
    pub(crate) fn new(config: BatchConfig) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        Self {
            inner: Mutex::new(BatcherInner {
                pending: Vec::new(),
                leader_active: false,
            }),
            filled: Condvar::new(),
            config: BatchConfig {
                max_batch_size,
                ..config
            },
            batch_count: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
        }
    }

    /// Queues `f` and blocks until it has been applied.
    pub(crate) fn submit(&self, db: &Database, f: BatchFn) -> Result<()> {
        let completed: Completion = Arc::new((Mutex::new(None), Condvar::new()));

        let should_lead = {
            let mut inner = lock(&self.inner);
            inner.pending.push(PendingCall::new(f, Arc::clone(&completed)));
            if inner.pending.len() >= self.config.max_batch_size {
                self.filled.notify_one();
            }
            let should_lead = !inner.leader_active;
            if should_lead {
                inner.leader_active = true;
            }
            should_lead
        };

        if should_lead {
            self.run_leader(db);
        }

        let (slot, condvar) = &*completed;
        let mut result = lock(slot);
        loop {
            if let Some(result) = result.take() {
                self.call_count.fetch_add(1, Ordering::Relaxed);
                return result;
            }
            result = condvar.wait(result).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Leader logic: collect a batch, run it, repeat until the queue drains.
    fn run_leader(&self, db: &Database) {
        let _guard = LeaderGuard { batcher: self };
        loop {
            let deadline = Instant::now() + self.config.max_wait;
            let calls = {
                let mut inner = lock(&self.inner);
                while !inner.pending.is_empty() && inner.pending.len() < self.config.max_batch_size {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner = self
                        .filled
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }

                if inner.pending.is_empty() {
                    inner.leader_active = false;
                    return;
                }
                let take = inner.pending.len().min(self.config.max_batch_size);
                inner.pending.drain(..take).collect::<Vec<_>>()
            };

            self.run_batch(db, calls);
        }
    }

    /// Runs `calls` in shared transactions and completes every one of them.
    fn run_batch(&self, db: &Database, mut calls: Vec<PendingCall>) {
        while !calls.is_empty() {
            let mut failed = None;
            self.batch_count.fetch_add(1, Ordering::Relaxed);
            let result = db.update(|tx| {
                for (index, call) in calls.iter().enumerate() {
                    if let Err(err) = call.call(tx) {
                        failed = Some(index);
                        return Err(err);
                    }
                }
                Ok(())
            });

            if let Some(index) = failed {
                // Rerun the failing call alone so its caller sees its own error.
                let call = calls.remove(index);
                let solo = db.update(|tx| call.call(tx));
                call.complete(solo);
                continue;
            }

            match result {
                Ok(()) => {
                    tracing::debug!(calls = calls.len(), "committed batch");
                    for call in calls.drain(..) {
                        call.complete(Ok(()));
                    }
                }
                Err(err) => {
                    tracing::debug!(calls = calls.len(), error = %err, "batch failed");
                    let reason = err.to_string();
                    for call in calls.drain(..) {
                        call.complete(Err(ErrorKind::BatchFailed {
                            reason: reason.clone(),
                        }
                        .into()));
                    }
                }
            }
        }
    }

    /// Returns the number of transactions run for batches.
    pub fn batch_count(&self) -> u64 {
        self.batch_count.load(Ordering::Relaxed)
    }

    /// Returns the number of completed calls.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Returns the average number of calls per batch transaction.
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batch_count.load(Ordering::Relaxed);
        let calls = self.call_count.load(Ordering::Relaxed);
        if batches == 0 {
            0.0
        } else {
            calls as f64 / batches as f64
        }
    }
}
