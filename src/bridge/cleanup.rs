//! Asynchronous deletion of acknowledged redo items.
//!
//! The bulk loader never deletes redo items inline. Each acknowledged item is
//! queued to a [`CleanupWorker`], which removes it from durable storage on its
//! own task with exponential backoff while the store reports busy. When an
//! item cannot be removed the worker closes the shared [`RedoGate`] so the
//! loader stops fetching more redo work.
//!
//! Until its deletion has finished an acknowledged item is still in storage,
//! so the loader counts every fetched item in a [`RedoTracker`] and only
//! fetches again once all of them have settled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ledger::wait_for;
use super::protocol::CorrelationId;
use crate::config::CleanupSettings;
use crate::error::{BridgeError, LockResultExt};

/// One unit of resolver-triggered re-submission work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoItem {
    /// Storage key used to delete the item once acknowledged
    pub key: String,
    /// Opaque payload resubmitted to the resolver
    pub payload: String,
}

impl RedoItem {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Failure reported by a [`RedoStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Recoverable contention; the operation may be retried
    #[error("storage busy: {0}")]
    Busy(String),
    /// Anything else
    #[error("storage failure: {0}")]
    Other(String),
}

/// Durable storage holding pending redo items.
///
/// Calls are synchronous and may block; the bridge runs them on the blocking
/// thread pool.
pub trait RedoStore: Send + Sync {
    /// Return up to `limit` pending redo items.
    fn fetch_batch(&self, limit: usize) -> Result<Vec<RedoItem>, StoreError>;

    /// Remove an acknowledged redo item.
    fn delete(&self, item: &RedoItem) -> Result<(), StoreError>;
}

/// Shared switch controlling redo admission.
#[derive(Debug, Default)]
pub struct RedoGate {
    closed: AtomicBool,
}

impl RedoGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Stop redo admission until [`RedoGate::reopen`] is called.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

/// Fetched redo items that have not settled yet.
///
/// An item settles once its deletion finished (either way), or once it came
/// back without an acknowledgement and was never queued for deletion.
#[derive(Debug, Default)]
pub struct RedoTracker {
    unsettled: Mutex<usize>,
    settled: Notify,
}

impl RedoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.unsettled.lock().recover_poison("RedoTracker::begin") += 1;
    }

    pub fn settle(&self) {
        let mut unsettled = self.unsettled.lock().recover_poison("RedoTracker::settle");
        *unsettled = unsettled.saturating_sub(1);
        if *unsettled == 0 {
            self.settled.notify_waiters();
        }
    }

    pub fn unsettled(&self) -> usize {
        *self.unsettled.lock().recover_poison("RedoTracker::unsettled")
    }

    /// Wait until every tracked item has settled.
    ///
    /// Returns `false` if `abort` fired first.
    pub async fn wait_settled(&self, abort: &CancellationToken, poll: Duration) -> bool {
        wait_for(&self.settled, abort, poll, || self.unsettled() == 0).await
    }
}

/// Counts reported when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

struct CleanupRequest {
    id: CorrelationId,
    item: RedoItem,
}

/// Handle to a running cleanup worker.
///
/// The worker exits once [`CleanupWorker::finish`] has been called and every
/// queued item has been processed. Dropping the handle without finishing
/// aborts the worker.
pub struct CleanupWorker {
    tx: Option<mpsc::UnboundedSender<CleanupRequest>>,
    join_handle: Option<JoinHandle<CleanupReport>>,
}

impl CleanupWorker {
    /// Spawn a worker deleting from `store`.
    ///
    /// `abort` cuts backoff sleeps short; items still queued after an abort
    /// are counted as failed without touching the store. Every processed item
    /// is settled in `tracker`.
    pub fn spawn(
        store: Arc<dyn RedoStore>,
        gate: Arc<RedoGate>,
        tracker: Arc<RedoTracker>,
        settings: CleanupSettings,
        abort: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join_handle = tokio::spawn(cleanup_loop(rx, store, gate, tracker, settings, abort));
        Self {
            tx: Some(tx),
            join_handle: Some(join_handle),
        }
    }

    /// Queue an acknowledged redo item for deletion.
    ///
    /// Returns `false` if the worker is already finishing.
    pub fn submit(&self, id: CorrelationId, item: RedoItem) -> bool {
        match &self.tx {
            Some(tx) => tx.send(CleanupRequest { id, item }).is_ok(),
            None => false,
        }
    }

    /// Report receive-complete and wait for the queue to drain.
    pub async fn finish(mut self) -> CleanupReport {
        self.tx.take();
        match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(
                    target: "resolver_bridge::cleanup",
                    "Cleanup worker ended abnormally: {}",
                    e
                );
                CleanupReport::default()
            }),
            None => CleanupReport::default(),
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}

async fn cleanup_loop(
    mut rx: mpsc::UnboundedReceiver<CleanupRequest>,
    store: Arc<dyn RedoStore>,
    gate: Arc<RedoGate>,
    tracker: Arc<RedoTracker>,
    settings: CleanupSettings,
    abort: CancellationToken,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    while let Some(request) = rx.recv().await {
        if abort.is_cancelled() {
            report.failed += 1;
            tracker.settle();
            continue;
        }
        match delete_with_backoff(&store, &request.item, &settings, &abort).await {
            Ok(()) => {
                report.deleted += 1;
                debug!(
                    target: "resolver_bridge::cleanup",
                    "Deleted redo item {} acknowledged by {}",
                    request.item.key,
                    request.id
                );
            }
            Err(e) => {
                report.failed += 1;
                if gate.is_open() {
                    warn!(
                        target: "resolver_bridge::cleanup",
                        "Disabling redo admission: {} (item {} from {})",
                        e,
                        request.item.key,
                        request.id
                    );
                }
                gate.close();
            }
        }
        tracker.settle();
    }

    debug!(
        target: "resolver_bridge::cleanup",
        "Cleanup worker drained: {} deleted, {} failed",
        report.deleted,
        report.failed
    );
    report
}

/// Backoff before retry number `attempt` (1-based).
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16))
}

async fn delete_with_backoff(
    store: &Arc<dyn RedoStore>,
    item: &RedoItem,
    settings: &CleanupSettings,
    abort: &CancellationToken,
) -> Result<(), BridgeError> {
    let mut attempt: u32 = 0;
    loop {
        let store_clone = Arc::clone(store);
        let item_clone = item.clone();
        let outcome = tokio::task::spawn_blocking(move || store_clone.delete(&item_clone))
            .await
            .unwrap_or_else(|e| Err(StoreError::Other(format!("delete task failed: {}", e))));

        match outcome {
            Ok(()) => return Ok(()),
            Err(StoreError::Busy(message)) => {
                attempt += 1;
                if attempt > settings.max_retries {
                    return Err(BridgeError::StorageBusy {
                        attempts: attempt,
                        message,
                    });
                }
                let wait = backoff_for(settings.base_backoff(), attempt);
                debug!(
                    target: "resolver_bridge::cleanup",
                    "Storage busy deleting {} (attempt {}), retrying in {:?}",
                    item.key,
                    attempt,
                    wait
                );
                tokio::select! {
                    _ = abort.cancelled() => {
                        return Err(BridgeError::StorageBusy {
                            attempts: attempt,
                            message: "aborted during backoff".to_string(),
                        });
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(StoreError::Other(message)) => {
                return Err(BridgeError::StorageBusy {
                    attempts: attempt + 1,
                    message,
                });
            }
        }
    }
}
