//! Pending ledger and admission control.
//!
//! The ledger tracks every request a streaming producer has written but not
//! yet seen answered, plus the redo metadata of requests that came from redo
//! reconciliation. Each map has its own lock and its own wake-up signal.
//!
//! [`Backpressure`] blocks a producer once the ledger reaches the block
//! threshold and releases it only after the ledger drains to the unblock
//! threshold.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::cleanup::RedoItem;
use super::protocol::{CorrelationId, RequestEnvelope};
use crate::config::BackpressureSettings;
use crate::error::LockResultExt;

/// An entry removed from the ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub request: RequestEnvelope,
    /// Present when the request was a redo resubmission
    pub redo: Option<RedoItem>,
}

#[derive(Debug)]
struct Outstanding {
    request: RequestEnvelope,
    written_on: Option<u64>,
}

/// Outstanding requests of one streaming producer.
///
/// The ledger outlives individual connections. Entries leave it one by one
/// as responses arrive, in bulk through [`PendingLedger::release_written_on`]
/// when the connection they were written on is lost, or all at once through
/// [`PendingLedger::force_resolve_all`] when the session aborts.
#[derive(Debug, Default)]
pub struct PendingLedger {
    outstanding: Mutex<HashMap<CorrelationId, Outstanding>>,
    drained: Notify,
    redo: Mutex<HashMap<CorrelationId, RedoItem>>,
    redo_drained: Notify,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request as outstanding.
    pub fn insert(&self, request: RequestEnvelope) {
        self.outstanding
            .lock()
            .recover_poison("PendingLedger::insert")
            .insert(
                request.id,
                Outstanding {
                    request,
                    written_on: None,
                },
            );
    }

    /// Record the connection generation `id` was written on.
    ///
    /// Returns `false` if `id` is no longer outstanding.
    pub fn mark_written(&self, id: CorrelationId, generation: u64) -> bool {
        match self
            .outstanding
            .lock()
            .recover_poison("PendingLedger::mark_written")
            .get_mut(&id)
        {
            Some(entry) => {
                entry.written_on = Some(generation);
                true
            }
            None => false,
        }
    }

    /// Record a redo resubmission as outstanding.
    ///
    /// The redo entry is inserted first so a response can never observe the
    /// request without its redo metadata.
    pub fn insert_redo(&self, request: RequestEnvelope, item: RedoItem) {
        self.redo
            .lock()
            .recover_poison("PendingLedger::insert_redo")
            .insert(request.id, item);
        self.insert(request);
    }

    /// Remove the entry for `id` and wake waiters.
    ///
    /// Returns `None` if `id` was not outstanding.
    pub fn complete(&self, id: CorrelationId) -> Option<LedgerEntry> {
        let request = self
            .outstanding
            .lock()
            .recover_poison("PendingLedger::complete")
            .remove(&id)
            .map(|entry| entry.request);
        let redo = self
            .redo
            .lock()
            .recover_poison("PendingLedger::complete")
            .remove(&id);

        if redo.is_some() {
            self.redo_drained.notify_waiters();
        }
        let request = request?;
        self.drained.notify_waiters();
        Some(LedgerEntry { request, redo })
    }

    /// Remove every entry, returning them so callers can resolve them as absent.
    pub fn force_resolve_all(&self) -> Vec<LedgerEntry> {
        let outstanding: Vec<RequestEnvelope> = self
            .outstanding
            .lock()
            .recover_poison("PendingLedger::force_resolve_all")
            .drain()
            .map(|(_, entry)| entry.request)
            .collect();
        let mut redo = std::mem::take(
            &mut *self
                .redo
                .lock()
                .recover_poison("PendingLedger::force_resolve_all"),
        );

        self.drained.notify_waiters();
        self.redo_drained.notify_waiters();

        outstanding
            .into_iter()
            .map(|request| LedgerEntry {
                redo: redo.remove(&request.id),
                request,
            })
            .collect()
    }

    /// Remove entries written on connection `generation` or an older one.
    pub fn release_written_on(&self, generation: u64) -> Vec<LedgerEntry> {
        let lost: Vec<CorrelationId> = self
            .outstanding
            .lock()
            .recover_poison("PendingLedger::release_written_on")
            .iter()
            .filter(|(_, entry)| entry.written_on.is_some_and(|g| g <= generation))
            .map(|(id, _)| *id)
            .collect();
        lost.into_iter().filter_map(|id| self.complete(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.outstanding
            .lock()
            .recover_poison("PendingLedger::len")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.outstanding
            .lock()
            .recover_poison("PendingLedger::contains")
            .contains_key(&id)
    }

    /// Number of outstanding redo resubmissions.
    pub fn redo_outstanding(&self) -> usize {
        self.redo
            .lock()
            .recover_poison("PendingLedger::redo_outstanding")
            .len()
    }

    /// Wait until at most `limit` requests are outstanding.
    ///
    /// Returns `false` if `abort` fired first.
    pub async fn wait_until_at_most(
        &self,
        limit: usize,
        abort: &CancellationToken,
        poll: Duration,
    ) -> bool {
        wait_for(&self.drained, abort, poll, || self.len() <= limit).await
    }

    /// Wait until no redo resubmission is outstanding.
    ///
    /// Returns `false` if `abort` fired first.
    pub async fn wait_redo_clear(&self, abort: &CancellationToken, poll: Duration) -> bool {
        wait_for(&self.redo_drained, abort, poll, || {
            self.redo_outstanding() == 0
        })
        .await
    }
}

/// Condition wait: re-check `ready` after every wake-up, notification or poll.
pub(crate) async fn wait_for<F>(
    signal: &Notify,
    abort: &CancellationToken,
    poll: Duration,
    mut ready: F,
) -> bool
where
    F: FnMut() -> bool,
{
    loop {
        let notified = signal.notified();
        tokio::pin!(notified);
        // Register before checking so a notification between check and wait is not lost.
        notified.as_mut().enable();

        if ready() {
            return true;
        }
        if abort.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = abort.cancelled() => return false,
            _ = &mut notified => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Admission control with hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    block_threshold: usize,
    unblock_threshold: usize,
    poll: Duration,
}

impl Backpressure {
    /// Build from validated settings (`unblock < block`).
    pub fn new(settings: &BackpressureSettings) -> Self {
        Self {
            block_threshold: settings.block_threshold,
            unblock_threshold: settings.unblock_threshold,
            poll: settings.poll(),
        }
    }

    pub fn block_threshold(&self) -> usize {
        self.block_threshold
    }

    pub fn unblock_threshold(&self) -> usize {
        self.unblock_threshold
    }

    /// Wait until the producer may transmit another request.
    ///
    /// Passes straight through below the block threshold. At or above it,
    /// waits for the ledger to drain to the unblock threshold. Returns
    /// `false` if `abort` fired while blocked.
    pub async fn admit(&self, ledger: &PendingLedger, abort: &CancellationToken) -> bool {
        let outstanding = ledger.len();
        if outstanding < self.block_threshold {
            return !abort.is_cancelled();
        }

        debug!(
            target: "resolver_bridge::ledger",
            "Backpressure engaged at {} outstanding (resume at {})",
            outstanding,
            self.unblock_threshold
        );
        let resumed = ledger
            .wait_until_at_most(self.unblock_threshold, abort, self.poll)
            .await;
        if resumed {
            debug!(
                target: "resolver_bridge::ledger",
                "Backpressure released at {} outstanding",
                ledger.len()
            );
        } else {
            debug!(
                target: "resolver_bridge::ledger",
                "Backpressure wait aborted with {} outstanding",
                ledger.len()
            );
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Operation;
    use std::sync::Arc;

    fn request(id: u64) -> RequestEnvelope {
        RequestEnvelope::new(CorrelationId::new(id), Operation::AddRecord)
    }

    fn backpressure(block: usize, unblock: usize) -> Backpressure {
        Backpressure::new(&BackpressureSettings {
            block_threshold: block,
            unblock_threshold: unblock,
            poll_ms: 1_000,
        })
    }

    #[test]
    fn complete_removes_entry_exactly_once() {
        let ledger = PendingLedger::new();
        ledger.insert(request(1));
        assert!(ledger.contains(CorrelationId::new(1)));

        let entry = ledger.complete(CorrelationId::new(1)).unwrap();
        assert_eq!(entry.request.id, CorrelationId::new(1));
        assert!(entry.redo.is_none());
        assert!(ledger.complete(CorrelationId::new(1)).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn redo_metadata_travels_with_completion() {
        let ledger = PendingLedger::new();
        ledger.insert_redo(request(5), RedoItem::new("k5", "p5"));
        assert_eq!(ledger.redo_outstanding(), 1);

        let entry = ledger.complete(CorrelationId::new(5)).unwrap();
        assert_eq!(entry.redo, Some(RedoItem::new("k5", "p5")));
        assert_eq!(ledger.redo_outstanding(), 0);
    }

    #[test]
    fn force_resolve_all_empties_both_maps() {
        let ledger = PendingLedger::new();
        ledger.insert(request(1));
        ledger.insert_redo(request(2), RedoItem::new("k2", ""));

        let entries = ledger.force_resolve_all();
        assert_eq!(entries.len(), 2);
        assert!(ledger.is_empty());
        assert_eq!(ledger.redo_outstanding(), 0);
    }

    #[test]
    fn lost_generation_releases_only_entries_written_on_it() {
        let ledger = PendingLedger::new();
        ledger.insert(request(1));
        ledger.insert_redo(request(2), RedoItem::new("k2", ""));
        ledger.insert(request(3));
        ledger.insert(request(4));
        assert!(ledger.mark_written(CorrelationId::new(1), 1));
        assert!(ledger.mark_written(CorrelationId::new(2), 1));
        assert!(ledger.mark_written(CorrelationId::new(3), 2));

        let mut released = ledger.release_written_on(1);
        released.sort_by_key(|entry| entry.request.id);
        assert_eq!(released.len(), 2);
        assert_eq!(released[1].redo, Some(RedoItem::new("k2", "")));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.redo_outstanding(), 0);
        assert!(!ledger.mark_written(CorrelationId::new(1), 3));
    }

    #[tokio::test]
    async fn admit_passes_below_block_threshold() {
        let ledger = PendingLedger::new();
        for id in 1..=9 {
            ledger.insert(request(id));
        }
        assert!(
            backpressure(10, 7)
                .admit(&ledger, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_blocks_at_ten_and_resumes_at_seven() {
        let ledger = Arc::new(PendingLedger::new());
        for id in 1..=10 {
            ledger.insert(request(id));
        }

        let producer = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                backpressure(10, 7)
                    .admit(&ledger, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "must block at 10 outstanding");

        ledger.complete(CorrelationId::new(1));
        ledger.complete(CorrelationId::new(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "must stay blocked at 8 outstanding");

        ledger.complete(CorrelationId::new(3));
        let admitted = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume at 7 outstanding")
            .unwrap();
        assert!(admitted);
        assert_eq!(ledger.len(), 7);
    }

    #[tokio::test]
    async fn abort_releases_blocked_producer_promptly() {
        let ledger = Arc::new(PendingLedger::new());
        for id in 1..=10 {
            ledger.insert(request(id));
        }
        let abort = CancellationToken::new();

        let producer = {
            let ledger = Arc::clone(&ledger);
            let abort = abort.clone();
            tokio::spawn(async move { backpressure(10, 7).admit(&ledger, &abort).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.cancel();
        let admitted = tokio::time::timeout(Duration::from_millis(200), producer)
            .await
            .expect("abort must wake the producer before the poll interval")
            .unwrap();
        assert!(!admitted);
    }

    #[tokio::test]
    async fn wait_redo_clear_returns_when_last_redo_completes() {
        let ledger = Arc::new(PendingLedger::new());
        ledger.insert_redo(request(1), RedoItem::new("k", ""));

        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                ledger
                    .wait_redo_clear(&CancellationToken::new(), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ledger.complete(CorrelationId::new(1));

        let cleared = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cleared);
    }
}
