//! Bulk record loading with backpressure and redo reconciliation.
//!
//! [`BulkLoader::run`] streams records to the resolver without waiting for
//! each answer. Outstanding requests are tracked in a [`PendingLedger`]
//! through a [`BulkLoadHandler`] registered with the switchboard; a consumer
//! task drains the handler's delivery queue and tallies outcomes.
//!
//! Redo work (re-submission triggered by the resolver) is reconciled at a
//! growing record-count threshold and once ordinary input is exhausted. A
//! redo round never starts while a previous round's requests are still
//! outstanding or its acknowledged items are still being deleted, and the
//! pass gives up on redo once batch counts stop shrinking for more rounds
//! than the divergence threshold allows.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cleanup::{
    CleanupReport, CleanupWorker, RedoGate, RedoItem, RedoStore, RedoTracker, StoreError,
};
use super::connector::Connector;
use super::handler::{BulkLoadHandler, Delivery};
use super::ledger::{Backpressure, LedgerEntry, PendingLedger};
use super::protocol::{CorrelationId, CorrelationIdGenerator, Operation, RequestEnvelope};
use super::switchboard::{ResponseHandler, Switchboard};
use crate::config::{BackpressureSettings, CleanupSettings, RedoSettings};
use crate::error::{BridgeError, BridgeResult};

/// One record to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    pub operation: Operation,
    pub payload: String,
    pub params: BTreeMap<String, String>,
}

impl LoadRecord {
    /// An `AddRecord` carrying `payload`.
    pub fn add(payload: impl Into<String>) -> Self {
        Self {
            operation: Operation::AddRecord,
            payload: payload.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one load pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Ordinary records written
    pub sent: u64,
    /// Successful responses, ordinary and redo
    pub succeeded: u64,
    /// Non-critical engine failures
    pub failed: u64,
    /// Entries force-resolved without a response
    pub unresolved: u64,
    pub redo_rounds: u32,
    /// Redo items acknowledged and queued for deletion
    pub redo_processed: u64,
    /// Redo was given up for this pass after divergence
    pub redo_abandoned: bool,
    pub aborted: bool,
    pub cleanup: CleanupReport,
}

/// Divergence tracking across redo rounds of one pass.
#[derive(Debug, Default)]
struct RedoProgress {
    previous: Option<usize>,
    divergence: u32,
    abandoned: bool,
}

impl RedoProgress {
    /// Record a fetched batch size; returns `false` once the pass must stop.
    fn observe(&mut self, count: usize, threshold: u32) -> bool {
        match self.previous {
            Some(previous) if count >= previous => self.divergence += 1,
            _ => self.divergence = 0,
        }
        self.previous = Some(count);
        if self.divergence > threshold {
            self.abandoned = true;
        }
        !self.abandoned
    }
}

/// State of one load pass shared by the producer steps.
struct Pass {
    handler: Arc<BulkLoadHandler>,
    tracker: Arc<RedoTracker>,
    abort: CancellationToken,
}

impl Pass {
    fn ledger(&self) -> &PendingLedger {
        self.handler.ledger()
    }

    /// Take back a request that never made it onto the wire.
    fn withdraw(&self, id: CorrelationId) {
        if let Some(entry) = self.ledger().complete(id)
            && entry.redo.is_some()
        {
            self.tracker.settle();
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: u64,
    failed: u64,
    unresolved: u64,
    redo_processed: u64,
}

/// Streaming loader over the shared connector.
pub struct BulkLoader {
    connector: Arc<Connector>,
    switchboard: Arc<Switchboard>,
    ids: Arc<CorrelationIdGenerator>,
    backpressure: Backpressure,
    backpressure_settings: BackpressureSettings,
    redo: RedoSettings,
    cleanup: CleanupSettings,
    store: Option<Arc<dyn RedoStore>>,
    gate: Arc<RedoGate>,
    abort: CancellationToken,
}

impl BulkLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<Connector>,
        switchboard: Arc<Switchboard>,
        ids: Arc<CorrelationIdGenerator>,
        backpressure: &BackpressureSettings,
        redo: RedoSettings,
        cleanup: CleanupSettings,
        gate: Arc<RedoGate>,
        abort: &CancellationToken,
    ) -> Self {
        Self {
            connector,
            switchboard,
            ids,
            backpressure: Backpressure::new(backpressure),
            backpressure_settings: backpressure.clone(),
            redo,
            cleanup,
            store: None,
            gate,
            abort: abort.child_token(),
        }
    }

    /// Reconcile redo work from `store` during the pass.
    pub fn with_redo_store(mut self, store: Arc<dyn RedoStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load every record, then reconcile redo and wait for all answers.
    ///
    /// Non-critical engine failures are counted and loading continues. A
    /// critical engine failure aborts the pass and is returned as the error.
    pub async fn run<I>(&self, records: I) -> BridgeResult<LoadReport>
    where
        I: IntoIterator<Item = LoadRecord>,
    {
        // Nothing would route the answers.
        if self.switchboard.is_stopped() {
            return Err(BridgeError::Closed);
        }

        let ledger = Arc::new(PendingLedger::new());
        let (handler, deliveries) = BulkLoadHandler::new(ledger);
        let registered: Arc<dyn ResponseHandler> = handler.clone();
        self.switchboard.register_handler(Arc::clone(&registered));

        let pass = Pass {
            handler,
            tracker: Arc::new(RedoTracker::new()),
            abort: self.abort.child_token(),
        };
        let cleanup = self.store.as_ref().map(|store| {
            CleanupWorker::spawn(
                Arc::clone(store),
                Arc::clone(&self.gate),
                Arc::clone(&pass.tracker),
                self.cleanup.clone(),
                pass.abort.clone(),
            )
        });
        let consumer = tokio::spawn(consume(
            deliveries,
            cleanup,
            Arc::clone(&pass.tracker),
            pass.abort.clone(),
        ));

        let mut report = LoadReport::default();
        let produced = self.produce(records, &pass, &mut report).await;

        // Wait for the remaining answers, or give up on them if aborted.
        if produced.is_ok() {
            pass.ledger()
                .wait_until_at_most(0, &pass.abort, self.backpressure_settings.poll())
                .await;
        }
        if !pass.ledger().is_empty() {
            pass.handler.release_all();
        }

        self.switchboard.unregister_handler(&registered);
        drop(registered);
        let Pass {
            handler,
            tracker: _,
            abort: pass_abort,
        } = pass;
        drop(handler);

        let (tally, cleanup, critical) = match consumer.await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(BridgeError::protocol(format!(
                    "load consumer ended abnormally: {}",
                    e
                )));
            }
        };
        if let Some(worker) = cleanup {
            report.cleanup = worker.finish().await;
        }

        report.succeeded = tally.succeeded;
        report.failed = tally.failed;
        report.unresolved = tally.unresolved;
        report.redo_processed = tally.redo_processed;
        report.aborted = pass_abort.is_cancelled();

        info!(
            target: "resolver_bridge::loader",
            "Load pass done: {} sent, {} ok, {} failed, {} unresolved, {} redo in {} rounds{}",
            report.sent,
            report.succeeded,
            report.failed,
            report.unresolved,
            report.redo_processed,
            report.redo_rounds,
            if report.redo_abandoned { " (redo abandoned)" } else { "" }
        );

        if let Some(error) = critical {
            return Err(error);
        }
        produced?;
        Ok(report)
    }

    async fn produce<I>(&self, records: I, pass: &Pass, report: &mut LoadReport) -> BridgeResult<()>
    where
        I: IntoIterator<Item = LoadRecord>,
    {
        let mut progress = RedoProgress::default();
        let mut next_check = self.redo.first_check_after.max(1);

        for record in records {
            if !self.backpressure.admit(pass.ledger(), &pass.abort).await {
                return Ok(());
            }

            let mut request = RequestEnvelope::new(self.ids.next_id(), record.operation)
                .with_payload(record.payload);
            request.params = record.params;
            self.transmit(pass, request, None).await?;
            report.sent += 1;

            if report.sent >= next_check {
                next_check = next_check.saturating_mul(2);
                self.redo_round(pass, &mut progress, report).await?;
            }
        }

        // No ordinary input left: reconcile until redo is exhausted or given up.
        while !pass.abort.is_cancelled() {
            if self.redo_round(pass, &mut progress, report).await? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Record `request` in the ledger and write it.
    async fn transmit(
        &self,
        pass: &Pass,
        mut request: RequestEnvelope,
        redo: Option<RedoItem>,
    ) -> BridgeResult<()> {
        request.mark_enqueued();
        let id = request.id;
        let wire = request.clone();
        match redo {
            Some(item) => {
                pass.tracker.begin();
                pass.ledger().insert_redo(request, item);
            }
            None => pass.ledger().insert(request),
        }
        if self.switchboard.is_stopped() {
            pass.withdraw(id);
            return Err(BridgeError::Closed);
        }
        self.switchboard.notify_activity();

        let generation = match self.connector.write_request(&wire).await {
            Ok(generation) => generation,
            Err(e) => {
                pass.withdraw(id);
                warn!(
                    target: "resolver_bridge::loader",
                    "Writing {} failed: {}",
                    id,
                    e
                );
                return Err(e);
            }
        };
        // The connection may have been lost before the generation was recorded.
        if pass.ledger().mark_written(id, generation)
            && self.connector.lost_generation() >= generation
        {
            pass.handler.connection_lost(generation);
        }
        Ok(())
    }

    /// Run one redo round; returns the number of items submitted.
    ///
    /// Returns 0 when redo is disabled, the gate is closed, the store is
    /// empty, or the pass has diverged.
    async fn redo_round(
        &self,
        pass: &Pass,
        progress: &mut RedoProgress,
        report: &mut LoadReport,
    ) -> BridgeResult<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        if !self.redo.enabled || progress.abandoned {
            return Ok(0);
        }

        // Never fetch while a previous round is unanswered or its items are
        // still in storage waiting for deletion.
        let poll = self.backpressure_settings.poll();
        if !pass.ledger().wait_redo_clear(&pass.abort, poll).await
            || !pass.tracker.wait_settled(&pass.abort, poll).await
        {
            return Ok(0);
        }
        if !self.gate.is_open() {
            debug!(
                target: "resolver_bridge::loader",
                "Redo admission disabled, skipping round"
            );
            return Ok(0);
        }

        let batch = fetch_batch(Arc::clone(store), self.redo.batch_size).await;
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    target: "resolver_bridge::loader",
                    "Fetching redo batch failed: {}",
                    e
                );
                return Ok(0);
            }
        };

        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        if !progress.observe(count, self.redo.divergence_threshold) {
            report.redo_abandoned = true;
            warn!(
                target: "resolver_bridge::loader",
                "Redo batch stuck at {} items for {} rounds; leaving redo for a later pass",
                count,
                progress.divergence
            );
            return Ok(0);
        }

        report.redo_rounds += 1;
        debug!(
            target: "resolver_bridge::loader",
            "Redo round {}: {} items",
            report.redo_rounds,
            count
        );
        for item in batch {
            if pass.abort.is_cancelled() {
                break;
            }
            let request = RequestEnvelope::new(self.ids.next_id(), Operation::ProcessRedo)
                .with_payload(item.payload.clone());
            self.transmit(pass, request, Some(item)).await?;
        }
        Ok(count)
    }
}

async fn fetch_batch(store: Arc<dyn RedoStore>, limit: usize) -> Result<Vec<RedoItem>, StoreError> {
    tokio::task::spawn_blocking(move || store.fetch_batch(limit))
        .await
        .unwrap_or_else(|e| Err(StoreError::Other(format!("fetch task failed: {}", e))))
}

/// Drain deliveries until the handler is gone.
///
/// Redo items settle in `tracker` here unless they were handed to the
/// cleanup worker, which settles them once deleted.
async fn consume(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    cleanup: Option<CleanupWorker>,
    tracker: Arc<RedoTracker>,
    pass_abort: CancellationToken,
) -> (Tally, Option<CleanupWorker>, Option<BridgeError>) {
    let mut tally = Tally::default();
    let mut critical = None;

    while let Some(Delivery { entry, response }) = deliveries.recv().await {
        let LedgerEntry { request, redo } = entry;
        let Some(response) = response else {
            tally.unresolved += 1;
            if redo.is_some() {
                tracker.settle();
            }
            continue;
        };

        if response.success {
            tally.succeeded += 1;
            if let Some(item) = redo {
                tally.redo_processed += 1;
                let queued = cleanup
                    .as_ref()
                    .is_some_and(|worker| worker.submit(response.id, item));
                if !queued {
                    tracker.settle();
                }
            }
            continue;
        }
        if redo.is_some() {
            tracker.settle();
        }

        let id = response.id;
        match response.into_result() {
            Err(BridgeError::EngineLogic(error)) if error.critical => {
                warn!(
                    target: "resolver_bridge::loader",
                    "Critical failure for {} ({}): {}; aborting load",
                    id,
                    request.operation,
                    error
                );
                if critical.is_none() {
                    critical = Some(BridgeError::EngineLogic(error));
                }
                pass_abort.cancel();
            }
            Err(error) => {
                tally.failed += 1;
                debug!(
                    target: "resolver_bridge::loader",
                    "Record {} failed: {}",
                    id,
                    error
                );
            }
            Ok(_) => tally.succeeded += 1,
        }
    }

    (tally, cleanup, critical)
}
