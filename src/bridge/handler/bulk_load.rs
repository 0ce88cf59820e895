//! Handler for the streaming bulk loader.
//!
//! Outstanding ids live in the [`PendingLedger`]. When a response arrives the
//! ledger entry is removed (waking any producer blocked on backpressure) and
//! the entry plus response is queued for the loader's consumer loop. Entries
//! that will never be answered (the session aborted, or the connection they
//! were written on was lost) are queued with an absent response.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::bridge::ledger::{LedgerEntry, PendingLedger};
use crate::bridge::protocol::{CorrelationId, ResponseEnvelope};
use crate::bridge::switchboard::ResponseHandler;

/// A completed ledger entry handed to the consumer loop.
///
/// `response` is `None` when the entry was force-resolved because no
/// response will ever arrive.
#[derive(Debug)]
pub struct Delivery {
    pub entry: LedgerEntry,
    pub response: Option<ResponseEnvelope>,
}

pub struct BulkLoadHandler {
    ledger: Arc<PendingLedger>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl BulkLoadHandler {
    /// Create a handler over `ledger` and the receiving end of its delivery queue.
    pub fn new(ledger: Arc<PendingLedger>) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { ledger, deliveries }), rx)
    }

    pub fn ledger(&self) -> &Arc<PendingLedger> {
        &self.ledger
    }

    /// Force-resolve every outstanding entry as absent.
    pub fn release_all(&self) -> usize {
        self.deliver_absent(self.ledger.force_resolve_all())
    }

    fn deliver_absent(&self, entries: Vec<LedgerEntry>) -> usize {
        let count = entries.len();
        for entry in entries {
            let _ = self.deliveries.send(Delivery {
                entry,
                response: None,
            });
        }
        count
    }
}

impl ResponseHandler for BulkLoadHandler {
    fn pending_count(&self) -> usize {
        self.ledger.len()
    }

    fn is_pending(&self, id: CorrelationId) -> bool {
        self.ledger.contains(id)
    }

    fn response_received(&self, response: ResponseEnvelope) {
        if let Some(entry) = self.ledger.complete(response.id) {
            let _ = self.deliveries.send(Delivery {
                entry,
                response: Some(response),
            });
        }
    }

    fn abandon_pending(&self, reason: &str) {
        let released = self.release_all();
        debug!(
            target: "resolver_bridge::loader",
            "Force-resolved {} outstanding load requests: {}",
            released,
            reason
        );
    }

    fn connection_lost(&self, generation: u64) -> usize {
        self.deliver_absent(self.ledger.release_written_on(generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::cleanup::RedoItem;
    use crate::bridge::protocol::{Operation, RequestEnvelope};
    use serde_json::json;

    fn request(id: u64, op: Operation) -> RequestEnvelope {
        RequestEnvelope::new(CorrelationId::new(id), op)
    }

    #[tokio::test]
    async fn response_completes_ledger_entry_and_queues_delivery() {
        let ledger = Arc::new(PendingLedger::new());
        let (handler, mut rx) = BulkLoadHandler::new(Arc::clone(&ledger));
        ledger.insert_redo(
            request(4, Operation::ProcessRedo),
            RedoItem::new("k4", "payload"),
        );
        assert!(handler.is_pending(CorrelationId::new(4)));

        handler.response_received(ResponseEnvelope::success(CorrelationId::new(4), json!(null)));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.entry.request.id, CorrelationId::new(4));
        assert_eq!(delivery.entry.redo.map(|r| r.key), Some("k4".to_string()));
        assert!(delivery.response.unwrap().success);
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandon_force_resolves_everything_as_absent() {
        let ledger = Arc::new(PendingLedger::new());
        let (handler, mut rx) = BulkLoadHandler::new(Arc::clone(&ledger));
        ledger.insert(request(1, Operation::AddRecord));
        ledger.insert(request(2, Operation::AddRecord));

        handler.abandon_pending("session shut down");
        drop(handler);

        let mut absent = 0;
        while let Some(delivery) = rx.recv().await {
            assert!(delivery.response.is_none());
            absent += 1;
        }
        assert_eq!(absent, 2);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn lost_connection_delivers_its_entries_as_absent() {
        let ledger = Arc::new(PendingLedger::new());
        let (handler, mut rx) = BulkLoadHandler::new(Arc::clone(&ledger));
        ledger.insert(request(1, Operation::AddRecord));
        ledger.insert(request(2, Operation::AddRecord));
        ledger.mark_written(CorrelationId::new(1), 3);
        ledger.mark_written(CorrelationId::new(2), 4);

        assert_eq!(handler.connection_lost(3), 1);

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.entry.request.id, CorrelationId::new(1));
        assert!(delivery.response.is_none());
        assert!(handler.is_pending(CorrelationId::new(2)));
    }
}
