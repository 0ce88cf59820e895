//! Handler for synchronous callers.
//!
//! Each caller registers its correlation id before writing and then awaits a
//! oneshot receiver without holding any lock. The switchboard completes the
//! oneshot when the response arrives. If the switchboard gives up every
//! waiter is released with `Closed`; if the connection a request was written
//! on is lost, its waiter is released with a transport failure.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::bridge::connector::Connector;
use crate::bridge::prioritizer::Exchange;
use crate::bridge::protocol::{CorrelationId, RequestEnvelope, ResponseEnvelope};
use crate::bridge::switchboard::{ResponseHandler, Switchboard};
use crate::error::{BridgeError, BridgeResult, LockResultExt};

type Outcome = BridgeResult<ResponseEnvelope>;

struct Waiter {
    tx: oneshot::Sender<Outcome>,
    /// Connection generation the request went out on, once written
    written_on: Option<u64>,
}

fn connection_lost_error() -> BridgeError {
    BridgeError::TransportFailure {
        attempts: 1,
        source: io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection lost before the response arrived",
        ),
    }
}

/// Waiters for responses to synchronous calls.
#[derive(Default)]
pub struct SyncCallHandler {
    pending: Mutex<HashMap<CorrelationId, Waiter>>,
}

impl SyncCallHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`.
    ///
    /// Returns `None` if `id` is already pending.
    pub fn register(&self, id: CorrelationId) -> Option<oneshot::Receiver<Outcome>> {
        let mut pending = self.pending.lock().recover_poison("SyncCallHandler::register");
        if pending.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, Waiter { tx, written_on: None });
        Some(rx)
    }

    /// Record the connection generation `id` was written on.
    ///
    /// Returns `false` if the waiter was already released.
    pub fn mark_written(&self, id: CorrelationId, generation: u64) -> bool {
        match self
            .pending
            .lock()
            .recover_poison("SyncCallHandler::mark_written")
            .get_mut(&id)
        {
            Some(waiter) => {
                waiter.written_on = Some(generation);
                true
            }
            None => false,
        }
    }

    /// Forget a waiter whose request never made it onto the wire.
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.pending
            .lock()
            .recover_poison("SyncCallHandler::remove")
            .remove(&id)
            .is_some()
    }

    /// Release every waiter with `Closed`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self
            .pending
            .lock()
            .recover_poison("SyncCallHandler::fail_all")
            .drain()
            .collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.tx.send(Err(BridgeError::Closed));
        }
        count
    }

    /// Write `request` and wait for its response.
    pub async fn call(
        &self,
        connector: &Connector,
        switchboard: &Switchboard,
        request: &RequestEnvelope,
    ) -> BridgeResult<ResponseEnvelope> {
        let response = self.register(request.id).ok_or_else(|| {
            BridgeError::protocol(format!("correlation id {} already pending", request.id))
        })?;
        // A stopped switchboard has already released its handlers and will
        // never route this response.
        if switchboard.is_stopped() {
            self.remove(request.id);
            return Err(BridgeError::Closed);
        }
        switchboard.notify_activity();

        let generation = match connector.write_request(request).await {
            Ok(generation) => generation,
            Err(e) => {
                self.remove(request.id);
                return Err(e);
            }
        };
        // The connection may have been lost before the generation was recorded.
        if self.mark_written(request.id, generation) && connector.lost_generation() >= generation
        {
            self.connection_lost(generation);
        }

        match response.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Closed),
        }
    }
}

impl ResponseHandler for SyncCallHandler {
    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .recover_poison("SyncCallHandler::pending_count")
            .len()
    }

    fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending
            .lock()
            .recover_poison("SyncCallHandler::is_pending")
            .contains_key(&id)
    }

    fn response_received(&self, response: ResponseEnvelope) {
        let waiter = self
            .pending
            .lock()
            .recover_poison("SyncCallHandler::response_received")
            .remove(&response.id);
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(Ok(response));
        }
    }

    fn abandon_pending(&self, reason: &str) {
        let released = self.fail_all();
        log::debug!(
            target: "resolver_bridge::switchboard",
            "Released {} synchronous callers: {}",
            released,
            reason
        );
    }

    fn connection_lost(&self, generation: u64) -> usize {
        let released: Vec<_> = {
            let mut pending = self
                .pending
                .lock()
                .recover_poison("SyncCallHandler::connection_lost");
            let lost: Vec<_> = pending
                .iter()
                .filter(|(_, waiter)| waiter.written_on.is_some_and(|g| g <= generation))
                .map(|(id, _)| *id)
                .collect();
            lost.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        let count = released.len();
        for waiter in released {
            let _ = waiter.tx.send(Err(connection_lost_error()));
        }
        count
    }
}

/// [`Exchange`] performing a synchronous call through the switchboard.
pub struct SyncExchange {
    connector: Arc<Connector>,
    switchboard: Arc<Switchboard>,
    handler: Arc<SyncCallHandler>,
}

impl SyncExchange {
    pub fn new(
        connector: Arc<Connector>,
        switchboard: Arc<Switchboard>,
        handler: Arc<SyncCallHandler>,
    ) -> Self {
        Self {
            connector,
            switchboard,
            handler,
        }
    }
}

impl Exchange for SyncExchange {
    async fn exchange(&self, mut request: RequestEnvelope) -> BridgeResult<ResponseEnvelope> {
        request.mark_transmitted();
        self.handler
            .call(&self.connector, &self.switchboard, &request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_rejects_duplicate_ids() {
        let handler = SyncCallHandler::new();
        assert!(handler.register(CorrelationId::new(1)).is_some());
        assert!(handler.register(CorrelationId::new(1)).is_none());
        assert_eq!(handler.pending_count(), 1);
    }

    #[tokio::test]
    async fn response_is_delivered_once() {
        let handler = SyncCallHandler::new();
        let rx = handler.register(CorrelationId::new(7)).unwrap();

        handler.response_received(ResponseEnvelope::success(CorrelationId::new(7), json!("ok")));
        assert!(!handler.is_pending(CorrelationId::new(7)));
        // A duplicate is simply not claimed.
        handler.response_received(ResponseEnvelope::success(CorrelationId::new(7), json!("dup")));

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.result, json!("ok"));
    }

    #[tokio::test]
    async fn abandon_releases_waiters_as_closed() {
        let handler = SyncCallHandler::new();
        let first = handler.register(CorrelationId::new(1)).unwrap();
        let second = handler.register(CorrelationId::new(2)).unwrap();

        handler.abandon_pending("test");

        assert!(matches!(first.await.unwrap(), Err(BridgeError::Closed)));
        assert!(matches!(second.await.unwrap(), Err(BridgeError::Closed)));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn lost_connection_releases_only_requests_written_on_it() {
        let handler = SyncCallHandler::new();
        let old = handler.register(CorrelationId::new(1)).unwrap();
        let mut current = handler.register(CorrelationId::new(2)).unwrap();
        let mut unwritten = handler.register(CorrelationId::new(3)).unwrap();
        assert!(handler.mark_written(CorrelationId::new(1), 1));
        assert!(handler.mark_written(CorrelationId::new(2), 2));
        assert!(!handler.mark_written(CorrelationId::new(9), 1));

        assert_eq!(handler.connection_lost(1), 1);

        let err = old.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportFailure);
        assert!(current.try_recv().is_err());
        assert!(unwritten.try_recv().is_err());
        assert_eq!(handler.pending_count(), 2);
    }
}
