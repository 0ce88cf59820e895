//! Response routing for all handlers sharing the connector.
//!
//! The [`Switchboard`] is the only reader of the connector. It pulls one
//! response at a time and hands it to whichever registered
//! [`ResponseHandler`] has that correlation id outstanding. It does not care
//! how many handlers are registered or what they do with responses.
//!
//! # Idle behaviour
//!
//! Before each read the switchboard checks whether any handler has
//! outstanding ids. If none do, it waits (bounded by the idle poll interval,
//! or until [`Switchboard::notify_activity`]) instead of reading.
//!
//! # Lost connections
//!
//! Alongside the routing loop a watcher follows the connector's lost
//! generation and tells every handler, so requests written on a connection
//! that has since been dropped or replaced are released rather than waited
//! on forever. If the routing loop itself fails it detaches the connector:
//! nothing would read responses any more, so later writes must fail fast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connector::Connector;
use super::protocol::{CorrelationId, ResponseEnvelope};
use crate::error::{BridgeError, ErrorKind, LockResultExt};

/// A consumer of responses routed by the [`Switchboard`].
///
/// Implementations track their own outstanding correlation ids. An id must
/// be pending before its request is written and must stop being pending once
/// [`ResponseHandler::response_received`] has been called for it.
pub trait ResponseHandler: Send + Sync {
    /// Number of ids this handler is still waiting for.
    fn pending_count(&self) -> usize;

    /// Whether `id` is outstanding for this handler.
    fn is_pending(&self, id: CorrelationId) -> bool;

    /// Deliver the response for an outstanding id.
    fn response_received(&self, response: ResponseEnvelope);

    /// Release every waiter; no more responses will be routed.
    fn abandon_pending(&self, reason: &str);

    /// Release ids written on connection `generation` or an older one.
    ///
    /// Returns how many were released.
    fn connection_lost(&self, generation: u64) -> usize;
}

/// Snapshot of routing activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchboardStats {
    pub delivered: u64,
    /// Responses no handler claimed
    pub unclaimed: u64,
}

/// The single response-routing loop.
pub struct Switchboard {
    connector: Arc<Connector>,
    handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
    activity: Notify,
    idle_poll: Duration,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    delivered: AtomicU64,
    unclaimed: AtomicU64,
}

impl Switchboard {
    /// Create a stopped switchboard; it also stops when `abort` is cancelled.
    pub fn new(
        connector: Arc<Connector>,
        idle_poll: Duration,
        abort: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            handlers: RwLock::new(Vec::new()),
            activity: Notify::new(),
            idle_poll,
            stop: abort.child_token(),
            task: Mutex::new(None),
            delivered: AtomicU64::new(0),
            unclaimed: AtomicU64::new(0),
        })
    }

    /// Spawn the routing loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().recover_poison("Switchboard::start");
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(self).route_loop()));
    }

    /// Ask the routing loop to finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the routing loop to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().recover_poison("Switchboard::join").take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(
                target: "resolver_bridge::switchboard",
                "Switchboard task ended abnormally: {}",
                e
            );
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Register a handler. Registering the same handler twice is a no-op.
    pub fn register_handler(&self, handler: Arc<dyn ResponseHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .recover_poison("Switchboard::register_handler");
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
        drop(handlers);
        self.notify_activity();
    }

    /// Unregister a handler. Unknown handlers are ignored.
    pub fn unregister_handler(&self, handler: &Arc<dyn ResponseHandler>) {
        self.handlers
            .write()
            .recover_poison("Switchboard::unregister_handler")
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .recover_poison("Switchboard::handler_count")
            .len()
    }

    /// Wake an idle routing loop after new ids became pending.
    pub fn notify_activity(&self) {
        self.activity.notify_one();
    }

    pub fn stats(&self) -> SwitchboardStats {
        SwitchboardStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            unclaimed: self.unclaimed.load(Ordering::Relaxed),
        }
    }

    fn has_pending(&self) -> bool {
        self.handlers
            .read()
            .recover_poison("Switchboard::has_pending")
            .iter()
            .any(|h| h.pending_count() > 0)
    }

    fn handlers(&self) -> Vec<Arc<dyn ResponseHandler>> {
        self.handlers
            .read()
            .recover_poison("Switchboard::handlers")
            .clone()
    }

    /// Tell every handler that generations up to `generation` are gone.
    fn release_lost(&self, generation: u64) {
        let released: usize = self
            .handlers()
            .iter()
            .map(|h| h.connection_lost(generation))
            .sum();
        if released > 0 {
            info!(
                target: "resolver_bridge::switchboard",
                "Released {} requests written on lost connection {} or older",
                released,
                generation
            );
        }
    }

    async fn loss_loop(self: Arc<Self>) {
        let mut losses = self.connector.subscribe_losses();
        loop {
            let lost = *losses.borrow_and_update();
            if lost > 0 {
                self.release_lost(lost);
            }
            tokio::select! {
                _ = self.stop.cancelled() => break,
                changed = losses.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Deliver one response to the handler that owns its id.
    fn route(&self, response: ResponseEnvelope) {
        let owner = self
            .handlers
            .read()
            .recover_poison("Switchboard::route")
            .iter()
            .find(|h| h.is_pending(response.id))
            .cloned();

        match owner {
            Some(handler) => {
                handler.response_received(response);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.unclaimed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "resolver_bridge::switchboard",
                    "{:?}: no handler owns response {}, dropping",
                    ErrorKind::ProtocolAnomaly,
                    response.id
                );
            }
        }
    }

    async fn route_loop(self: Arc<Self>) {
        let watcher = tokio::spawn(Arc::clone(&self).loss_loop());

        let reason = loop {
            if self.stop.is_cancelled() {
                break "switchboard stopped".to_string();
            }

            if !self.has_pending() {
                let notified = self.activity.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.has_pending() {
                    tokio::select! {
                        _ = self.stop.cancelled() => {}
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.idle_poll) => {}
                    }
                    continue;
                }
            }

            let read = tokio::select! {
                _ = self.stop.cancelled() => continue,
                read = self.connector.read_response() => read,
            };

            match read {
                Ok(response) => self.route(response),
                Err(BridgeError::Closed) => {
                    info!(
                        target: "resolver_bridge::switchboard",
                        "Connector closed, switchboard exiting"
                    );
                    break "connector closed".to_string();
                }
                Err(e) => {
                    warn!(
                        target: "resolver_bridge::switchboard",
                        "Reading responses failed: {}; closing the connector",
                        e
                    );
                    let _ = self.connector.detach();
                    break format!("reader error: {}", e);
                }
            }
        };

        self.stop.cancel();
        watcher.abort();
        for handler in self.handlers() {
            if handler.pending_count() > 0 {
                handler.abandon_pending(&reason);
            }
        }
        debug!(
            target: "resolver_bridge::switchboard",
            "Switchboard exited: {}",
            reason
        );
    }
}
