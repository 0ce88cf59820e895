//! One controller session against one resolver subprocess.
//!
//! A [`Session`] owns every per-subprocess component: the connector, the
//! switchboard with its synchronous-call handler, the priority dispatcher,
//! the correlation id generator and the abort token observed by all of
//! them. Components receive what they need from the session explicitly;
//! there is no process-wide state. [`SessionRegistry`] offers lookup by id
//! for callers that need to share sessions.

mod registry;

pub use registry::{SessionId, SessionRegistry};

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cleanup::{RedoGate, RedoStore};
use super::connector::Connector;
use super::handler::{SyncCallHandler, SyncExchange};
use super::loader::BulkLoader;
use super::prioritizer::{CallerId, OwnerToken, SendPrioritizer};
use super::protocol::{
    AuthEpoch, CorrelationId, CorrelationIdGenerator, Operation, RequestEnvelope, ResponseEnvelope,
};
use super::restart::RestartCoordinator;
use super::subprocess::SubprocessSupervisor;
use super::switchboard::{ResponseHandler, Switchboard};
use crate::config::BridgeSettings;
use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// A running bridge to one resolver subprocess.
pub struct Session {
    id: SessionId,
    settings: BridgeSettings,
    ids: Arc<CorrelationIdGenerator>,
    connector: Arc<Connector>,
    switchboard: Arc<Switchboard>,
    sync_handler: Arc<SyncCallHandler>,
    dispatcher: Arc<SendPrioritizer<SyncExchange>>,
    owner: Mutex<Option<OwnerToken>>,
    gate: Arc<RedoGate>,
    abort: CancellationToken,
}

impl Session {
    /// Bind the connector and start the routing and dispatch loops.
    ///
    /// No subprocess is spawned; the peer is expected to be started by the
    /// caller against [`Session::port`] with the value from
    /// [`Session::expect_peer`]. A `supervisor`, if given, is consulted for
    /// liveness and restarts.
    pub async fn open(
        settings: BridgeSettings,
        supervisor: Option<Arc<dyn SubprocessSupervisor>>,
    ) -> BridgeResult<Self> {
        let abort = CancellationToken::new();
        let restart = RestartCoordinator::new(settings.restart.budget, supervisor);
        let connector = Connector::bind(settings.transport.clone(), restart, &abort).await?;

        let switchboard = Switchboard::new(
            Arc::clone(&connector),
            settings.dispatch.idle_poll(),
            &abort,
        );
        let sync_handler = Arc::new(SyncCallHandler::new());
        switchboard.register_handler(sync_handler.clone());
        switchboard.start();

        let exchange = Arc::new(SyncExchange::new(
            Arc::clone(&connector),
            Arc::clone(&switchboard),
            Arc::clone(&sync_handler),
        ));
        let (dispatcher, owner) = SendPrioritizer::start(
            exchange,
            settings.dispatch.concurrency,
            settings.dispatch.idle_poll(),
            &abort,
        );

        let id = SessionId::new();
        debug!(
            target: "resolver_bridge::session",
            "Session {} opened on port {}",
            id,
            connector.port()
        );

        Ok(Self {
            id,
            settings,
            ids: Arc::new(CorrelationIdGenerator::new()),
            connector,
            switchboard,
            sync_handler,
            dispatcher,
            owner: Mutex::new(Some(owner)),
            gate: Arc::new(RedoGate::new()),
            abort,
        })
    }

    /// Open a session and spawn the first subprocess incarnation through
    /// `supervisor`, waiting until it has authenticated.
    pub async fn launch(
        settings: BridgeSettings,
        supervisor: Arc<dyn SubprocessSupervisor>,
    ) -> BridgeResult<Self> {
        let startup_timeout = settings.transport.startup_timeout();
        let session = Self::open(settings, Some(Arc::clone(&supervisor))).await?;

        let epoch = session.expect_peer();
        if let Err(e) = supervisor.respawn(session.port(), epoch) {
            session.shutdown().await;
            return Err(e);
        }
        match session.connector.wait_until_live(startup_timeout).await {
            Ok(live) => {
                info!(
                    target: "resolver_bridge::session",
                    "Session {} connected to resolver (epoch {})",
                    session.id,
                    live
                );
                Ok(session)
            }
            Err(e) => {
                warn!(
                    target: "resolver_bridge::session",
                    "Resolver did not connect within {:?}: {}",
                    startup_timeout,
                    e
                );
                session.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Loopback port the resolver must connect back to.
    pub fn port(&self) -> u16 {
        self.connector.port()
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    /// Shared redo admission gate.
    pub fn redo_gate(&self) -> &Arc<RedoGate> {
        &self.gate
    }

    /// Mint the authentication value for an externally started peer.
    pub fn expect_peer(&self) -> AuthEpoch {
        let epoch = AuthEpoch::generate();
        self.connector.expect_auth(epoch);
        epoch
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        self.ids.next_id()
    }

    /// Build a request with a fresh correlation id.
    ///
    /// Operations that must not outlive a subprocess incarnation are bound
    /// to the current live epoch.
    pub fn request(&self, operation: Operation) -> RequestEnvelope {
        let request = RequestEnvelope::new(self.next_correlation_id(), operation);
        match self.connector.live_epoch() {
            Some(epoch) if operation.traits().cancel_on_restart => request.bound_to(epoch),
            _ => request,
        }
    }

    /// Write `request` and wait for its response, bypassing the dispatch queue.
    pub async fn send_sync_request(&self, request: RequestEnvelope) -> BridgeResult<Value> {
        self.exchange(request).await?.into_result()
    }

    /// Like [`Session::send_sync_request`] but returns the whole envelope.
    pub async fn exchange(
        &self,
        mut request: RequestEnvelope,
    ) -> BridgeResult<ResponseEnvelope> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        request.mark_transmitted();
        self.sync_handler
            .call(&self.connector, &self.switchboard, &request)
            .await
    }

    /// Submit `request` through the priority dispatcher on behalf of `caller`.
    pub async fn send_prioritized(
        &self,
        caller: CallerId,
        request: RequestEnvelope,
    ) -> BridgeResult<Value> {
        self.dispatcher.send(caller, request).await?.into_result()
    }

    /// Move `caller` ahead of every caller prioritized before it.
    pub fn prioritize_caller(&self, caller: CallerId) -> i64 {
        self.dispatcher.prioritize(caller)
    }

    pub fn unprioritize_caller(&self, caller: CallerId) {
        self.dispatcher.unprioritize(caller);
    }

    /// A bulk loader sharing this session's transport and id generator.
    pub fn bulk_loader(&self, store: Option<Arc<dyn RedoStore>>) -> BulkLoader {
        let loader = BulkLoader::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.switchboard),
            Arc::clone(&self.ids),
            &self.settings.backpressure,
            self.settings.redo.clone(),
            self.settings.cleanup.clone(),
            Arc::clone(&self.gate),
            &self.abort,
        );
        match store {
            Some(store) => loader.with_redo_store(store),
            None => loader,
        }
    }

    /// Whether the session can no longer carry requests.
    ///
    /// True after shutdown, and also once the connector was closed because
    /// response routing failed.
    pub fn is_closed(&self) -> bool {
        self.abort.is_cancelled() || self.connector.is_closed()
    }

    /// Tear the session down.
    ///
    /// Queued prioritized requests are dispatched first; then routing stops,
    /// the socket is handed to a shutdown helper, and the subprocess is
    /// terminated. Calling it twice is harmless.
    pub async fn shutdown(&self) {
        let owner = self.owner.lock().recover_poison("Session::shutdown").take();
        let Some(owner) = owner else {
            return;
        };

        self.dispatcher.complete(&owner);
        self.dispatcher.join().await;

        self.switchboard.stop();
        self.switchboard.join().await;
        let handler: Arc<dyn ResponseHandler> = self.sync_handler.clone();
        self.switchboard.unregister_handler(&handler);

        let flushed = self.connector.detach().join().await;
        if let Some(supervisor) = self.connector.restart_coordinator().supervisor() {
            supervisor.terminate();
        }
        self.abort.cancel();

        info!(
            target: "resolver_bridge::session",
            "Session {} shut down (socket flushed: {})",
            self.id,
            flushed
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}
