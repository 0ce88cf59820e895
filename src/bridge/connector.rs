//! The single socket to the resolver subprocess.
//!
//! The [`Connector`] listens on an ephemeral loopback port, authenticates the
//! subprocess that connects back (see `handshake`), and exposes a framed
//! request/response pair over the authenticated connection.
//!
//! # Failure handling
//!
//! Transport errors are retried transparently: the broken connection is
//! dropped, the operation waits (bounded) for the handshake loop to publish a
//! replacement, and tries again, up to the retry ceiling. Once the ceiling is
//! exhausted the [`RestartCoordinator`] decides between surfacing a transport
//! failure, restarting the subprocess, or reporting its death.
//!
//! Requests bound to an [`AuthEpoch`] are never retried across incarnations:
//! if the live epoch differs they fail with `CancelledOnRestart` before any
//! I/O is attempted.
//!
//! Every promoted connection gets a generation number. A write reports the
//! generation it landed on, and once that generation is dropped, replaced or
//! detached it is published through [`Connector::subscribe_losses`] so the
//! owners of requests written there can release them.

mod handshake;
mod shutdown;

pub use shutdown::ShutdownHelper;

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    AuthEpoch, CorrelationId, FrameReader, FrameWriter, RequestEnvelope, ResponseEnvelope,
};
use super::restart::{Recovery, RestartCoordinator};
use crate::config::TransportSettings;
use crate::error::{BridgeError, BridgeResult, ErrorKind, LockResultExt};

/// An authenticated connection to one subprocess incarnation.
pub(crate) struct LiveConnection {
    generation: u64,
    epoch: AuthEpoch,
    reader: tokio::sync::Mutex<FrameReader<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
}

impl LiveConnection {
    async fn write(&self, request: &RequestEnvelope) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_message(request).await
    }

    /// Read the next decodable response.
    ///
    /// Frames that arrive intact but do not decode as a response are logged
    /// and skipped; the stream itself is still in sync.
    async fn read(&self) -> io::Result<ResponseEnvelope> {
        let mut reader = self.reader.lock().await;
        loop {
            let body = reader.read_frame().await?;
            match serde_json::from_slice::<ResponseEnvelope>(&body) {
                Ok(response) => return Ok(response),
                Err(e) => warn!(
                    target: "resolver_bridge::connector",
                    "{:?}: skipping undecodable frame of {} bytes: {}",
                    ErrorKind::ProtocolAnomaly,
                    body.len(),
                    e
                ),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    transport_errors: AtomicU64,
    handshakes: AtomicU64,
    rejected_handshakes: AtomicU64,
}

/// Snapshot of connector activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    pub frames_written: u64,
    pub frames_read: u64,
    /// Failed I/O attempts (each one retried or surfaced)
    pub transport_errors: u64,
    /// Connections promoted to live
    pub handshakes: u64,
    /// Connections dropped for presenting the wrong authentication value
    pub rejected_handshakes: u64,
}

/// Outcome of one bounded retry loop that did not produce a value.
enum AttemptError {
    /// Stop immediately, no recovery
    Fatal(BridgeError),
    /// Every attempt failed at the transport level
    Exhausted { attempts: u32, source: io::Error },
}

/// Owner of the single physical connection to the resolver.
pub struct Connector {
    port: u16,
    settings: TransportSettings,
    expected_auth: Mutex<Option<AuthEpoch>>,
    live: watch::Sender<Option<Arc<LiveConnection>>>,
    live_epoch: ArcSwapOption<AuthEpoch>,
    generation: AtomicU64,
    /// Highest generation known to be gone; generations are never reused
    lost: watch::Sender<u64>,
    restart: RestartCoordinator,
    closed: CancellationToken,
    counters: Counters,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Bind an ephemeral loopback port and start the handshake loop.
    ///
    /// The connector closes when `abort` is cancelled or [`Connector::detach`]
    /// is called.
    pub async fn bind(
        settings: TransportSettings,
        restart: RestartCoordinator,
        abort: &CancellationToken,
    ) -> BridgeResult<Arc<Self>> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let (live, _) = watch::channel(None);

        let connector = Arc::new(Self {
            port,
            settings,
            expected_auth: Mutex::new(None),
            live,
            live_epoch: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            lost: watch::Sender::new(0),
            restart,
            closed: abort.child_token(),
            counters: Counters::default(),
            acceptor: Mutex::new(None),
        });

        let handle = tokio::spawn(handshake::accept_loop(Arc::clone(&connector), listener));
        *connector.acceptor.lock().recover_poison("Connector::bind") = Some(handle);

        info!(
            target: "resolver_bridge::connector",
            "Listening for resolver on 127.0.0.1:{}",
            port
        );
        Ok(connector)
    }

    /// Port the subprocess must connect back to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Set the authentication value the next incarnation must present.
    pub fn expect_auth(&self, epoch: AuthEpoch) {
        *self
            .expected_auth
            .lock()
            .recover_poison("Connector::expect_auth") = Some(epoch);
    }

    pub fn expected_auth(&self) -> Option<AuthEpoch> {
        *self
            .expected_auth
            .lock()
            .recover_poison("Connector::expected_auth")
    }

    /// Epoch of the most recently authenticated connection.
    ///
    /// Changes only when a handshake completes.
    pub fn live_epoch(&self) -> Option<AuthEpoch> {
        self.live_epoch.load().as_deref().copied()
    }

    /// Whether an authenticated connection is currently usable.
    pub fn is_live(&self) -> bool {
        self.live.borrow().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Every connection generation up to and including this one is gone.
    ///
    /// Responses to requests written on a lost generation will never arrive.
    pub fn lost_generation(&self) -> u64 {
        *self.lost.borrow()
    }

    /// Receiver that changes whenever [`Connector::lost_generation`] advances.
    pub fn subscribe_losses(&self) -> watch::Receiver<u64> {
        self.lost.subscribe()
    }

    pub fn restart_coordinator(&self) -> &RestartCoordinator {
        &self.restart
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            frames_read: self.counters.frames_read.load(Ordering::Relaxed),
            transport_errors: self.counters.transport_errors.load(Ordering::Relaxed),
            handshakes: self.counters.handshakes.load(Ordering::Relaxed),
            rejected_handshakes: self.counters.rejected_handshakes.load(Ordering::Relaxed),
        }
    }

    /// Wait for the first authenticated connection.
    pub async fn wait_until_live(&self, timeout: Duration) -> BridgeResult<AuthEpoch> {
        match self.acquire(timeout).await {
            Some(connection) => Ok(connection.epoch),
            None if self.is_closed() => Err(BridgeError::Closed),
            None => Err(BridgeError::TransportFailure {
                attempts: 1,
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("resolver did not connect within {:?}", timeout),
                ),
            }),
        }
    }

    /// Write one request frame.
    ///
    /// Returns the generation of the connection the frame was written on.
    pub async fn write_request(&self, request: &RequestEnvelope) -> BridgeResult<u64> {
        let bound = request.auth_epoch.map(|epoch| (request.id, epoch));
        self.check_epoch(bound, self.live_epoch())?;

        let generation = self
            .with_recovery("write", bound, move |connection: Arc<LiveConnection>| async move {
                connection.write(request).await.map(|()| connection.generation)
            })
            .await?;

        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(generation)
    }

    /// Read the next response frame.
    ///
    /// Waits for a response as long as the connection is healthy.
    pub async fn read_response(&self) -> BridgeResult<ResponseEnvelope> {
        let response = self
            .with_recovery("read", None, move |connection: Arc<LiveConnection>| async move {
                tokio::select! {
                    response = connection.read() => response,
                    _ = self.superseded(connection.generation) => Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection superseded",
                    )),
                }
            })
            .await?;

        self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }

    /// Close the connector and hand the live connection to a shutdown helper.
    ///
    /// Pending and future operations fail with `Closed`. Must be called from
    /// within a tokio runtime.
    pub fn detach(&self) -> ShutdownHelper {
        self.closed.cancel();
        if let Some(handle) = self
            .acceptor
            .lock()
            .recover_poison("Connector::detach")
            .take()
        {
            handle.abort();
        }
        let live = self.live.send_replace(None);
        if let Some(connection) = &live {
            self.mark_lost(connection.generation);
        }
        debug!(
            target: "resolver_bridge::connector",
            "Connector on port {} detached",
            self.port
        );
        ShutdownHelper::spawn(live, self.settings.handshake_timeout())
    }

    fn check_epoch(
        &self,
        bound: Option<(CorrelationId, AuthEpoch)>,
        live: Option<AuthEpoch>,
    ) -> BridgeResult<()> {
        match bound {
            Some((id, captured)) if live != Some(captured) => {
                debug!(
                    target: "resolver_bridge::connector",
                    "Request {} bound to epoch {} cancelled (live {:?})",
                    id,
                    captured,
                    live
                );
                Err(BridgeError::CancelledOnRestart { id, captured, live })
            }
            _ => Ok(()),
        }
    }

    /// Run `io` with reconnect retries, then restart recovery.
    async fn with_recovery<T, F, Fut>(
        &self,
        what: &'static str,
        bound: Option<(CorrelationId, AuthEpoch)>,
        io: F,
    ) -> BridgeResult<T>
    where
        F: Fn(Arc<LiveConnection>) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let observed = self.live_epoch();
        let first = self
            .attempt_loop(
                what,
                bound,
                self.settings.retry_ceiling,
                self.settings.reconnect_wait(),
                &io,
            )
            .await;

        let value = match first {
            Ok(value) => value,
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Exhausted { attempts, source }) => {
                match self.restart.recover(self, observed).await? {
                    Recovery::StillAlive => {
                        return Err(BridgeError::TransportFailure { attempts, source });
                    }
                    recovery => {
                        debug!(
                            target: "resolver_bridge::connector",
                            "Retrying {} once after {:?}",
                            what,
                            recovery
                        );
                        let retry = self
                            .attempt_loop(what, bound, 1, self.settings.startup_timeout(), &io)
                            .await;
                        match retry {
                            Ok(value) => value,
                            Err(AttemptError::Fatal(e)) => return Err(e),
                            Err(AttemptError::Exhausted {
                                attempts: extra,
                                source,
                            }) => {
                                return Err(BridgeError::TransportFailure {
                                    attempts: attempts + extra,
                                    source,
                                });
                            }
                        }
                    }
                }
            }
        };

        self.restart.record_success();
        Ok(value)
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        what: &'static str,
        bound: Option<(CorrelationId, AuthEpoch)>,
        attempts: u32,
        wait: Duration,
        io: &F,
    ) -> Result<T, AttemptError>
    where
        F: Fn(Arc<LiveConnection>) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(AttemptError::Fatal(BridgeError::Closed));
            }
            self.check_epoch(bound, self.live_epoch())
                .map_err(AttemptError::Fatal)?;

            let Some(connection) = self.acquire(wait).await else {
                if self.is_closed() {
                    return Err(AttemptError::Fatal(BridgeError::Closed));
                }
                debug!(
                    target: "resolver_bridge::connector",
                    "No connection for {} within {:?} (attempt {}/{})",
                    what,
                    wait,
                    attempt,
                    attempts
                );
                last_error = Some(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no live connection",
                ));
                continue;
            };
            self.check_epoch(bound, Some(connection.epoch))
                .map_err(AttemptError::Fatal)?;

            let outcome = tokio::select! {
                _ = self.closed.cancelled() => {
                    return Err(AttemptError::Fatal(BridgeError::Closed));
                }
                outcome = io(Arc::clone(&connection)) => outcome,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "resolver_bridge::connector",
                        "{} failed on connection {} (attempt {}/{}): {}",
                        what,
                        connection.generation,
                        attempt,
                        attempts,
                        e
                    );
                    self.drop_connection(connection.generation);
                    last_error = Some(e);
                }
            }
        }

        Err(AttemptError::Exhausted {
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::other("retry ceiling reached")),
        })
    }

    /// Wait up to `wait` for a live connection.
    async fn acquire(&self, wait: Duration) -> Option<Arc<LiveConnection>> {
        let mut rx = self.live.subscribe();
        let published = async move {
            rx.wait_for(|live| live.is_some())
                .await
                .ok()
                .and_then(|live| live.clone())
        };
        tokio::select! {
            _ = self.closed.cancelled() => None,
            acquired = tokio::time::timeout(wait, published) => acquired.ok().flatten(),
        }
    }

    /// Resolves once connection `generation` is no longer the live one.
    async fn superseded(&self, generation: u64) {
        let mut rx = self.live.subscribe();
        let _ = rx
            .wait_for(|live| live.as_ref().map(|c| c.generation) != Some(generation))
            .await;
    }

    /// Drop the live connection if it is still `generation`.
    fn drop_connection(&self, generation: u64) {
        let dropped = self.live.send_if_modified(|live| {
            if live.as_ref().is_some_and(|c| c.generation == generation) {
                *live = None;
                true
            } else {
                false
            }
        });
        if dropped {
            debug!(
                target: "resolver_bridge::connector",
                "Dropped broken connection {}",
                generation
            );
            self.mark_lost(generation);
        }
    }

    fn mark_lost(&self, generation: u64) {
        self.lost.send_if_modified(|lost| {
            if generation > *lost {
                *lost = generation;
                true
            } else {
                false
            }
        });
    }

    /// Publish an authenticated stream as the live connection.
    fn promote(&self, stream: TcpStream, epoch: AuthEpoch) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(
                target: "resolver_bridge::connector",
                "set_nodelay failed: {}",
                e
            );
        }
        let (read_half, write_half) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = Arc::new(LiveConnection {
            generation,
            epoch,
            reader: tokio::sync::Mutex::new(FrameReader::new(read_half)),
            writer: tokio::sync::Mutex::new(FrameWriter::new(
                write_half,
                self.settings.stream_reset_interval,
            )),
        });

        let previous = self.live_epoch.swap(Some(Arc::new(epoch)));
        if let Some(replaced) = self.live.send_replace(Some(connection)) {
            self.mark_lost(replaced.generation);
        }
        self.counters.handshakes.fetch_add(1, Ordering::Relaxed);

        match previous.as_deref() {
            Some(old) if *old != epoch => info!(
                target: "resolver_bridge::connector",
                "Connection {} live; epoch changed {} -> {}",
                generation,
                old,
                epoch
            ),
            _ => info!(
                target: "resolver_bridge::connector",
                "Connection {} live with epoch {}",
                generation,
                epoch
            ),
        }
    }
}
