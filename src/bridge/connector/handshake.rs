//! Handshake loop for the connector's listening socket.
//!
//! Every accepted socket must send the authentication frame within the
//! handshake timeout. Sockets presenting the expected value are promoted to
//! the live connection; anything else is closed without a response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};

use super::Connector;
use crate::bridge::protocol::read_auth_frame;
use crate::error::ErrorKind;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(super) async fn accept_loop(connector: Arc<Connector>, listener: TcpListener) {
    let closed = connector.closed.clone();
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!(
                    target: "resolver_bridge::handshake",
                    "Handshake loop on port {} stopped",
                    connector.port
                );
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(authenticate(Arc::clone(&connector), stream, peer));
                }
                Err(e) => {
                    warn!(
                        target: "resolver_bridge::handshake",
                        "accept failed: {}",
                        e
                    );
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

async fn authenticate(connector: Arc<Connector>, mut stream: TcpStream, peer: SocketAddr) {
    let timeout = connector.settings.handshake_timeout();
    let received = tokio::select! {
        _ = connector.closed.cancelled() => return,
        received = tokio::time::timeout(timeout, read_auth_frame(&mut stream)) => received,
    };

    let received = match received {
        Ok(Ok(auth)) => auth,
        Ok(Err(e)) => {
            debug!(
                target: "resolver_bridge::handshake",
                "No handshake from {}: {}",
                peer,
                e
            );
            return;
        }
        Err(_) => {
            debug!(
                target: "resolver_bridge::handshake",
                "Handshake from {} timed out after {:?}",
                peer,
                timeout
            );
            return;
        }
    };

    match connector.expected_auth() {
        Some(expected) if expected == received => connector.promote(stream, received),
        expected => {
            connector
                .counters
                .rejected_handshakes
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "resolver_bridge::handshake",
                "{:?}: dropping {} (presented {}, expected {:?})",
                ErrorKind::HandshakeMismatch,
                peer,
                received,
                expected
            );
            drop(stream);
        }
    }
}
