//! Shared helpers for bridge integration tests.
#![allow(dead_code)]

use std::time::Duration;

use resolver_bridge::bridge::AuthEpoch;
use resolver_bridge::peer::{PeerOptions, PeerSummary, run_peer};
use resolver_bridge::{BridgeResult, BridgeSettings, Session};
use tokio::task::JoinHandle;

/// Settings with short waits so failure paths finish quickly.
pub fn test_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::default();
    settings.transport.retry_ceiling = 3;
    settings.transport.reconnect_wait_ms = 300;
    settings.transport.handshake_timeout_ms = 1_000;
    settings.transport.startup_timeout_ms = 5_000;
    settings.dispatch.idle_poll_ms = 10;
    settings.backpressure.poll_ms = 20;
    settings.cleanup.base_backoff_ms = 5;
    settings.validate().expect("test settings are valid")
}

/// Start the reference peer in-process and wait until it is live.
pub async fn attach_peer<F>(session: &Session, configure: F) -> JoinHandle<BridgeResult<PeerSummary>>
where
    F: FnOnce(&mut PeerOptions),
{
    let epoch: AuthEpoch = session.expect_peer();
    let mut options = PeerOptions::new(session.port(), epoch);
    configure(&mut options);
    let handle = tokio::spawn(run_peer(options));
    session
        .connector()
        .wait_until_live(Duration::from_secs(5))
        .await
        .expect("peer never authenticated");
    handle
}

/// Open a session with an in-process peer using default peer options.
pub async fn open_with_peer(settings: BridgeSettings) -> (Session, JoinHandle<BridgeResult<PeerSummary>>) {
    let session = Session::open(settings, None).await.expect("session opens");
    let peer = attach_peer(&session, |_| {}).await;
    (session, peer)
}
