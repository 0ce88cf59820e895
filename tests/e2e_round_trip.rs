//! End-to-end request/response tests against the in-process reference peer.

mod helpers;

use std::collections::HashSet;
use std::sync::Arc;

use helpers::{attach_peer, open_with_peer, test_settings};
use resolver_bridge::bridge::{AuthEpoch, CallerId};
use resolver_bridge::{BridgeError, ErrorKind, Operation, Session};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_op_returns_pong() {
    let (session, peer) = open_with_peer(test_settings()).await;

    let request = session.request(Operation::NoOp);
    assert_eq!(request.id.as_u64(), 1);
    let value = session.send_sync_request(request).await.unwrap();
    assert_eq!(value, json!("pong"));

    session.shutdown().await;
    let summary = peer.await.unwrap().unwrap();
    assert_eq!(summary.answered, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_their_own_responses() {
    let (session, _peer) = open_with_peer(test_settings()).await;
    let session = Arc::new(session);

    let mut calls = Vec::new();
    for n in 0..64 {
        let session = Arc::clone(&session);
        calls.push(tokio::spawn(async move {
            let request = session
                .request(Operation::GetEntity)
                .with_payload(format!("entity-{}", n));
            let id = request.id;
            let value = session.send_sync_request(request).await.unwrap();
            (id, n, value)
        }));
    }

    let mut seen = HashSet::new();
    for call in calls {
        let (id, n, value) = call.await.unwrap();
        assert_eq!(value, json!(format!("entity-{}", n)));
        assert!(seen.insert(id), "{} delivered twice", id);
    }
    assert_eq!(seen.len(), 64);
    assert_eq!(session.switchboard().stats().unclaimed, 0);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prioritized_sends_through_executor_pool() {
    let mut settings = test_settings();
    settings.dispatch.concurrency = 4;
    let (session, _peer) = open_with_peer(settings).await;
    let session = Arc::new(session);

    let urgent = CallerId::new(1);
    session.prioritize_caller(urgent);

    let mut calls = Vec::new();
    for n in 0..32u64 {
        let session = Arc::clone(&session);
        let caller = if n % 4 == 0 { urgent } else { CallerId::new(100 + n) };
        calls.push(tokio::spawn(async move {
            let request = session
                .request(Operation::FindPath)
                .with_payload(n.to_string());
            session.send_prioritized(caller, request).await
        }));
    }
    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!(n.to_string()));
    }

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_failures_carry_their_code() {
    let session = Session::open(test_settings(), None).await.unwrap();
    let _peer = attach_peer(&session, |options| {
        options.fail_payloads.insert("broken".to_string());
    })
    .await;

    let request = session.request(Operation::AddRecord).with_payload("broken");
    let err = session.send_sync_request(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineLogicFailure);
    assert_eq!(err.engine_code(), Some(resolver_bridge::peer::RECORD_FAILURE_CODE));
    assert!(!err.is_fatal());

    // The session keeps working after a non-critical failure.
    let request = session.request(Operation::NoOp);
    assert_eq!(session.send_sync_request(request).await.unwrap(), json!("pong"));

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_export_request_is_cancelled_without_io() {
    let (session, _peer) = open_with_peer(test_settings()).await;

    let request = session
        .request(Operation::ExportFetchNext)
        .bound_to(AuthEpoch::from_raw(0xdead));
    let written_before = session.connector().stats().frames_written;

    let err = session.send_sync_request(request).await.unwrap_err();
    assert!(matches!(err, BridgeError::CancelledOnRestart { .. }), "{}", err);
    assert_eq!(session.connector().stats().frames_written, written_before);

    session.shutdown().await;
}
