//! Drives the `peer` subcommand as a real subprocess.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::test_settings;
use resolver_bridge::{Operation, ProcessSupervisor, Session, SubprocessSupervisor};
use serde_json::json;

fn peer_supervisor(extra: &[&str]) -> Arc<ProcessSupervisor> {
    let mut args: Vec<String> = ["peer", "--port", "{port}", "--auth", "{auth}"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(extra.iter().map(|s| s.to_string()));
    Arc::new(ProcessSupervisor::new(
        env!("CARGO_BIN_EXE_resolver-bridge"),
        args,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launched_peer_answers_and_is_terminated_on_shutdown() {
    let supervisor = peer_supervisor(&[]);
    let session = Session::launch(test_settings(), supervisor.clone())
        .await
        .unwrap();
    assert!(supervisor.is_alive());

    for _ in 0..3 {
        let request = session.request(Operation::NoOp);
        assert_eq!(session.send_sync_request(request).await.unwrap(), json!("pong"));
    }
    let request = session.request(Operation::HowEntity).with_payload("E-42");
    assert_eq!(session.send_sync_request(request).await.unwrap(), json!("E-42"));

    session.shutdown().await;

    let mut alive = true;
    for _ in 0..100 {
        if !supervisor.is_alive() {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive, "peer process outlived the session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_with_wrong_program_fails_to_launch() {
    let supervisor = Arc::new(ProcessSupervisor::new(
        "/nonexistent/resolver-bridge-peer",
        Vec::new(),
    ));
    let err = Session::launch(test_settings(), supervisor)
        .await
        .err()
        .expect("launch must fail");
    assert_eq!(err.kind(), resolver_bridge::ErrorKind::TransportFailure);
}
