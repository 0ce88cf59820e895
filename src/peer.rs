//! Reference resolver peer.
//!
//! A minimal stand-in for the native resolver: it connects back to the
//! controller, authenticates, and answers requests until the connection
//! closes. `no_op` is answered with `"pong"`; any other request echoes its
//! payload unless the payload was configured to fail.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::json;
use tokio::net::TcpStream;

use crate::bridge::protocol::{
    AuthEpoch, FrameReader, FrameWriter, Operation, RequestEnvelope, ResponseEnvelope,
    ResponseTiming, write_auth_frame,
};
use crate::error::{BridgeResult, EngineError};

/// Engine code for a configured non-critical failure.
pub const RECORD_FAILURE_CODE: i64 = 1;
/// Engine code for a configured critical failure.
pub const CRITICAL_FAILURE_CODE: i64 = 2;

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub port: u16,
    pub auth: AuthEpoch,
    /// Payloads answered with a non-critical failure
    pub fail_payloads: HashSet<String>,
    /// Payloads answered with a critical failure
    pub critical_payloads: HashSet<String>,
    /// Disconnect after this many responses
    pub exit_after: Option<u64>,
    /// Simulated engine time per request
    pub delay: Duration,
}

impl PeerOptions {
    pub fn new(port: u16, auth: AuthEpoch) -> Self {
        Self {
            port,
            auth,
            fail_payloads: HashSet::new(),
            critical_payloads: HashSet::new(),
            exit_after: None,
            delay: Duration::ZERO,
        }
    }
}

/// What the peer did before disconnecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSummary {
    pub answered: u64,
    pub failed: u64,
}

/// Connect, authenticate and serve requests until EOF or `exit_after`.
pub async fn run_peer(options: PeerOptions) -> BridgeResult<PeerSummary> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, options.port)).await?;
    stream.set_nodelay(true)?;
    write_auth_frame(&mut stream, options.auth).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half, 1_000);

    info!(
        target: "resolver_bridge::peer",
        "Peer connected to port {} with epoch {}",
        options.port,
        options.auth
    );

    let mut summary = PeerSummary::default();
    loop {
        if options.exit_after.is_some_and(|limit| summary.answered >= limit) {
            debug!(
                target: "resolver_bridge::peer",
                "Exiting after {} responses",
                summary.answered
            );
            break;
        }

        let request: RequestEnvelope = match reader.read_message().await {
            Ok(request) => request,
            Err(e) => {
                debug!(target: "resolver_bridge::peer", "Controller went away: {}", e);
                break;
            }
        };

        let started = Instant::now();
        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
        let mut response = answer(&options, &request);
        response.timing = Some(ResponseTiming {
            engine_us: elapsed_micros(started.elapsed()),
            ..ResponseTiming::default()
        });
        if !response.success {
            summary.failed += 1;
        }

        writer.write_message(&response).await?;
        summary.answered += 1;
    }

    let _ = writer.shutdown().await;
    Ok(summary)
}

/// Saturates instead of truncating for durations past `u64::MAX` microseconds.
fn elapsed_micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

fn answer(options: &PeerOptions, request: &RequestEnvelope) -> ResponseEnvelope {
    if options.critical_payloads.contains(&request.payload) {
        return ResponseEnvelope::failure(
            request.id,
            EngineError::critical(CRITICAL_FAILURE_CODE, format!("engine halted on {}", request.payload)),
        );
    }
    if options.fail_payloads.contains(&request.payload) {
        return ResponseEnvelope::failure(
            request.id,
            EngineError::new(RECORD_FAILURE_CODE, format!("rejected {}", request.payload)),
        );
    }
    match request.operation {
        Operation::NoOp => ResponseEnvelope::success(request.id, json!("pong")),
        _ => ResponseEnvelope::success(request.id, json!(request.payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CorrelationId;

    fn options() -> PeerOptions {
        let mut options = PeerOptions::new(0, AuthEpoch::from_raw(1));
        options.fail_payloads.insert("bad".to_string());
        options.critical_payloads.insert("fatal".to_string());
        options
    }

    #[test]
    fn no_op_answers_pong() {
        let request = RequestEnvelope::new(CorrelationId::new(1), Operation::NoOp);
        let response = answer(&options(), &request);
        assert_eq!(response.into_result().unwrap(), json!("pong"));
    }

    #[test]
    fn configured_payloads_fail() {
        let options = options();
        let bad = RequestEnvelope::new(CorrelationId::new(2), Operation::AddRecord).with_payload("bad");
        let fatal =
            RequestEnvelope::new(CorrelationId::new(3), Operation::AddRecord).with_payload("fatal");
        let good = RequestEnvelope::new(CorrelationId::new(4), Operation::AddRecord).with_payload("ok");

        let bad = answer(&options, &bad);
        assert!(!bad.success && !bad.is_critical_failure());
        assert!(answer(&options, &fatal).is_critical_failure());
        assert_eq!(answer(&options, &good).into_result().unwrap(), json!("ok"));
    }

    #[test]
    fn engine_time_saturates() {
        assert_eq!(elapsed_micros(Duration::from_millis(3)), 3_000);
        assert_eq!(elapsed_micros(Duration::MAX), u64::MAX);
    }
}
