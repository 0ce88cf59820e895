//! Request and response envelopes.
//!
//! Envelopes are created per call and discarded after delivery. Only the
//! fields relevant to correlation, priority and timing are interpreted by the
//! bridge; payload, parameters and results are opaque.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::{AuthEpoch, CorrelationId, Operation, PriorityClass};
use crate::error::{BridgeError, BridgeResult, EngineError};

/// Diagnostic timing marks of a request (never sent on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTiming {
    pub enqueued_at: Option<Instant>,
    pub transmitted_at: Option<Instant>,
}

/// Request sent to the resolver subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: CorrelationId,
    #[serde(rename = "op")]
    pub operation: Operation,
    pub class: PriorityClass,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Sequencing hint for collaborators; the bridge never reads it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<i64>,
    /// Set only for requests that must be voided across a restart
    #[serde(skip)]
    pub auth_epoch: Option<AuthEpoch>,
    #[serde(skip)]
    pub timing: RequestTiming,
}

impl RequestEnvelope {
    /// Create a request with the operation's default priority class.
    pub fn new(id: CorrelationId, operation: Operation) -> Self {
        Self {
            id,
            operation,
            class: operation.traits().default_class,
            payload: String::new(),
            params: BTreeMap::new(),
            affinity: None,
            auth_epoch: None,
            timing: RequestTiming::default(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_class(mut self, class: PriorityClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_affinity(mut self, affinity: i64) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Bind this request to a subprocess incarnation.
    ///
    /// The request fails with `CancelledOnRestart` instead of being retried
    /// once `epoch` is no longer live.
    pub fn bound_to(mut self, epoch: AuthEpoch) -> Self {
        self.auth_epoch = Some(epoch);
        self
    }

    pub fn mark_enqueued(&mut self) {
        self.timing.enqueued_at = Some(Instant::now());
    }

    pub fn mark_transmitted(&mut self) {
        self.timing.transmitted_at = Some(Instant::now());
    }
}

/// Timing marks reported by the resolver, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTiming {
    #[serde(default)]
    pub engine_us: u64,
    #[serde(default)]
    pub queue_us: u64,
    #[serde(default)]
    pub transmit_us: u64,
}

/// Response received from the resolver subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ResponseTiming>,
}

impl ResponseEnvelope {
    pub fn success(id: CorrelationId, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result,
            error: None,
            timing: None,
        }
    }

    pub fn failure(id: CorrelationId, error: EngineError) -> Self {
        Self {
            id,
            success: false,
            result: serde_json::Value::Null,
            error: Some(error),
            timing: None,
        }
    }

    /// Whether this is a failure the engine flagged as critical.
    pub fn is_critical_failure(&self) -> bool {
        !self.success && self.error.as_ref().is_some_and(|e| e.critical)
    }

    /// Convert into the synchronous-call outcome.
    ///
    /// A failed response without error detail is reported as a
    /// non-critical engine error with code 0.
    pub fn into_result(self) -> BridgeResult<serde_json::Value> {
        if self.success {
            Ok(self.result)
        } else {
            Err(BridgeError::EngineLogic(self.error.unwrap_or_else(|| {
                EngineError::new(0, "resolver reported failure without detail")
            })))
        }
    }
}
