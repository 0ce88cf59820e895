//! Error handling types for resolver-bridge
//!
//! This module provides the error taxonomy shared by every component of the
//! bridge runtime.

use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::protocol::{AuthEpoch, CorrelationId};

/// Application-level failure reported by the resolver subprocess.
///
/// The subprocess answered, but the operation itself failed. `critical`
/// failures abort bulk processing; non-critical ones are per-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    /// Engine-specific error code
    pub code: i64,
    /// Whether the engine considers this failure fatal for the session
    #[serde(default)]
    pub critical: bool,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            critical: false,
            message: message.into(),
            detail: None,
        }
    }

    pub fn critical(code: i64, message: impl Into<String>) -> Self {
        Self {
            critical: true,
            ..Self::new(code, message)
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = if self.critical { "critical" } else { "non-critical" };
        write!(f, "{} engine error {}: {}", severity, self.code, self.message)
    }
}

/// Taxonomy kind of a bridge failure.
///
/// `HandshakeMismatch` and `ProtocolAnomaly` never reach callers; they only
/// appear in log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportFailure,
    HandshakeMismatch,
    ProtocolAnomaly,
    SubprocessDeath,
    CancelledOnRestart,
    EngineLogicFailure,
    StorageBusy,
    Closed,
    Config,
}

/// Comprehensive error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket I/O kept failing after the retry ceiling was reached
    #[error("transport failure after {attempts} attempts: {source}")]
    TransportFailure {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess died and no restart credit is left
    #[error("resolver subprocess died ({restarts} restarts used of budget {budget})")]
    SubprocessDeath { restarts: u32, budget: u32 },

    /// An epoch-bound request outlived the subprocess incarnation it targeted
    #[error("request {id} cancelled on restart: captured epoch {captured}, live epoch {live:?}")]
    CancelledOnRestart {
        id: CorrelationId,
        captured: AuthEpoch,
        live: Option<AuthEpoch>,
    },

    /// The subprocess answered with an application-level failure
    #[error("{0}")]
    EngineLogic(EngineError),

    /// Durable redo storage stayed busy past the retry budget
    #[error("redo storage busy after {attempts} attempts: {message}")]
    StorageBusy { attempts: u32, message: String },

    /// The connector or session has been shut down
    #[error("bridge closed")]
    Closed,

    /// The priority dispatcher no longer accepts submissions
    #[error("dispatcher completed; request {id} rejected")]
    DispatcherClosed { id: CorrelationId },

    /// A frame could not be decoded
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Configuration error
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// IO error outside the retried transport path (binding, spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::TransportFailure { .. } | BridgeError::Io(_) => {
                ErrorKind::TransportFailure
            }
            BridgeError::Protocol { .. } => ErrorKind::ProtocolAnomaly,
            BridgeError::SubprocessDeath { .. } => ErrorKind::SubprocessDeath,
            BridgeError::CancelledOnRestart { .. } => ErrorKind::CancelledOnRestart,
            BridgeError::EngineLogic(_) => ErrorKind::EngineLogicFailure,
            BridgeError::StorageBusy { .. } => ErrorKind::StorageBusy,
            BridgeError::Closed | BridgeError::DispatcherClosed { .. } => ErrorKind::Closed,
            BridgeError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Engine error code, when the subprocess produced this failure.
    pub fn engine_code(&self) -> Option<i64> {
        match self {
            BridgeError::EngineLogic(e) => Some(e.code),
            _ => None,
        }
    }

    /// Whether this failure must stop the caller's session-level work.
    ///
    /// Non-critical engine failures are per-record and never fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::EngineLogic(e) => e.critical,
            BridgeError::CancelledOnRestart { .. } => false,
            _ => true,
        }
    }
}

/// Helper trait to recover guards from poisoned `std::sync` locks.
pub trait LockResultExt<T> {
    /// Return the guard, recovering it from a poisoned lock with logging.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "resolver_bridge::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
