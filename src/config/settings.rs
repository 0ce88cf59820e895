use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Largest executor pool the priority dispatcher accepts.
pub const MAX_DISPATCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Attempts per read/write before consulting subprocess liveness
    pub retry_ceiling: u32,
    /// How long one attempt waits for a replacement connection
    pub reconnect_wait_ms: u64,
    /// How long an accepted socket may take to send its handshake frame
    pub handshake_timeout_ms: u64,
    /// How long a fresh session waits for the first handshake
    pub startup_timeout_ms: u64,
    /// Frames between writer buffer resets
    pub stream_reset_interval: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retry_ceiling: 30,
            reconnect_wait_ms: 5_000,
            handshake_timeout_ms: 5_000,
            startup_timeout_ms: 30_000,
            stream_reset_interval: 1_000,
        }
    }
}

impl TransportSettings {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartSettings {
    /// Automatic restarts allowed between two successful exchanges
    pub budget: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Executor pool size; 1 means inline execution
    pub concurrency: usize,
    /// Switchboard idle wait when no handler has outstanding ids
    pub idle_poll_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            idle_poll_ms: 100,
        }
    }
}

impl DispatchSettings {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub block_threshold: usize,
    pub unblock_threshold: usize,
    /// Re-check period while a producer is blocked
    pub poll_ms: u64,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            block_threshold: 10_000,
            unblock_threshold: 6_666,
            poll_ms: 250,
        }
    }
}

impl BackpressureSettings {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RedoSettings {
    pub enabled: bool,
    /// Items pulled per reconciliation round
    pub batch_size: usize,
    /// Non-shrinking rounds tolerated before the pass gives up on redo
    pub divergence_threshold: u32,
    /// Records loaded before the first mid-stream redo check (doubles after each)
    pub first_check_after: u64,
}

impl Default for RedoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            divergence_threshold: 3,
            first_check_after: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 50,
        }
    }
}

impl CleanupSettings {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

/// Command used to launch the resolver subprocess.
///
/// `{port}` and `{auth}` in `args` are replaced with the listening port and
/// the decimal authentication value of the incarnation being spawned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SubprocessSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub transport: TransportSettings,
    pub restart: RestartSettings,
    pub dispatch: DispatchSettings,
    pub backpressure: BackpressureSettings,
    pub redo: RedoSettings,
    pub cleanup: CleanupSettings,
    pub subprocess: SubprocessSettings,
}

impl BridgeSettings {
    /// Normalise and check the settings.
    ///
    /// Misconfigured hysteresis (`unblock >= block`) is repaired by deriving
    /// `unblock = block * 2 / 3`; other invalid values are errors.
    pub fn validate(mut self) -> BridgeResult<Self> {
        if self.transport.retry_ceiling == 0 {
            return Err(BridgeError::config("transport.retry_ceiling must be at least 1"));
        }
        if self.backpressure.block_threshold == 0 {
            return Err(BridgeError::config(
                "backpressure.block_threshold must be at least 1",
            ));
        }
        if self.backpressure.unblock_threshold >= self.backpressure.block_threshold {
            let derived = self.backpressure.block_threshold * 2 / 3;
            log::warn!(
                target: "resolver_bridge::config",
                "unblock_threshold {} is not below block_threshold {}; using {}",
                self.backpressure.unblock_threshold,
                self.backpressure.block_threshold,
                derived
            );
            self.backpressure.unblock_threshold = derived;
        }
        let clamped = self.dispatch.concurrency.clamp(1, MAX_DISPATCH_CONCURRENCY);
        if clamped != self.dispatch.concurrency {
            log::warn!(
                target: "resolver_bridge::config",
                "dispatch.concurrency {} out of range; using {}",
                self.dispatch.concurrency,
                clamped
            );
            self.dispatch.concurrency = clamped;
        }
        if self.redo.batch_size == 0 {
            return Err(BridgeError::config("redo.batch_size must be at least 1"));
        }
        Ok(self)
    }
}
