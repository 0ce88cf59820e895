//! Controller side of the resolver bridge.
//!
//! ## Module Structure
//!
//! - `protocol` - envelopes, ids, epochs and framing
//! - `connector` - the single socket, handshake, retry and reconnect
//! - `switchboard` - routes each response to the handler that owns it
//! - `handler` - synchronous-call and bulk-load response handlers
//! - `prioritizer` - rank-ordered dispatch with bounded concurrency
//! - `ledger` - outstanding-request bookkeeping and backpressure
//! - `loader` - streaming record loader with redo reconciliation
//! - `cleanup` - background deletion of acknowledged redo items
//! - `restart` - restart decisions on subprocess death
//! - `subprocess` - resolver process supervision
//! - `session` - per-subprocess component bundle and registry

pub mod cleanup;
pub mod connector;
pub mod handler;
pub mod ledger;
pub mod loader;
pub mod prioritizer;
pub mod protocol;
pub mod restart;
pub mod session;
pub mod subprocess;
pub mod switchboard;

pub use cleanup::{CleanupReport, RedoGate, RedoItem, RedoStore, RedoTracker, StoreError};
pub use connector::{Connector, ConnectorStats, ShutdownHelper};
pub use handler::{BulkLoadHandler, SyncCallHandler, SyncExchange};
pub use ledger::{Backpressure, PendingLedger};
pub use loader::{BulkLoader, LoadRecord, LoadReport};
pub use prioritizer::{CallerId, Exchange, OwnerToken, SendPrioritizer};
pub use protocol::{
    AuthEpoch, CorrelationId, CorrelationIdGenerator, Operation, PriorityClass, RequestEnvelope,
    ResponseEnvelope,
};
pub use restart::{Recovery, RestartCoordinator};
pub use session::{Session, SessionId, SessionRegistry};
pub use subprocess::{ProcessSupervisor, SubprocessSupervisor};
pub use switchboard::{ResponseHandler, Switchboard, SwitchboardStats};
