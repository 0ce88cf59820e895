pub mod bridge;
pub mod config;
pub mod error;
pub mod peer;

pub use bridge::{
    BulkLoader, CallerId, Connector, LoadRecord, LoadReport, Operation, ProcessSupervisor,
    RequestEnvelope, ResponseEnvelope, Session, SessionRegistry, SubprocessSupervisor,
};
pub use config::BridgeSettings;
pub use error::{BridgeError, BridgeResult, EngineError, ErrorKind};
