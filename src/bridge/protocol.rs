//! Wire protocol types for resolver communication.
//!
//! ## Module Structure
//!
//! - `correlation_id` - CorrelationId type and its generator
//! - `epoch` - AuthEpoch, the identity of one subprocess incarnation
//! - `operation` - closed operation table and priority classes
//! - `envelope` - request/response envelopes
//! - `framing` - handshake and Content-Length message framing

mod correlation_id;
mod envelope;
mod epoch;
mod framing;
mod operation;

pub use correlation_id::{CorrelationId, CorrelationIdGenerator};
pub use envelope::{RequestEnvelope, RequestTiming, ResponseEnvelope, ResponseTiming};
pub use epoch::AuthEpoch;
pub use framing::{
    AUTH_FRAME_LEN, FrameReader, FrameWriter, read_auth_frame, write_auth_frame,
};
pub use operation::{Operation, OperationTraits, PriorityClass};
