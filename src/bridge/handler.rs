//! Response handlers registered with the switchboard.
//!
//! - `sync_call` - one-at-a-time callers waiting on a oneshot per request
//! - `bulk_load` - streaming producer backed by the pending ledger

mod bulk_load;
mod sync_call;

pub use bulk_load::{BulkLoadHandler, Delivery};
pub use sync_call::{SyncCallHandler, SyncExchange};
