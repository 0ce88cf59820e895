//! Correlation id type for resolver request/response pairing.
//!
//! This module provides a type-safe wrapper for correlation ids, preventing
//! confusion with other integer types, and the process-local generator that
//! is the only legitimate source of new ids.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Correlation id linking a request to its eventual response.
///
/// Ids are process-local and monotonically increasing. They are never reused,
/// including across subprocess incarnations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Create a new CorrelationId from a raw value.
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<CorrelationId> for u64 {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of fresh correlation ids.
///
/// Owns a dedicated counter that no other lock guards, so id generation never
/// serializes behind unrelated I/O. Every id handed out is strictly less than
/// [`CorrelationIdGenerator::peek_next`].
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    /// Create a generator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Issue the next correlation id.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The id that will be issued next (not reserved).
    pub fn peek_next(&self) -> CorrelationId {
        CorrelationId(self.next.load(Ordering::SeqCst))
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
