//! Authentication epoch for subprocess incarnations.

use ulid::Ulid;

/// Identity of one resolver subprocess incarnation.
///
/// Minted when a subprocess is spawned and passed to it out of band; the
/// subprocess must echo it as its first frame. The same value is the
/// authentication token of the handshake and the epoch that epoch-bound
/// requests capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthEpoch(u64);

impl AuthEpoch {
    /// Mint a fresh random epoch.
    ///
    /// Uses the random component of a ULID. Zero is never produced.
    pub fn generate() -> Self {
        loop {
            let raw = Ulid::new().random() as u64;
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Wrap a raw value received from the wire or a command line.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AuthEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
