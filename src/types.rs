//! Shared primitive IDs, identities, and coordinate bounds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic entry identifier, starting at 1.
pub type EntryId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
/// Fixed-point degrees scaled by 1,000,000.
pub type MicroDegrees = i32;

/// Smallest valid latitude.
pub const MIN_LATITUDE: MicroDegrees = -90_000_000;
/// Largest valid latitude.
pub const MAX_LATITUDE: MicroDegrees = 90_000_000;
/// Smallest valid longitude.
pub const MIN_LONGITUDE: MicroDegrees = -180_000_000;
/// Largest valid longitude.
pub const MAX_LONGITUDE: MicroDegrees = 180_000_000;

/// Authenticated account principal supplied by the execution substrate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wraps a principal string.
    pub fn new(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }

    /// Returns the principal text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}
