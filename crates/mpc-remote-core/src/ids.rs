//! Identifier types for mpc-remote.
//!
//! A [`PolicyVersion`] tags every control policy the planner commits. Versions
//! are handed out by a [`VersionCounter`] and only ever increase, so readers
//! can tell which publication an action came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing tag marking one committed policy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyVersion(u64);

impl PolicyVersion {
    /// Create a version from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyVersion({})", self.0)
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Hands out strictly increasing [`PolicyVersion`]s.
///
/// One counter is shared by every session of an agent so that versions keep
/// growing across `Init` and `Reset`.
#[derive(Debug, Default)]
pub struct VersionCounter {
    next: AtomicU64,
}

impl VersionCounter {
    /// Create a counter whose first version is `v1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next version.
    pub fn next_version(&self) -> PolicyVersion {
        PolicyVersion(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The most recently allocated version, or `v0` if none was allocated.
    #[must_use]
    pub fn current(&self) -> PolicyVersion {
        PolicyVersion(self.next.load(Ordering::Relaxed))
    }
}
