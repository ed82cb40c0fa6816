//! The seam between the key-value dialect and a key-value store.
//!
//! The store only knows whole values. Every entry carries a version that
//! changes on each write, which is all the dialect needs to run optimistic
//! read-modify-write loops on top of it.

use std::time::Duration;

use gridstore_core::GridError;

/// Version stamp of a stored value. Never reused by a store instance.
pub type Version = u64;

/// A stored value with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: Version,
}

/// Operations the dialect needs from a key-value store.
///
/// Entries whose time-to-live has elapsed behave exactly like absent ones.
pub trait KeyValueClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>, GridError>;

    /// Unconditionally stores `value`, returning its new version.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Version, GridError>;

    /// Stores `value` only if the live entry is still at `expected`
    /// (`None`: only if there is no live entry). Returns whether the write
    /// happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, GridError>;

    /// Returns whether a live entry was deleted.
    fn delete(&self, key: &str) -> Result<bool, GridError>;
}
