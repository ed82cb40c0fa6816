//! Key-value store dialect for gridstore.
//!
//! For stores that can only get and put whole values. Entities and
//! associations are serialized to JSON text, a per-table key index makes
//! bulk scans possible, and counters use optimistic compare-and-set. See
//! [`dialect`] for the consistency this gives callers.
//!
//! # Modules
//!
//! - [`client`]: KeyValueClient trait, the seam to the store
//! - [`layout`]: store key naming
//! - [`memory`]: InMemoryKeyValueStore implementation
//! - [`schema`]: SQL schema and migration setup
//! - [`sqlite`]: SqliteKeyValueStore implementation
//! - [`dialect`]: KeyValueDialect and its capability impls

pub mod client;
pub mod dialect;
pub mod layout;
pub mod memory;
pub mod schema;
pub mod sqlite;

// Re-export key types for ergonomic use.
pub use client::{KeyValueClient, Version, Versioned};
pub use dialect::KeyValueDialect;
pub use memory::{InMemoryKeyValueStore, KvCallStats};
pub use sqlite::SqliteKeyValueStore;
