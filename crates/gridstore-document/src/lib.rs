//! Document database dialect for gridstore.
//!
//! [`DocumentDialect`] maps entities to documents and association rows to
//! embedded arrays or association documents. It talks to the database
//! through the [`DocumentClient`] trait; [`InMemoryDocumentStore`] is the
//! in-process implementation used by tests and embedded deployments.
//!
//! # Modules
//!
//! - [`client`]: DocumentClient trait and its call options
//! - [`memory`]: InMemoryDocumentStore
//! - [`filter`]: filter matching, projection and update operators
//! - [`mapping`]: tuple and association to document conversion
//! - [`query`]: DocumentQuery native queries
//! - [`dialect`]: DocumentDialect and its capability impls
//! - `batch`: execute_batch with insert coalescing

mod batch;
pub mod client;
pub mod dialect;
pub mod filter;
pub mod mapping;
pub mod memory;
pub mod query;

// Re-export key types for ergonomic use.
pub use client::{DocumentClient, FindAndModify, FindOptions, UpdateOutcome};
pub use dialect::DocumentDialect;
pub use memory::{CallStats, InMemoryDocumentStore};
pub use query::{DocumentQuery, QueryOperation, WriteOptions};
