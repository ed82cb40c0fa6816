//! Graph database dialect for gridstore.
//!
//! Entities are labeled nodes, embedded values hang off them as `EMBEDDED`
//! nodes, and associations are relationships typed by their collection
//! role. [`GraphDatabase`] is the in-process property graph the dialect
//! runs against.
//!
//! # Modules
//!
//! - [`engine`]: Graph, GraphDatabase and their transactions
//! - [`mapping`]: tuple and association to node conversion
//! - [`query`]: GraphQuery native queries
//! - [`dialect`]: GraphDialect and its capability impls

pub mod dialect;
pub mod engine;
pub mod mapping;
pub mod query;

// Re-export key types for ergonomic use.
pub use dialect::GraphDialect;
pub use engine::{Graph, GraphDatabase, Node, NodeId, RelId, Relationship, TransactionStats, EMBEDDED, ENTITY, SEQUENCE};
pub use query::GraphQuery;
