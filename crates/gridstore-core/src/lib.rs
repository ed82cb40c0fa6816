//! Core data model of the gridstore dialect layer.
//!
//! Dialects persist entities and associations produced by an object
//! mapper against non-relational stores. This crate holds everything the
//! dialects share; the stores themselves live in `gridstore-document`,
//! `gridstore-graph` and `gridstore-kv`.
//!
//! # Modules
//!
//! - [`keys`]: entity, association, row and id-source keys
//! - [`value`]: column values and dotted-path document helpers
//! - [`tuple`]: entity snapshots and their operation logs
//! - [`association`]: association rows and their operation logs
//! - [`options`]: per-entity and per-association options
//! - [`config`]: global defaults, from JSON or the environment
//! - [`strategy`]: association storage strategy selection
//! - [`queue`]: the operations queue flushed by `execute_batch`
//! - [`context`]: per-call contexts
//! - [`dialect`]: capability traits and query cursors
//! - [`error`]: GridError and its taxonomy

pub mod association;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod keys;
pub mod options;
pub mod queue;
pub mod strategy;
pub mod tuple;
pub mod value;

// Re-export key types for ergonomic use.
pub use association::{apply_association_operations, Association, AssociationOperation, Row};
pub use config::GridConfig;
pub use context::{AssociationContext, AssociationTypeContext, TupleContext, TupleTypeContext};
pub use dialect::{
    AssociationStore, BatchExecutor, BulkScanner, Capabilities, Cursor, GridDialect, IdentityColumnStore,
    ModelConsumer, NativeQueryExecutor, OptimisticLockingStore, SequenceGenerator, TupleCursor, TupleStore,
};
pub use error::{ErrorCategory, GridError};
pub use keys::{
    AssociatedEntityKeyMetadata, AssociationKey, AssociationKeyMetadata, AssociationKind, AssociationType,
    EntityKey, EntityKeyMetadata, IdSourceKey, IdSourceKeyMetadata, IdSourceType, NextValueRequest, RowKey,
};
pub use options::{
    AssociationDocumentStorageType, AssociationOptions, AssociationStorageType, EntityOptions, MapStorageType,
};
pub use queue::{Operation, OperationsQueue};
pub use strategy::AssociationStorageStrategy;
pub use tuple::{apply_tuple_operations, SnapshotKind, Tuple, TupleOperation, TupleOperationKind, TupleSnapshot};
pub use value::{Document, Value};
