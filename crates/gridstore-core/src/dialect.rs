//! Capability traits implemented by the backend dialects.
//!
//! A dialect implements only the capabilities its store can provide and
//! advertises them through [`GridDialect::capabilities`]. Backend clients are
//! handed to the dialect at construction; no trait method reaches for shared
//! global state.

use std::fmt;
use std::sync::Arc;

use crate::association::Association;
use crate::context::{AssociationContext, AssociationTypeContext, TupleContext};
use crate::error::GridError;
use crate::keys::{AssociationKey, AssociationKeyMetadata, EntityKey, EntityKeyMetadata, NextValueRequest};
use crate::queue::OperationsQueue;
use crate::tuple::Tuple;
use crate::value::Value;

/// Entity reads and writes.
pub trait TupleStore: Send + Sync {
    /// Loads the entity stored under `key`.
    ///
    /// An entity still waiting in the context's queue yields an `Insert`
    /// tuple seeded with its key columns.
    fn get_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Result<Option<Tuple>, GridError>;

    /// Loads several entities of the same type. The result follows the
    /// order of `keys`.
    fn get_tuples(&self, keys: &[EntityKey], context: &TupleContext<'_>) -> Result<Vec<Option<Tuple>>, GridError> {
        keys.iter().map(|key| self.get_tuple(key, context)).collect()
    }

    /// Returns an empty `Insert` tuple seeded with the key columns. No I/O.
    fn create_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Tuple;

    /// Writes the pending operations of `tuple` and commits them on success.
    fn insert_or_update_tuple(
        &self,
        key: &EntityKey,
        tuple: &mut Tuple,
        context: &TupleContext<'_>,
    ) -> Result<(), GridError>;

    /// Deletes the entity. Removing an absent entity is not an error.
    fn remove_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Result<(), GridError>;
}

/// Entity writes guarded by the values a caller read earlier.
///
/// `old_lock_state` holds the version columns as they were loaded. A write
/// happens only while the stored entity still carries every one of them.
pub trait OptimisticLockingStore: Send + Sync {
    /// Applies the pending operations of `tuple` and commits them. Returns
    /// `false`, leaving `tuple` untouched, when the entity is gone or one of
    /// its version columns changed.
    fn update_tuple_with_optimistic_lock(
        &self,
        key: &EntityKey,
        old_lock_state: &Tuple,
        tuple: &mut Tuple,
        context: &TupleContext<'_>,
    ) -> Result<bool, GridError>;

    /// Deletes the entity under the same condition.
    fn remove_tuple_with_optimistic_lock(
        &self,
        key: &EntityKey,
        old_lock_state: &Tuple,
        context: &TupleContext<'_>,
    ) -> Result<bool, GridError>;
}

/// Inserts of entities whose id the store assigns.
pub trait IdentityColumnStore: Send + Sync {
    /// Inserts `tuple` and puts the generated id into its single key
    /// column, which is also returned.
    fn insert_tuple(
        &self,
        metadata: &EntityKeyMetadata,
        tuple: &mut Tuple,
        context: &TupleContext<'_>,
    ) -> Result<Value, GridError>;
}

/// Association reads and writes.
pub trait AssociationStore: Send + Sync {
    fn get_association(
        &self,
        key: &AssociationKey,
        context: &mut AssociationContext<'_>,
    ) -> Result<Option<Association>, GridError>;

    fn create_association(
        &self,
        key: &AssociationKey,
        context: &mut AssociationContext<'_>,
    ) -> Result<Association, GridError>;

    /// Writes the rows of `association` and commits its pending operations.
    fn insert_or_update_association(
        &self,
        key: &AssociationKey,
        association: &mut Association,
        context: &mut AssociationContext<'_>,
    ) -> Result<(), GridError>;

    fn remove_association(&self, key: &AssociationKey, context: &mut AssociationContext<'_>) -> Result<(), GridError>;

    /// Whether rows of this association type live inside the owner.
    fn is_stored_in_entity_structure(
        &self,
        metadata: &AssociationKeyMetadata,
        context: &AssociationTypeContext,
    ) -> bool;
}

/// Id generation.
pub trait SequenceGenerator: Send + Sync {
    /// Allocates the next value of the id source named by `request`.
    fn next_value(&self, request: &NextValueRequest) -> Result<i64, GridError>;
}

/// Queued write execution.
pub trait BatchExecutor: Send + Sync {
    /// Drains `queue` in arrival order and closes it. A closed queue is
    /// left untouched. On failure the remaining operations are discarded.
    fn execute_batch(&self, queue: &mut OperationsQueue) -> Result<(), GridError>;
}

/// Receives the tuples of a bulk scan.
pub trait ModelConsumer {
    fn consume(&mut self, tuple: Tuple);
}

impl<F> ModelConsumer for F
where
    F: FnMut(Tuple),
{
    fn consume(&mut self, tuple: Tuple) {
        self(tuple)
    }
}

/// Full scans for offline traversal such as reindexing. No ordering.
pub trait BulkScanner: Send + Sync {
    fn for_each_tuple(
        &self,
        consumer: &mut dyn ModelConsumer,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<(), GridError>;
}

/// Execution of queries already expressed in the store's native form.
pub trait NativeQueryExecutor: Send + Sync {
    type Query;

    /// Runs `query` against the single entity type in `metadatas`.
    ///
    /// More than one target yields [`GridError::MultipleTargetsUnsupported`].
    fn execute_backend_query(
        &self,
        query: &Self::Query,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<TupleCursor, GridError>;

    /// Runs a native write and returns the number of affected entries.
    fn execute_backend_update_query(
        &self,
        query: &Self::Query,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<u64, GridError> {
        let _ = (query, metadatas);
        Err(GridError::Unsupported("native update queries".to_string()))
    }
}

/// Shared check for [`NativeQueryExecutor`] implementations.
pub fn single_target(metadatas: &[Arc<EntityKeyMetadata>]) -> Result<Option<&Arc<EntityKeyMetadata>>, GridError> {
    match metadatas {
        [] => Ok(None),
        [single] => Ok(Some(single)),
        many => Err(GridError::MultipleTargetsUnsupported(many.len())),
    }
}

/// Capabilities a dialect advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub tuples: bool,
    pub associations: bool,
    pub sequences: bool,
    pub batching: bool,
    pub bulk_scan: bool,
    pub native_queries: bool,
    pub optimistic_locking: bool,
    pub identity_columns: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Capabilities {
            tuples: true,
            associations: true,
            sequences: true,
            batching: true,
            bulk_scan: true,
            native_queries: true,
            optimistic_locking: true,
            identity_columns: true,
        }
    }
}

/// Entry point for callers that hold a dialect without knowing its type.
pub trait GridDialect: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn tuple_store(&self) -> Option<&dyn TupleStore> {
        None
    }

    fn association_store(&self) -> Option<&dyn AssociationStore> {
        None
    }

    fn sequence_generator(&self) -> Option<&dyn SequenceGenerator> {
        None
    }

    fn batch_executor(&self) -> Option<&dyn BatchExecutor> {
        None
    }

    fn bulk_scanner(&self) -> Option<&dyn BulkScanner> {
        None
    }

    fn optimistic_locking_store(&self) -> Option<&dyn OptimisticLockingStore> {
        None
    }

    fn identity_column_store(&self) -> Option<&dyn IdentityColumnStore> {
        None
    }
}

type BoxedIter<T> = Box<dyn Iterator<Item = Result<T, GridError>> + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// Lazily consumed results of a store read.
///
/// Errors surface from `next()`. The underlying resource is released by
/// [`close`](Cursor::close) or when the cursor is dropped.
pub struct Cursor<T> {
    inner: Option<BoxedIter<T>>,
    on_close: Option<CloseHook>,
}

/// Cursor over query or scan results.
pub type TupleCursor = Cursor<Tuple>;

impl<T: 'static> Cursor<T> {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<T, GridError>> + Send + 'static,
    {
        Cursor {
            inner: Some(Box::new(iter)),
            on_close: None,
        }
    }

    pub fn from_items(items: Vec<T>) -> Self
    where
        T: Send,
    {
        Cursor::new(items.into_iter().map(Ok))
    }

    pub fn empty() -> Self
    where
        T: Send,
    {
        Cursor::from_items(Vec::new())
    }

    /// Runs `hook` exactly once when the cursor is closed or dropped.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Converts every item, keeping the close hook.
    pub fn map_items<U, F>(mut self, mut f: F) -> Cursor<U>
    where
        U: 'static,
        F: FnMut(T) -> Result<U, GridError> + Send + 'static,
    {
        let inner = self.inner.take();
        let on_close = self.on_close.take();
        Cursor {
            inner: inner.map(|iter| Box::new(iter.map(move |item| item.and_then(&mut f))) as BoxedIter<U>),
            on_close,
        }
    }
}

impl<T> Cursor<T> {
    pub fn close(&mut self) {
        self.inner = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = Result<T, GridError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next()
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("closed", &self.is_closed())
            .finish()
    }
}
