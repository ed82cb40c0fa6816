//! Ordered buffer of pending writes for one flush.

use std::collections::{HashMap, VecDeque};

use crate::association::Association;
use crate::context::{AssociationTypeContext, TupleTypeContext};
use crate::error::GridError;
use crate::keys::{AssociationKey, EntityKey};
use crate::tuple::{SnapshotKind, Tuple};

/// A queued write. Each operation owns a copy of the state it writes.
#[derive(Debug, Clone)]
pub enum Operation {
    InsertOrUpdateTuple {
        key: EntityKey,
        tuple: Tuple,
        context: TupleTypeContext,
    },
    RemoveTuple {
        key: EntityKey,
        context: TupleTypeContext,
    },
    InsertOrUpdateAssociation {
        key: AssociationKey,
        association: Association,
        context: AssociationTypeContext,
    },
    RemoveAssociation {
        key: AssociationKey,
        context: AssociationTypeContext,
    },
}

impl Operation {
    pub fn insert_or_update_tuple(key: EntityKey, tuple: Tuple, context: TupleTypeContext) -> Self {
        Operation::InsertOrUpdateTuple { key, tuple, context }
    }

    pub fn remove_tuple(key: EntityKey, context: TupleTypeContext) -> Self {
        Operation::RemoveTuple { key, context }
    }

    pub fn insert_or_update_association(
        key: AssociationKey,
        association: Association,
        context: AssociationTypeContext,
    ) -> Self {
        Operation::InsertOrUpdateAssociation {
            key,
            association,
            context,
        }
    }

    pub fn remove_association(key: AssociationKey, context: AssociationTypeContext) -> Self {
        Operation::RemoveAssociation { key, context }
    }

    fn tuple_write_key(&self) -> Option<&EntityKey> {
        match self {
            Operation::InsertOrUpdateTuple { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// FIFO queue of [`Operation`]s scoped to one unit of work.
///
/// Not thread-safe; each unit of work owns its queue. Once closed, the
/// queue rejects new operations and `execute_batch` treats it as a no-op.
#[derive(Debug, Default)]
pub struct OperationsQueue {
    operations: VecDeque<Operation>,
    /// Number of queued tuple writes per entity key.
    pending_tuple_writes: HashMap<EntityKey, usize>,
    closed: bool,
}

impl OperationsQueue {
    pub fn new() -> Self {
        OperationsQueue::default()
    }

    pub fn add(&mut self, operation: Operation) -> Result<(), GridError> {
        if self.closed {
            return Err(GridError::QueueClosed);
        }
        if let Some(key) = operation.tuple_write_key() {
            *self.pending_tuple_writes.entry(key.clone()).or_insert(0) += 1;
        }
        self.operations.push_back(operation);
        Ok(())
    }

    /// Removes and returns the oldest operation.
    pub fn poll(&mut self) -> Option<Operation> {
        let operation = self.operations.pop_front()?;
        if let Some(key) = operation.tuple_write_key() {
            if let Some(count) = self.pending_tuple_writes.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.pending_tuple_writes.remove(key);
                }
            }
        }
        Some(operation)
    }

    /// Whether a tuple write for `key` is still waiting in the queue.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.pending_tuple_writes.contains_key(key)
    }

    /// Whether a queued tuple write for `key` inserts an entity that is not
    /// in the store yet.
    pub fn contains_insert(&self, key: &EntityKey) -> bool {
        self.contains(key)
            && self.operations.iter().any(|operation| {
                matches!(operation, Operation::InsertOrUpdateTuple { key: queued, tuple, .. }
                    if queued == key && tuple.kind() == SnapshotKind::Insert)
            })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the queue, dropping anything not yet polled.
    pub fn close(&mut self) {
        self.closed = true;
        self.operations.clear();
        self.pending_tuple_writes.clear();
    }
}
