//! [`GraphDialect`]: the dialect for the property graph engine.
//!
//! Every call runs in one engine transaction, and `execute_batch` runs the
//! whole queue in a single one, so a failed batch leaves nothing behind.

use std::sync::Arc;

use gridstore_core::dialect::single_target;
use gridstore_core::{
    Association, AssociationContext, AssociationKey, AssociationKeyMetadata, AssociationStore, AssociationTypeContext,
    BatchExecutor, BulkScanner, Capabilities, Document, EntityKey, EntityKeyMetadata, GridConfig, GridDialect,
    GridError, IdSourceKey, IdSourceType, ModelConsumer, NativeQueryExecutor, NextValueRequest, Operation,
    OperationsQueue, SequenceGenerator, SnapshotKind, Tuple, TupleContext, TupleCursor, TupleSnapshot, TupleStore,
    Value,
};

use crate::engine::{labels, Graph, GraphDatabase, NodeId, ENTITY, SEQUENCE};
use crate::mapping::{
    apply_association, apply_tuple, create_entity, delete_entity, find_entity, merge_entity, project_tuple,
    read_association, remove_association_rows, tuple_from_node, write_insert,
};
use crate::query::GraphQuery;

/// Dialect over a shared [`GraphDatabase`].
#[derive(Debug)]
pub struct GraphDialect {
    db: Arc<GraphDatabase>,
    config: GridConfig,
}

impl GraphDialect {
    pub fn new(db: Arc<GraphDatabase>, config: GridConfig) -> Self {
        GraphDialect { db, config }
    }

    pub fn database(&self) -> &Arc<GraphDatabase> {
        &self.db
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }
}

fn key_only_tuple(key: &EntityKey) -> Tuple {
    let columns = key
        .columns()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    Tuple::new(TupleSnapshot::new(columns, SnapshotKind::Insert))
}

// ---------------------------------------------------------------------------
// Transaction bodies, shared by the single-call paths and execute_batch
// ---------------------------------------------------------------------------

fn write_tuple(graph: &mut Graph, key: &EntityKey, tuple: &Tuple) -> Result<(), GridError> {
    match tuple.kind() {
        SnapshotKind::Insert => {
            let node = create_entity(graph, key)?;
            write_insert(graph, node, key, tuple)
        }
        SnapshotKind::Update => {
            let node = merge_entity(graph, key)?;
            apply_tuple(graph, node, key, tuple)
        }
    }
}

fn delete_tuple(graph: &mut Graph, key: &EntityKey) -> Result<(), GridError> {
    if let Some(node) = find_entity(graph, key) {
        delete_entity(graph, node);
    }
    Ok(())
}

fn owner_node(graph: &Graph, key: &AssociationKey) -> Result<NodeId, GridError> {
    find_entity(graph, key.owner())
        .ok_or_else(|| GridError::InvalidOperation(format!("owner of {key} does not exist")))
}

fn write_association(graph: &mut Graph, key: &AssociationKey, association: &Association) -> Result<(), GridError> {
    let owner = owner_node(graph, key)?;
    apply_association(graph, owner, key, association)
}

fn delete_association(graph: &mut Graph, key: &AssociationKey) -> Result<(), GridError> {
    match find_entity(graph, key.owner()) {
        Some(owner) => remove_association_rows(graph, owner, key),
        None => Ok(()),
    }
}

impl TupleStore for GraphDialect {
    fn get_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Result<Option<Tuple>, GridError> {
        tracing::debug!(label = key.table(), %key, "match entity");
        let found = self.db.read(|graph| find_entity(graph, key).and_then(|node| tuple_from_node(graph, node)));
        Ok(match found {
            Some(tuple) => Some(project_tuple(tuple, key.metadata(), context.selectable_columns())),
            None if context.operations_queue.is_some_and(|q| q.contains(key)) => Some(key_only_tuple(key)),
            None => None,
        })
    }

    fn get_tuples(&self, keys: &[EntityKey], context: &TupleContext<'_>) -> Result<Vec<Option<Tuple>>, GridError> {
        tracing::debug!(count = keys.len(), "match entities");
        let found: Vec<Option<Tuple>> = self.db.read(|graph| {
            keys.iter()
                .map(|key| find_entity(graph, key).and_then(|node| tuple_from_node(graph, node)))
                .collect()
        });
        Ok(keys
            .iter()
            .zip(found)
            .map(|(key, tuple)| match tuple {
                Some(tuple) => Some(project_tuple(tuple, key.metadata(), context.selectable_columns())),
                None if context.operations_queue.is_some_and(|q| q.contains(key)) => Some(key_only_tuple(key)),
                None => None,
            })
            .collect())
    }

    fn create_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Tuple {
        key_only_tuple(key)
    }

    fn insert_or_update_tuple(
        &self,
        key: &EntityKey,
        tuple: &mut Tuple,
        _context: &TupleContext<'_>,
    ) -> Result<(), GridError> {
        tracing::debug!(label = key.table(), %key, kind = ?tuple.kind(), "write entity");
        self.db.write(|graph| write_tuple(graph, key, tuple))?;
        tuple.commit();
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Result<(), GridError> {
        tracing::debug!(label = key.table(), %key, "detach delete entity");
        self.db.write(|graph| delete_tuple(graph, key))
    }
}

impl AssociationStore for GraphDialect {
    fn get_association(
        &self,
        key: &AssociationKey,
        context: &mut AssociationContext<'_>,
    ) -> Result<Option<Association>, GridError> {
        if let Some(queue) = context.operations_queue.as_deref_mut() {
            self.execute_batch(queue)?;
        }
        tracing::debug!(role = key.collection_role(), %key, "match association");
        self.db.read(|graph| match find_entity(graph, key.owner()) {
            Some(owner) => read_association(graph, owner, key).map(Some),
            None => Ok(None),
        })
    }

    fn create_association(
        &self,
        _key: &AssociationKey,
        _context: &mut AssociationContext<'_>,
    ) -> Result<Association, GridError> {
        Ok(Association::empty())
    }

    fn insert_or_update_association(
        &self,
        key: &AssociationKey,
        association: &mut Association,
        _context: &mut AssociationContext<'_>,
    ) -> Result<(), GridError> {
        tracing::debug!(role = key.collection_role(), %key, operations = association.operations().len(), "write association");
        self.db.write(|graph| write_association(graph, key, association))?;
        association.commit();
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey, _context: &mut AssociationContext<'_>) -> Result<(), GridError> {
        tracing::debug!(role = key.collection_role(), %key, "delete association");
        self.db.write(|graph| delete_association(graph, key))
    }

    /// Rows are relationships or element nodes, never owner properties.
    fn is_stored_in_entity_structure(&self, _metadata: &AssociationKeyMetadata, _context: &AssociationTypeContext) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

fn sequence_labels(key: &IdSourceKey) -> Vec<&str> {
    match key.metadata().kind() {
        IdSourceType::Sequence => vec![SEQUENCE],
        IdSourceType::Table => vec![SEQUENCE, key.table()],
    }
}

/// Label carrying the unique constraint of a generator's name property.
fn sequence_constraint_label(key: &IdSourceKey) -> &str {
    match key.metadata().kind() {
        IdSourceType::Sequence => SEQUENCE,
        IdSourceType::Table => key.table(),
    }
}

fn sequence_filter(key: &IdSourceKey) -> Document {
    let mut filter = Document::new();
    filter.insert(
        key.metadata().key_column_name().to_string(),
        Value::String(key.segment().to_string()),
    );
    filter
}

fn find_sequence(graph: &Graph, key: &IdSourceKey) -> Option<NodeId> {
    graph.find_node(sequence_constraint_label(key), &sequence_filter(key))
}

enum Attempt {
    Done(i64),
    Missing,
}

fn exhausted(key: &IdSourceKey) -> GridError {
    GridError::SequenceExhausted {
        sequence: key.to_string(),
    }
}

impl GraphDialect {
    /// Increments an existing counter node; the engine transaction makes
    /// the read and the write atomic.
    fn increment_sequence(&self, request: &NextValueRequest) -> Result<Attempt, GridError> {
        let key = &request.key;
        let field = key.metadata().value_column_name();
        self.db.write(|graph| {
            let Some(node) = find_sequence(graph, key) else {
                return Ok(Attempt::Missing);
            };
            let current = graph
                .node(node)
                .and_then(|n| n.property(field))
                .and_then(Value::as_i64)
                .ok_or_else(|| GridError::NonNumericSequence {
                    sequence: key.to_string(),
                    field: field.to_string(),
                })?;
            let next = current
                .checked_add(request.increment)
                .ok_or_else(|| exhausted(key))?;
            graph.set_property(node, field, Value::from(next))?;
            Ok(Attempt::Done(current))
        })
    }

    /// Creates the counter node holding the value after `initial_value`.
    /// Fails with `TupleAlreadyExists` when another caller created it first.
    fn create_sequence(&self, request: &NextValueRequest) -> Result<i64, GridError> {
        let key = &request.key;
        let metadata = key.metadata();
        self.db.write(|graph| {
            graph.add_unique_constraint(sequence_constraint_label(key), metadata.key_column_name());
            let next = request
                .initial_value
                .checked_add(request.increment)
                .ok_or_else(|| exhausted(key))?;
            let mut properties = sequence_filter(key);
            properties.insert(metadata.value_column_name().to_string(), Value::from(next));
            graph.create_node(labels(sequence_labels(key)), properties)?;
            Ok(request.initial_value)
        })
    }
}

impl SequenceGenerator for GraphDialect {
    /// Lookup and increment share one transaction. A missing counter is
    /// created in a second transaction guarded by the unique constraint
    /// on its name; losing that race retries the increment, up to
    /// `sequence_max_attempts` times.
    fn next_value(&self, request: &NextValueRequest) -> Result<i64, GridError> {
        let key = &request.key;
        let max_attempts = self.config.sequence_max_attempts;
        for attempt in 1..=max_attempts {
            if let Attempt::Done(value) = self.increment_sequence(request)? {
                return Ok(value);
            }
            tracing::debug!(sequence = %key, "creating sequence node");
            match self.create_sequence(request) {
                Ok(value) => return Ok(value),
                Err(GridError::TupleAlreadyExists { .. }) => {
                    tracing::warn!(sequence = %key, attempt, "sequence created concurrently, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(GridError::ConcurrencyRace {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }
}

// ---------------------------------------------------------------------------
// Batches, scans and queries
// ---------------------------------------------------------------------------

fn apply_operation(graph: &mut Graph, operation: &Operation) -> Result<(), GridError> {
    match operation {
        Operation::InsertOrUpdateTuple { key, tuple, .. } => write_tuple(graph, key, tuple),
        Operation::RemoveTuple { key, .. } => delete_tuple(graph, key),
        Operation::InsertOrUpdateAssociation { key, association, .. } => write_association(graph, key, association),
        Operation::RemoveAssociation { key, .. } => delete_association(graph, key),
    }
}

impl BatchExecutor for GraphDialect {
    fn execute_batch(&self, queue: &mut OperationsQueue) -> Result<(), GridError> {
        if queue.is_closed() {
            return Ok(());
        }
        let mut operations = Vec::with_capacity(queue.len());
        while let Some(operation) = queue.poll() {
            operations.push(operation);
        }
        queue.close();
        if operations.is_empty() {
            return Ok(());
        }

        let count = operations.len();
        match self.db.write(|graph| operations.iter().try_for_each(|op| apply_operation(graph, op))) {
            Ok(()) => {
                tracing::info!(operations = count, "executed batch in one transaction");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(operations = count, error = %err, "batch transaction rolled back");
                Err(err)
            }
        }
    }
}

impl BulkScanner for GraphDialect {
    fn for_each_tuple(
        &self,
        consumer: &mut dyn ModelConsumer,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<(), GridError> {
        for metadata in metadatas {
            tracing::debug!(label = metadata.table(), "scanning entities");
            // Collected first so the consumer runs outside the read lock.
            let tuples: Vec<Tuple> = self.db.read(|graph| {
                graph
                    .nodes_with_label(metadata.table())
                    .into_iter()
                    .filter(|id| graph.node(*id).is_some_and(|n| n.has_label(ENTITY)))
                    .filter_map(|id| tuple_from_node(graph, id))
                    .collect()
            });
            for tuple in tuples {
                consumer.consume(tuple);
            }
        }
        Ok(())
    }
}

impl NativeQueryExecutor for GraphDialect {
    type Query = GraphQuery;

    fn execute_backend_query(
        &self,
        query: &GraphQuery,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<TupleCursor, GridError> {
        let label = match (&query.label, single_target(metadatas)?) {
            (Some(label), _) => label.clone(),
            (None, Some(metadata)) => metadata.table().to_string(),
            (None, None) => return Err(GridError::UnknownCollection(format!("{query:?}"))),
        };
        tracing::debug!(label = label.as_str(), "native query");
        let tuples: Vec<Tuple> = self.db.read(|graph| {
            query
                .matching_nodes(graph, &label)
                .into_iter()
                .filter_map(|id| tuple_from_node(graph, id))
                .collect()
        });
        Ok(TupleCursor::from_items(tuples))
    }
}

impl GridDialect for GraphDialect {
    fn name(&self) -> &str {
        "graph"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            optimistic_locking: false,
            identity_columns: false,
            ..Capabilities::all()
        }
    }

    fn tuple_store(&self) -> Option<&dyn TupleStore> {
        Some(self)
    }

    fn association_store(&self) -> Option<&dyn AssociationStore> {
        Some(self)
    }

    fn sequence_generator(&self) -> Option<&dyn SequenceGenerator> {
        Some(self)
    }

    fn batch_executor(&self) -> Option<&dyn BatchExecutor> {
        Some(self)
    }

    fn bulk_scanner(&self) -> Option<&dyn BulkScanner> {
        Some(self)
    }
}
