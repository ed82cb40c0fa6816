//! Conversion between tuples/associations and nodes/relationships.
//!
//! An entity is a node labeled `ENTITY` and its table. Key columns and
//! plain columns are node properties. A dotted column such as
//! `address.city` lives on an `EMBEDDED` node reached from the owner
//! through an `address` relationship.
//!
//! Association rows take one of two shapes:
//!
//! - rows pointing at another entity are relationships typed by the
//!   collection role, from the owner to the target entity node, carrying
//!   the remaining columns (list index and the like) as properties
//! - any other rows are element nodes labeled `EMBEDDED` and the
//!   association table, linked from the owner by the collection role

use indexmap::IndexMap;

use gridstore_core::value::PATH_SEPARATOR;
use gridstore_core::{
    Association, AssociationKey, AssociationKeyMetadata, AssociationKind, AssociationOperation, Document, EntityKey,
    EntityKeyMetadata, GridError, Row, RowKey, SnapshotKind, Tuple, TupleOperationKind, TupleSnapshot, Value,
};

use crate::engine::{labels, Graph, NodeId, RelId, EMBEDDED, ENTITY};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

fn key_filter(key: &EntityKey) -> Document {
    key.columns()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn find_entity(graph: &Graph, key: &EntityKey) -> Option<NodeId> {
    graph
        .find_nodes(key.table(), &key_filter(key))
        .into_iter()
        .find(|id| graph.node(*id).is_some_and(|n| n.has_label(ENTITY)))
}

/// Creates the node of a new entity holding only its key columns.
///
/// Single-column keys are backed by a unique constraint. Composite keys
/// are checked by lookup.
pub fn create_entity(graph: &mut Graph, key: &EntityKey) -> Result<NodeId, GridError> {
    if let [column] = key.column_names() {
        graph.add_unique_constraint(key.table(), column);
    }
    let already_exists = || GridError::TupleAlreadyExists {
        table: key.table().to_string(),
        key: key.to_string(),
    };
    if find_entity(graph, key).is_some() {
        return Err(already_exists());
    }
    graph
        .create_node(labels([ENTITY, key.table()]), key_filter(key))
        .map_err(|err| match err {
            GridError::TupleAlreadyExists { .. } => already_exists(),
            other => other,
        })
}

/// Node of `key`, created when missing.
pub fn merge_entity(graph: &mut Graph, key: &EntityKey) -> Result<NodeId, GridError> {
    match find_entity(graph, key) {
        Some(id) => Ok(id),
        None => create_entity(graph, key),
    }
}

/// Whether a column lives on an embedded node rather than the owner.
pub fn is_embedded_column(metadata: &EntityKeyMetadata, column: &str) -> bool {
    column.contains(PATH_SEPARATOR) && !metadata.is_key_column(column)
}

/// Rebuilds the tuple of an entity node, embedded columns included.
pub fn tuple_from_node(graph: &Graph, id: NodeId) -> Option<Tuple> {
    let node = graph.node(id)?;
    let mut columns: IndexMap<String, Value> = node
        .properties
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for path in graph.traverse_embedded(id) {
        let prefix = path.column_prefix();
        if let Some(embedded) = graph.node(path.terminal) {
            for (name, value) in &embedded.properties {
                columns.insert(format!("{prefix}{PATH_SEPARATOR}{name}"), value.clone());
            }
        }
    }
    Some(Tuple::new(TupleSnapshot::new(columns, SnapshotKind::Update)))
}

/// Keeps the key columns and the `selectable` ones. An empty list keeps
/// every column.
pub fn project_tuple(tuple: Tuple, metadata: &EntityKeyMetadata, selectable: &[String]) -> Tuple {
    if selectable.is_empty() {
        return tuple;
    }
    let columns = tuple
        .snapshot()
        .columns()
        .iter()
        .filter(|(name, _)| {
            metadata.is_key_column(name)
                || selectable.iter().any(|s| {
                    s == *name || name.starts_with(&format!("{s}{PATH_SEPARATOR}"))
                })
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Tuple::new(TupleSnapshot::new(columns, tuple.kind()))
}

/// Splits `address.geo.lat` into (`["address", "geo"]`, `lat`).
fn split_column(column: &str) -> (Vec<&str>, &str) {
    let mut segments: Vec<&str> = column.split(PATH_SEPARATOR).collect();
    let property = segments.pop().unwrap_or(column);
    (segments, property)
}

fn find_embedded(graph: &Graph, owner: NodeId, segments: &[&str]) -> Option<NodeId> {
    let mut current = owner;
    for segment in segments {
        current = graph
            .outgoing(current, Some(segment))
            .into_iter()
            .map(|(_, target)| target)
            .find(|target| graph.node(*target).is_some_and(crate::engine::is_embedded_value))?;
    }
    Some(current)
}

fn ensure_embedded(graph: &mut Graph, owner: NodeId, segments: &[&str]) -> Result<NodeId, GridError> {
    let mut current = owner;
    for (depth, segment) in segments.iter().enumerate() {
        current = match find_embedded(graph, current, &segments[depth..=depth]) {
            Some(next) => next,
            None => {
                let next = graph.create_node(labels([EMBEDDED]), Document::new())?;
                graph.create_relationship(current, next, segment, Document::new())?;
                next
            }
        };
    }
    Ok(current)
}

/// Deletes empty embedded nodes on `segments`, deepest first.
fn prune_embedded(graph: &mut Graph, owner: NodeId, segments: &[&str]) {
    for depth in (1..=segments.len()).rev() {
        let Some(node) = find_embedded(graph, owner, &segments[..depth]) else {
            continue;
        };
        let empty = graph.node(node).is_some_and(|n| n.properties.is_empty()) && !graph.has_outgoing(node);
        if !empty {
            return;
        }
        graph.delete_node(node);
    }
}

/// Applies the pending operations of `tuple` to the node `id`.
pub fn apply_tuple(graph: &mut Graph, id: NodeId, key: &EntityKey, tuple: &Tuple) -> Result<(), GridError> {
    let metadata = key.metadata();
    for op in tuple.operations() {
        if metadata.is_key_column(&op.column) {
            continue;
        }
        if is_embedded_column(metadata, &op.column) {
            let (segments, property) = split_column(&op.column);
            match &op.kind {
                TupleOperationKind::Put(value) => {
                    let node = ensure_embedded(graph, id, &segments)?;
                    graph.set_property(node, property, value.clone())?;
                }
                TupleOperationKind::PutNull | TupleOperationKind::Remove => {
                    if let Some(node) = find_embedded(graph, id, &segments) {
                        graph.remove_property(node, property);
                        prune_embedded(graph, id, &segments);
                    }
                }
            }
        } else {
            match &op.kind {
                TupleOperationKind::Put(value) => graph.set_property(id, &op.column, value.clone())?,
                TupleOperationKind::PutNull | TupleOperationKind::Remove => {
                    graph.remove_property(id, &op.column);
                }
            }
        }
    }
    Ok(())
}

/// Writes every current column of an insert tuple to its new node. Insert
/// tuples may carry values in their snapshot as well as in their log.
pub fn write_insert(graph: &mut Graph, id: NodeId, key: &EntityKey, tuple: &Tuple) -> Result<(), GridError> {
    let mut full = Tuple::for_insert();
    for column in tuple.column_names() {
        if let Some(value) = tuple.get(&column) {
            if !value.is_null() {
                full.put(column, value.clone());
            }
        }
    }
    apply_tuple(graph, id, key, &full)
}

/// Deletes an entity node with its embedded values and collection elements.
pub fn delete_entity(graph: &mut Graph, id: NodeId) {
    for embedded in graph.embedded_subtree(id) {
        graph.delete_node(embedded);
    }
    graph.delete_node(id);
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

/// Whether rows of this association are relationships to entity nodes.
pub fn is_relationship_association(metadata: &AssociationKeyMetadata) -> bool {
    metadata.kind() == AssociationKind::Entity && metadata.associated_entity().is_some()
}

fn row_key_of(metadata: &AssociationKeyMetadata, row: &Row) -> Result<RowKey, GridError> {
    let values = metadata
        .row_key_column_names()
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    RowKey::new(metadata.row_key_column_names().iter().cloned(), values)
}

/// Row stored behind one relationship or element node.
fn stored_row(graph: &Graph, key: &AssociationKey, rel: RelId, target: NodeId) -> Row {
    let mut row = Row::new();
    for (name, value) in key.columns() {
        row.insert(name.to_string(), value.clone());
    }
    let metadata = key.metadata();
    match metadata.associated_entity() {
        Some(associated) if metadata.kind() == AssociationKind::Entity => {
            if let Some(node) = graph.node(target) {
                for column in associated.association_key_columns() {
                    let property = associated.entity_key_column(column).unwrap_or(column);
                    if let Some(value) = node.property(property) {
                        row.insert(column.clone(), value.clone());
                    }
                }
            }
            if let Some(relationship) = graph.relationship(rel) {
                row.extend(relationship.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        _ => {
            if let Some(node) = graph.node(target) {
                row.extend(node.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }
    row
}

/// Stored rows of an association, keyed by row key, oldest first.
fn stored_rows(graph: &Graph, owner: NodeId, key: &AssociationKey) -> Result<Vec<(RowKey, Row, RelId, NodeId)>, GridError> {
    let metadata = key.metadata();
    let relationship_rows = is_relationship_association(metadata);
    let mut rows = Vec::new();
    for (rel, target) in graph.outgoing(owner, Some(key.collection_role())) {
        let Some(node) = graph.node(target) else {
            continue;
        };
        let belongs = if relationship_rows {
            node.has_label(ENTITY)
        } else {
            node.has_label(EMBEDDED) && node.has_label(metadata.table())
        };
        if !belongs {
            continue;
        }
        let row = stored_row(graph, key, rel, target);
        rows.push((row_key_of(metadata, &row)?, row, rel, target));
    }
    Ok(rows)
}

/// Reads the association of `key` hanging off `owner`.
pub fn read_association(graph: &Graph, owner: NodeId, key: &AssociationKey) -> Result<Association, GridError> {
    let snapshot: IndexMap<RowKey, Row> = stored_rows(graph, owner, key)?
        .into_iter()
        .map(|(row_key, row, _, _)| (row_key, row))
        .collect();
    Ok(Association::new(snapshot))
}

fn remove_row(graph: &mut Graph, owner: NodeId, key: &AssociationKey, row_key: &RowKey) -> Result<(), GridError> {
    let relationship_rows = is_relationship_association(key.metadata());
    for (stored_key, _, rel, target) in stored_rows(graph, owner, key)? {
        if &stored_key != row_key {
            continue;
        }
        if relationship_rows {
            graph.delete_relationship(rel);
        } else {
            graph.delete_node(target);
        }
    }
    Ok(())
}

fn clear_rows(graph: &mut Graph, owner: NodeId, key: &AssociationKey) -> Result<(), GridError> {
    let relationship_rows = is_relationship_association(key.metadata());
    for (_, _, rel, target) in stored_rows(graph, owner, key)? {
        if relationship_rows {
            graph.delete_relationship(rel);
        } else {
            graph.delete_node(target);
        }
    }
    Ok(())
}

/// Columns kept on the relationship or element node: everything except
/// the association key and, for relationships, the target entity key.
fn row_properties(metadata: &AssociationKeyMetadata, row: &Row) -> Document {
    let associated = metadata.associated_entity();
    row.iter()
        .filter(|(column, value)| {
            !value.is_null()
                && !metadata.is_key_column(column)
                && !associated.is_some_and(|a| a.is_association_key_column(column))
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn put_row(graph: &mut Graph, owner: NodeId, key: &AssociationKey, row_key: &RowKey, row: &Row) -> Result<(), GridError> {
    remove_row(graph, owner, key, row_key)?;
    let metadata = key.metadata();
    let properties = row_properties(metadata, row);
    match metadata.associated_entity() {
        Some(associated) if metadata.kind() == AssociationKind::Entity => {
            let target_metadata = associated.entity_key_metadata();
            let values = target_metadata
                .column_names()
                .iter()
                .map(|target_column| {
                    associated
                        .association_key_columns()
                        .iter()
                        .find(|c| associated.entity_key_column(c) == Some(target_column.as_str()))
                        .and_then(|c| row.get(c).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();
            let target_key = EntityKey::new(target_metadata.clone(), values)?;
            let target = merge_entity(graph, &target_key)?;
            graph.create_relationship(owner, target, key.collection_role(), properties)?;
        }
        _ => {
            let element = graph.create_node(labels([EMBEDDED, metadata.table()]), properties)?;
            graph.create_relationship(owner, element, key.collection_role(), Document::new())?;
        }
    }
    Ok(())
}

/// Applies the pending operations of `association` under `owner`.
pub fn apply_association(
    graph: &mut Graph,
    owner: NodeId,
    key: &AssociationKey,
    association: &Association,
) -> Result<(), GridError> {
    for op in association.operations() {
        match op {
            AssociationOperation::Put(row_key, row) => put_row(graph, owner, key, row_key, row)?,
            AssociationOperation::PutNull(row_key) | AssociationOperation::Remove(row_key) => {
                remove_row(graph, owner, key, row_key)?
            }
            AssociationOperation::Clear => clear_rows(graph, owner, key)?,
        }
    }
    Ok(())
}

/// Removes every row of the association under `owner`.
pub fn remove_association_rows(graph: &mut Graph, owner: NodeId, key: &AssociationKey) -> Result<(), GridError> {
    clear_rows(graph, owner, key)
}
