//! [`KeyValueDialect`]: the dialect for stores that only read and write
//! whole values.
//!
//! # Consistency
//!
//! Every write reads the current value, applies the pending edits and
//! writes the whole value back with `compare_and_set`. A lost race is
//! retried up to `sequence_max_attempts` times and then reported as
//! [`GridError::ConcurrencyRace`]. Entities, their association values and
//! the per-table key index are separate entries, so a failure between two
//! of those writes leaves them out of step until the next write. Every
//! entity write re-checks the index entry, and scans drop index ids whose
//! entity has expired or vanished. Queued
//! batches are applied one operation at a time; an error stops the batch
//! but keeps the writes already made.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use gridstore_core::value::{flatten, remove_path, set_path, PATH_SEPARATOR};
use gridstore_core::{
    apply_association_operations, Association, AssociationContext, AssociationKey, AssociationKeyMetadata,
    AssociationStore, AssociationTypeContext, BatchExecutor, BulkScanner, Capabilities, Document, EntityKey,
    EntityKeyMetadata, GridConfig, GridDialect, GridError, ModelConsumer, NextValueRequest, Operation,
    OperationsQueue, Row, RowKey, SequenceGenerator, SnapshotKind, Tuple, TupleContext, TupleOperationKind,
    TupleSnapshot, TupleStore, Value,
};

use crate::client::KeyValueClient;
use crate::layout;

/// Outcome of one read-modify-write attempt.
enum Step<T> {
    /// Write the value and finish with `T` if the version still matches.
    Write(String, T),
    /// Nothing to write.
    Done(T),
}

/// Dialect over a shared [`KeyValueClient`].
#[derive(Debug)]
pub struct KeyValueDialect<C: KeyValueClient> {
    client: Arc<C>,
    config: GridConfig,
}

impl<C: KeyValueClient> KeyValueDialect<C> {
    pub fn new(client: Arc<C>, config: GridConfig) -> Self {
        KeyValueDialect { client, config }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Bounded optimistic read-modify-write of `key`.
    fn read_modify_write<T, F>(&self, key: &str, ttl: Option<Duration>, mut step: F) -> Result<T, GridError>
    where
        F: FnMut(Option<&str>) -> Result<Step<T>, GridError>,
    {
        let max_attempts = self.config.sequence_max_attempts;
        for attempt in 1..=max_attempts {
            let current = self.client.get(key)?;
            let (value, result) = match step(current.as_ref().map(|c| c.value.as_str()))? {
                Step::Done(result) => return Ok(result),
                Step::Write(value, result) => (value, result),
            };
            if self.client.compare_and_set(key, current.map(|c| c.version), &value, ttl)? {
                return Ok(result);
            }
            tracing::warn!(key, attempt, "value changed concurrently, retrying");
        }
        Err(GridError::ConcurrencyRace {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }

    /// Adds (`present`) or removes `id` in the key index of `table`.
    fn update_key_index(&self, table: &str, id: &str, present: bool) -> Result<(), GridError> {
        let index_key = layout::key_index(table);
        self.read_modify_write(&index_key, None, |current| {
            let mut ids: Vec<String> = match current {
                Some(text) => serde_json::from_str(text)?,
                None => Vec::new(),
            };
            match (present, ids.iter().position(|i| i == id)) {
                (true, None) => ids.push(id.to_string()),
                (false, Some(position)) => {
                    ids.remove(position);
                }
                _ => return Ok(Step::Done(())),
            }
            Ok(Step::Write(serde_json::to_string(&ids)?, ()))
        })
    }

    /// Removes `ids` from the key index of `table`, keeping any whose
    /// entity reappeared since it was found missing.
    fn prune_key_index(&self, table: &str, ids: &[String]) -> Result<(), GridError> {
        let index_key = layout::key_index(table);
        self.read_modify_write(&index_key, None, |current| {
            let Some(text) = current else {
                return Ok(Step::Done(()));
            };
            let mut indexed: Vec<String> = serde_json::from_str(text)?;
            let before = indexed.len();
            let mut kept = Vec::with_capacity(before);
            for id in indexed.drain(..) {
                let stale = ids.contains(&id) && self.client.get(&layout::indexed_entity_key(table, &id))?.is_none();
                if !stale {
                    kept.push(id);
                }
            }
            if kept.len() == before {
                return Ok(Step::Done(()));
            }
            tracing::debug!(table, pruned = before - kept.len(), "pruning key index");
            Ok(Step::Write(serde_json::to_string(&kept)?, ()))
        })
    }

    fn indexed_ids(&self, table: &str) -> Result<Vec<String>, GridError> {
        match self.client.get(&layout::key_index(table))? {
            Some(stored) => Ok(serde_json::from_str(&stored.value)?),
            None => Ok(Vec::new()),
        }
    }

    fn load_document(&self, storage_key: &str) -> Result<Option<Document>, GridError> {
        self.client
            .get(storage_key)?
            .map(|stored| parse_document(&stored.value))
            .transpose()
    }

    fn write_tuple(&self, key: &EntityKey, tuple: &Tuple, ttl: Option<Duration>) -> Result<(), GridError> {
        let storage_key = layout::entity_key(key);
        tracing::debug!(key = storage_key.as_str(), operations = tuple.operations().len(), "writing entity");
        self.read_modify_write(&storage_key, ttl, |current| {
            let document = match current {
                Some(text) => {
                    let mut document = parse_document(text)?;
                    apply_tuple_to_document(&mut document, tuple);
                    document
                }
                None => fresh_document(key, tuple),
            };
            Ok(Step::Write(Value::Object(document).to_string(), ()))
        })?;
        // Also repairs an index entry lost by an earlier failed write.
        self.update_key_index(key.table(), &layout::id_text(key.columns()), true)
    }

    fn delete_tuple(&self, key: &EntityKey) -> Result<(), GridError> {
        let storage_key = layout::entity_key(key);
        tracing::debug!(key = storage_key.as_str(), "deleting entity");
        self.client.delete(&storage_key)?;
        self.update_key_index(key.table(), &layout::id_text(key.columns()), false)
    }

    fn write_association(&self, key: &AssociationKey, association: &Association) -> Result<(), GridError> {
        let storage_key = layout::association_key(key);
        let metadata = key.metadata();
        tracing::debug!(key = storage_key.as_str(), operations = association.operations().len(), "writing association");
        let emptied = self.read_modify_write(&storage_key, None, |current| {
            let stored = match current {
                Some(text) => parse_rows(text, metadata)?,
                None => IndexMap::new(),
            };
            let rows = apply_association_operations(&stored, association.operations());
            if rows.is_empty() {
                return Ok(Step::Done(current.is_some()));
            }
            let rows: Vec<&Row> = rows.values().collect();
            Ok(Step::Write(serde_json::to_string(&rows)?, false))
        })?;
        if emptied {
            self.client.delete(&storage_key)?;
        }
        Ok(())
    }

    fn delete_association(&self, key: &AssociationKey) -> Result<(), GridError> {
        let storage_key = layout::association_key(key);
        if !self.client.delete(&storage_key)? {
            tracing::warn!(key = storage_key.as_str(), "no association value to remove");
        }
        Ok(())
    }

    fn apply(&self, operation: &Operation) -> Result<(), GridError> {
        match operation {
            Operation::InsertOrUpdateTuple { key, tuple, context } => self.write_tuple(key, tuple, context.options.ttl),
            Operation::RemoveTuple { key, .. } => self.delete_tuple(key),
            Operation::InsertOrUpdateAssociation { key, association, .. } => self.write_association(key, association),
            Operation::RemoveAssociation { key, .. } => self.delete_association(key),
        }
    }

    /// Applies queued operations in arrival order, returning how many ran.
    fn drain(&self, queue: &mut OperationsQueue) -> Result<usize, GridError> {
        let mut applied = 0;
        while let Some(operation) = queue.poll() {
            self.apply(&operation)?;
            applied += 1;
        }
        Ok(applied)
    }
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

fn parse_document(text: &str) -> Result<Document, GridError> {
    match serde_json::from_str(text)? {
        Value::Object(document) => Ok(document),
        other => Err(GridError::backend(format!("stored entity is not an object: {other}"))),
    }
}

/// Document of an entity that is not stored yet: its key plus every
/// current non-null column of the tuple.
fn fresh_document(key: &EntityKey, tuple: &Tuple) -> Document {
    let mut document = Document::new();
    for (column, value) in key.columns() {
        set_path(&mut document, column, value.clone());
    }
    for column in tuple.column_names() {
        if let Some(value) = tuple.get(&column).filter(|v| !v.is_null()) {
            set_path(&mut document, &column, value.clone());
        }
    }
    document
}

/// Null and removed columns are dropped from the stored value.
fn apply_tuple_to_document(document: &mut Document, tuple: &Tuple) {
    for op in tuple.operations() {
        match &op.kind {
            TupleOperationKind::Put(value) => set_path(document, &op.column, value.clone()),
            TupleOperationKind::PutNull | TupleOperationKind::Remove => {
                remove_path(document, &op.column);
            }
        }
    }
}

fn tuple_from_document(document: &Document, metadata: &EntityKeyMetadata, selectable: &[String]) -> Tuple {
    let columns = flatten(document).into_iter().filter(|(name, _)| {
        selectable.is_empty()
            || metadata.is_key_column(name)
            || selectable
                .iter()
                .any(|s| s == name || name.starts_with(&format!("{s}{PATH_SEPARATOR}")))
    });
    Tuple::new(TupleSnapshot::from_columns(columns))
}

fn key_only_tuple(key: &EntityKey) -> Tuple {
    let columns = key
        .columns()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    Tuple::new(TupleSnapshot::new(columns, SnapshotKind::Insert))
}

fn parse_rows(text: &str, metadata: &AssociationKeyMetadata) -> Result<IndexMap<RowKey, Row>, GridError> {
    let rows: Vec<Row> = serde_json::from_str(text)?;
    rows.into_iter()
        .map(|row| {
            let values = metadata
                .row_key_column_names()
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            let row_key = RowKey::new(metadata.row_key_column_names().iter().cloned(), values)?;
            Ok((row_key, row))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

impl<C: KeyValueClient> TupleStore for KeyValueDialect<C> {
    fn get_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Result<Option<Tuple>, GridError> {
        let storage_key = layout::entity_key(key);
        tracing::debug!(key = storage_key.as_str(), "get entity");
        Ok(match self.load_document(&storage_key)? {
            Some(document) => Some(tuple_from_document(&document, key.metadata(), context.selectable_columns())),
            None if context.operations_queue.is_some_and(|q| q.contains(key)) => Some(key_only_tuple(key)),
            None => None,
        })
    }

    fn create_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Tuple {
        key_only_tuple(key)
    }

    fn insert_or_update_tuple(
        &self,
        key: &EntityKey,
        tuple: &mut Tuple,
        context: &TupleContext<'_>,
    ) -> Result<(), GridError> {
        self.write_tuple(key, tuple, context.options().ttl)?;
        tuple.commit();
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Result<(), GridError> {
        self.delete_tuple(key)
    }
}

impl<C: KeyValueClient> AssociationStore for KeyValueDialect<C> {
    fn get_association(
        &self,
        key: &AssociationKey,
        context: &mut AssociationContext<'_>,
    ) -> Result<Option<Association>, GridError> {
        if let Some(queue) = context.operations_queue.as_deref_mut() {
            self.execute_batch(queue)?;
        }
        let storage_key = layout::association_key(key);
        tracing::debug!(key = storage_key.as_str(), "get association");
        match self.client.get(&storage_key)? {
            Some(stored) => Ok(Some(Association::new(parse_rows(&stored.value, key.metadata())?))),
            None => Ok(None),
        }
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
        self.write_association(key, association)?;
        association.commit();
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey, _context: &mut AssociationContext<'_>) -> Result<(), GridError> {
        self.delete_association(key)
    }

    /// Association values are always entries of their own.
    fn is_stored_in_entity_structure(&self, _metadata: &AssociationKeyMetadata, _context: &AssociationTypeContext) -> bool {
        false
    }
}

impl<C: KeyValueClient> SequenceGenerator for KeyValueDialect<C> {
    /// Optimistic: the counter is read, and the value after it written
    /// back only if no other caller wrote in between. Unlike the document
    /// and graph dialects this can fail with `ConcurrencyRace` under heavy
    /// contention.
    fn next_value(&self, request: &NextValueRequest) -> Result<i64, GridError> {
        let storage_key = layout::identifier_key(&request.key);
        tracing::debug!(key = storage_key.as_str(), "next value");
        self.read_modify_write(&storage_key, None, |current| {
            let value = match current {
                None => request.initial_value,
                Some(text) => text.trim().parse::<i64>().map_err(|_| GridError::NonNumericSequence {
                    sequence: request.key.to_string(),
                    field: request.key.metadata().value_column_name().to_string(),
                })?,
            };
            let next = value
                .checked_add(request.increment)
                .ok_or_else(|| GridError::SequenceExhausted {
                    sequence: request.key.to_string(),
                })?;
            Ok(Step::Write(next.to_string(), value))
        })
    }
}

impl<C: KeyValueClient> BatchExecutor for KeyValueDialect<C> {
    fn execute_batch(&self, queue: &mut OperationsQueue) -> Result<(), GridError> {
        if queue.is_closed() {
            return Ok(());
        }
        let result = self.drain(queue);
        queue.close();
        match result {
            Ok(applied) => {
                tracing::info!(operations = applied, "executed batch");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "batch stopped, remaining operations discarded");
                Err(err)
            }
        }
    }
}

impl<C: KeyValueClient> BulkScanner for KeyValueDialect<C> {
    fn for_each_tuple(
        &self,
        consumer: &mut dyn ModelConsumer,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<(), GridError> {
        for metadata in metadatas {
            let table = metadata.table();
            let ids = self.indexed_ids(table)?;
            tracing::debug!(table, keys = ids.len(), "scanning key index");
            let mut missing = Vec::new();
            for id in ids {
                match self.load_document(&layout::indexed_entity_key(table, &id))? {
                    Some(document) => consumer.consume(tuple_from_document(&document, metadata, &[])),
                    None => missing.push(id),
                }
            }
            if !missing.is_empty() {
                self.prune_key_index(table, &missing)?;
            }
        }
        Ok(())
    }
}

impl<C: KeyValueClient> GridDialect for KeyValueDialect<C> {
    fn name(&self) -> &str {
        "kv"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_queries: false,
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn person(id: i64) -> EntityKey {
        EntityKey::new(Arc::new(EntityKeyMetadata::new("Person", ["id"])), vec![json!(id)]).unwrap()
    }

    #[test]
    fn fresh_document_nests_columns_and_skips_nulls() {
        let mut tuple = key_only_tuple(&person(1));
        tuple.put("name", json!("Ada"));
        tuple.put("address.city", json!("London"));
        tuple.put("nickname", Value::Null);
        assert_eq!(
            Value::Object(fresh_document(&person(1), &tuple)),
            json!({"id": 1, "name": "Ada", "address": {"city": "London"}})
        );
    }

    #[test]
    fn operations_unset_nulls_and_prune_embedded_objects() {
        let mut document = parse_document(r#"{"id":1,"name":"Ada","address":{"city":"London"}}"#).unwrap();
        let mut tuple = Tuple::for_insert();
        tuple.put("address.city", Value::Null);
        tuple.put("age", json!(36));
        tuple.remove("name");
        apply_tuple_to_document(&mut document, &tuple);
        assert_eq!(Value::Object(document), json!({"id": 1, "age": 36}));
    }

    #[test]
    fn projection_keeps_keys_and_embedded_prefixes() {
        let document = parse_document(r#"{"id":1,"name":"Ada","age":36,"address":{"city":"London"}}"#).unwrap();
        let metadata = EntityKeyMetadata::new("Person", ["id"]);
        let tuple = tuple_from_document(&document, &metadata, &["address".to_string()]);
        let columns: Vec<&str> = tuple.snapshot().column_names().collect();
        assert_eq!(columns, vec!["id", "address.city"]);
    }

    #[test]
    fn non_object_entity_is_a_backend_error() {
        let err = parse_document("[1,2]").unwrap_err();
        assert!(err.is_transient());
    }
}
