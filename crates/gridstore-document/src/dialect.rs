//! [`DocumentDialect`]: the dialect for document databases.
//!
//! Entities are one document each, keyed by `_id`. Association rows live
//! either in a field of the owner document or in association documents,
//! depending on the [`AssociationStorageStrategy`] of the association.

use std::sync::Arc;

use gridstore_core::dialect::single_target;
use gridstore_core::value::get_path;
use gridstore_core::{
    Association, AssociationContext, AssociationKey, AssociationKeyMetadata, AssociationOptions, AssociationStorageStrategy,
    AssociationStore, AssociationTypeContext, BatchExecutor, BulkScanner, Capabilities, Document, EntityKey,
    EntityKeyMetadata, GridConfig, GridDialect, GridError, IdentityColumnStore, MapStorageType, ModelConsumer,
    NativeQueryExecutor, NextValueRequest, OptimisticLockingStore, SequenceGenerator, SnapshotKind, Tuple, TupleContext,
    TupleCursor, TupleStore, Value,
};

use crate::client::{DocumentClient, FindAndModify, FindOptions};
use crate::mapping::{
    association_from_value, association_id, association_rows, document_for_insert, embedded_rows, entity_id,
    id_filter, is_id_column, key_only_tuple, set_update, tuple_from_document, update_for_operations, ID_FIELD,
    ROWS_FIELD,
};
use crate::query::{DocumentQuery, QueryOperation};

/// Dialect over any [`DocumentClient`].
#[derive(Debug)]
pub struct DocumentDialect<C> {
    client: Arc<C>,
    config: GridConfig,
}

impl<C: DocumentClient> DocumentDialect<C> {
    pub fn new(client: Arc<C>, config: GridConfig) -> Self {
        DocumentDialect { client, config }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub(crate) fn strategy(
        &self,
        metadata: &AssociationKeyMetadata,
        options: &AssociationOptions,
    ) -> AssociationStorageStrategy {
        AssociationStorageStrategy::for_metadata(metadata, options, &self.config)
    }

    pub(crate) fn map_storage(&self, options: &AssociationOptions) -> MapStorageType {
        options.map_storage.unwrap_or(self.config.map_storage)
    }

    /// Collection holding separate association documents.
    pub fn association_collection(&self, key: &AssociationKey, strategy: AssociationStorageStrategy) -> String {
        match strategy {
            AssociationStorageStrategy::GlobalCollection => self.config.global_association_collection.clone(),
            _ => format!("{}{}", self.config.association_collection_prefix, key.table()),
        }
    }

    fn tuple_or_queued(&self, key: &EntityKey, found: Option<Document>, context: &TupleContext<'_>) -> Option<Tuple> {
        match found {
            Some(document) => Some(tuple_from_document(document, Some(key.metadata().as_ref()))),
            None if context.operations_queue.is_some_and(|q| q.contains(key)) => {
                Some(key_only_tuple(key, SnapshotKind::Insert))
            }
            None => None,
        }
    }

    /// `_id` filter extended with the version columns of `old_lock_state`.
    /// A null version column must be absent from the stored document.
    fn lock_filter(key: &EntityKey, old_lock_state: &Tuple) -> Document {
        let mut filter = id_filter(entity_id(key));
        for column in old_lock_state.column_names() {
            if is_id_column(key.metadata(), &column) {
                continue;
            }
            let condition = match old_lock_state.get(&column) {
                Some(value) if !value.is_null() => value.clone(),
                _ => {
                    let mut absent = Document::new();
                    absent.insert("$exists".to_string(), Value::Bool(false));
                    Value::Object(absent)
                }
            };
            filter.insert(column, condition);
        }
        filter
    }

    fn query_collection(
        query: &DocumentQuery,
        metadata: Option<&Arc<EntityKeyMetadata>>,
    ) -> Result<String, GridError> {
        match (&query.collection, metadata) {
            (Some(collection), _) => Ok(collection.clone()),
            (None, Some(metadata)) => Ok(metadata.table().to_string()),
            (None, None) => Err(GridError::UnknownCollection(format!("{query:?}"))),
        }
    }

    /// Writes `update` to the owner document of an embedded association.
    fn update_owner(&self, key: &AssociationKey, update: &Document, upsert: bool) -> Result<(), GridError> {
        let owner = key.owner();
        tracing::debug!(collection = owner.table(), %key, "updating embedded association");
        self.client
            .update_one(owner.table(), &id_filter(entity_id(owner)), update, upsert)?;
        Ok(())
    }
}

impl<C: DocumentClient> TupleStore for DocumentDialect<C> {
    fn get_tuple(&self, key: &EntityKey, context: &TupleContext<'_>) -> Result<Option<Tuple>, GridError> {
        tracing::debug!(collection = key.table(), %key, "find_one");
        let found = self
            .client
            .find_one(key.table(), &id_filter(entity_id(key)), context.selectable_columns())?;
        Ok(self.tuple_or_queued(key, found, context))
    }

    fn get_tuples(&self, keys: &[EntityKey], context: &TupleContext<'_>) -> Result<Vec<Option<Tuple>>, GridError> {
        let Some(first) = keys.first() else {
            return Ok(Vec::new());
        };
        let ids: Vec<Value> = keys.iter().map(entity_id).collect();
        let mut in_ids = Document::new();
        in_ids.insert("$in".to_string(), Value::Array(ids.clone()));
        let filter = id_filter(Value::Object(in_ids));

        tracing::debug!(collection = first.table(), count = keys.len(), "find by ids");
        let mut found: Vec<Option<Document>> = vec![None; keys.len()];
        let mut cursor = self.client.find(
            first.table(),
            &filter,
            &FindOptions::with_projection(context.selectable_columns()),
        )?;
        for document in cursor.by_ref() {
            let document = document?;
            let position = document
                .get(ID_FIELD)
                .and_then(|id| ids.iter().position(|candidate| candidate == id));
            if let Some(i) = position {
                found[i] = Some(document);
            }
        }
        cursor.close();

        Ok(keys
            .iter()
            .zip(found)
            .map(|(key, document)| self.tuple_or_queued(key, document, context))
            .collect())
    }

    fn create_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Tuple {
        key_only_tuple(key, SnapshotKind::Insert)
    }

    fn insert_or_update_tuple(
        &self,
        key: &EntityKey,
        tuple: &mut Tuple,
        _context: &TupleContext<'_>,
    ) -> Result<(), GridError> {
        let update = match tuple.kind() {
            SnapshotKind::Insert => set_update(&document_for_insert(tuple, key)),
            SnapshotKind::Update => update_for_operations(tuple, key),
        };
        tracing::debug!(collection = key.table(), %key, kind = ?tuple.kind(), "upsert");
        self.client
            .update_one(key.table(), &id_filter(entity_id(key)), &update, true)?;
        tuple.commit();
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey, _context: &TupleContext<'_>) -> Result<(), GridError> {
        tracing::debug!(collection = key.table(), %key, "delete");
        self.client.delete_one(key.table(), &id_filter(entity_id(key)))?;
        Ok(())
    }
}

impl<C: DocumentClient> AssociationStore for DocumentDialect<C> {
    fn get_association(
        &self,
        key: &AssociationKey,
        context: &mut AssociationContext<'_>,
    ) -> Result<Option<Association>, GridError> {
        let strategy = self.strategy(key.metadata(), context.options());

        if strategy.is_embedded()
            && context
                .operations_queue
                .as_deref()
                .is_some_and(|q| q.contains_insert(key.owner()))
        {
            // The owner has not reached the store yet.
            return Ok(Some(Association::empty()));
        }

        if let Some(queue) = context.operations_queue.as_deref_mut() {
            self.execute_batch(queue)?;
        }

        if strategy.is_embedded() {
            let role = key.collection_role();
            let from_tuple = context
                .entity_tuple
                .as_deref()
                .and_then(|tuple| tuple.get(role).cloned());
            let value = match from_tuple {
                Some(value) => Some(value),
                None => {
                    let owner = key.owner();
                    tracing::debug!(collection = owner.table(), %key, "find_one embedded association");
                    self.client
                        .find_one(owner.table(), &id_filter(entity_id(owner)), &[role.to_string()])?
                        .and_then(|document| embedded_rows(&document, key).cloned())
                }
            };
            return value.map(|v| association_from_value(&v, key)).transpose();
        }

        let collection = self.association_collection(key, strategy);
        tracing::debug!(collection = collection.as_str(), %key, "find_one association");
        let found = self.client.find_one(
            &collection,
            &id_filter(association_id(key, strategy)),
            &[ROWS_FIELD.to_string()],
        )?;
        found
            .map(|document| {
                let rows = document.get(ROWS_FIELD).cloned().unwrap_or(Value::Null);
                association_from_value(&rows, key)
            })
            .transpose()
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
        context: &mut AssociationContext<'_>,
    ) -> Result<(), GridError> {
        let strategy = self.strategy(key.metadata(), context.options());
        let rows = association_rows(association, key, self.map_storage(context.options()));

        if strategy.is_embedded() {
            let role = key.collection_role();
            let mut fields = Document::new();
            fields.insert(role.to_string(), rows.clone());
            let mut update = Document::new();
            update.insert("$set".to_string(), Value::Object(fields));
            self.update_owner(key, &update, true)?;
            if let Some(tuple) = context.entity_tuple.as_deref_mut() {
                tuple.refresh_snapshot_column(role, Some(rows));
            }
        } else {
            let collection = self.association_collection(key, strategy);
            let mut fields = Document::new();
            fields.insert(ROWS_FIELD.to_string(), rows);
            let mut update = Document::new();
            update.insert("$set".to_string(), Value::Object(fields));
            tracing::debug!(collection = collection.as_str(), %key, "upsert association");
            self.client
                .update_one(&collection, &id_filter(association_id(key, strategy)), &update, true)?;
        }
        association.commit();
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey, context: &mut AssociationContext<'_>) -> Result<(), GridError> {
        let strategy = self.strategy(key.metadata(), context.options());

        if strategy.is_embedded() {
            let role = key.collection_role();
            let mut fields = Document::new();
            fields.insert(role.to_string(), Value::from(1));
            let mut update = Document::new();
            update.insert("$unset".to_string(), Value::Object(fields));
            self.update_owner(key, &update, false)?;
            if let Some(tuple) = context.entity_tuple.as_deref_mut() {
                tuple.refresh_snapshot_column(role, None);
            }
            return Ok(());
        }

        let collection = self.association_collection(key, strategy);
        let removed = self
            .client
            .delete_many(&collection, &id_filter(association_id(key, strategy)))?;
        if removed == 0 {
            tracing::warn!(collection = collection.as_str(), %key, "removed association matched no document");
        } else {
            tracing::debug!(collection = collection.as_str(), %key, removed, "removed association");
        }
        Ok(())
    }

    fn is_stored_in_entity_structure(&self, metadata: &AssociationKeyMetadata, context: &AssociationTypeContext) -> bool {
        self.strategy(metadata, &context.options).is_embedded()
    }
}

impl<C: DocumentClient> SequenceGenerator for DocumentDialect<C> {
    /// Increments the counter document atomically and returns the value it
    /// held before. The stored counter is the next value to hand out.
    ///
    /// On first use the counter is seeded with a second increment by the
    /// initial value. That step is not atomic with the first one: callers
    /// racing on a fresh sequence can both receive the initial value.
    fn next_value(&self, request: &NextValueRequest) -> Result<i64, GridError> {
        let key = &request.key;
        let collection = key.table();
        let field = key.metadata().value_column_name();
        let filter = id_filter(Value::String(key.segment().to_string()));
        let options = FindAndModify {
            upsert: true,
            return_new: false,
        };
        let non_numeric = |err: GridError| match err {
            GridError::InvalidOperation(_) => GridError::NonNumericSequence {
                sequence: key.to_string(),
                field: field.to_string(),
            },
            other => other,
        };

        let increment = inc(field, request.increment);
        tracing::debug!(collection, sequence = key.segment(), "find_one_and_update $inc");
        let previous = self
            .client
            .find_one_and_update(collection, &filter, &increment, options)
            .map_err(non_numeric)?;

        match previous.as_ref().and_then(|document| get_path(document, field)) {
            None => {
                tracing::debug!(collection, sequence = key.segment(), "seeding new sequence");
                self.client
                    .find_one_and_update(collection, &filter, &inc(field, request.initial_value), options)
                    .map_err(non_numeric)?;
                Ok(request.initial_value)
            }
            Some(value) if value.is_f64() => {
                // `$inc` past i64::MAX leaves a float behind.
                Err(GridError::SequenceExhausted {
                    sequence: key.to_string(),
                })
            }
            Some(value) => value.as_i64().ok_or_else(|| GridError::NonNumericSequence {
                sequence: key.to_string(),
                field: field.to_string(),
            }),
        }
    }
}

fn inc(field: &str, by: i64) -> Document {
    let mut fields = Document::new();
    fields.insert(field.to_string(), Value::from(by));
    let mut update = Document::new();
    update.insert("$inc".to_string(), Value::Object(fields));
    update
}

impl<C: DocumentClient> BulkScanner for DocumentDialect<C> {
    fn for_each_tuple(
        &self,
        consumer: &mut dyn ModelConsumer,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<(), GridError> {
        for metadata in metadatas {
            tracing::debug!(collection = metadata.table(), "scanning collection");
            let mut cursor = self
                .client
                .find(metadata.table(), &Document::new(), &FindOptions::default())?;
            for document in cursor.by_ref() {
                consumer.consume(tuple_from_document(document?, Some(metadata.as_ref())));
            }
            cursor.close();
        }
        Ok(())
    }
}

impl<C: DocumentClient> NativeQueryExecutor for DocumentDialect<C> {
    type Query = DocumentQuery;

    fn execute_backend_query(
        &self,
        query: &DocumentQuery,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<TupleCursor, GridError> {
        let metadata = single_target(metadatas)?.cloned();
        let collection = Self::query_collection(query, metadata.as_ref())?;
        tracing::debug!(collection = collection.as_str(), operation = ?query.operation, "native query");

        match query.operation {
            QueryOperation::Find => {
                let cursor = self.client.find(&collection, &query.criteria, &query.find_options())?;
                Ok(cursor.map_items(move |document| Ok(tuple_from_document(document, metadata.as_deref()))))
            }
            QueryOperation::FindOne => {
                let found = self.client.find_one(&collection, &query.criteria, &query.projection)?;
                let tuples = found
                    .map(|document| tuple_from_document(document, metadata.as_deref()))
                    .into_iter()
                    .collect();
                Ok(TupleCursor::from_items(tuples))
            }
            QueryOperation::Count => {
                let n = self.client.count(&collection, &query.criteria)?;
                let mut columns = indexmap::IndexMap::new();
                columns.insert("n".to_string(), Value::from(n));
                let tuple = Tuple::new(gridstore_core::TupleSnapshot::new(columns, SnapshotKind::Update));
                Ok(TupleCursor::from_items(vec![tuple]))
            }
            QueryOperation::Aggregate => {
                let cursor = self.client.aggregate(&collection, &query.pipeline())?;
                Ok(cursor.map_items(move |document| Ok(tuple_from_document(document, metadata.as_deref()))))
            }
            QueryOperation::Insert | QueryOperation::Update | QueryOperation::Remove => Err(
                GridError::InvalidOperation(format!("{:?} runs as a native update query", query.operation)),
            ),
        }
    }

    fn execute_backend_update_query(
        &self,
        query: &DocumentQuery,
        metadatas: &[Arc<EntityKeyMetadata>],
    ) -> Result<u64, GridError> {
        let metadata = single_target(metadatas)?;
        let collection = Self::query_collection(query, metadata)?;
        tracing::debug!(collection = collection.as_str(), operation = ?query.operation, "native update query");

        let affected = match query.operation {
            QueryOperation::Insert => {
                let documents = query.insert_documents()?;
                let count = documents.len() as u64;
                for document in documents {
                    self.client.insert_one(&collection, document)?;
                }
                count
            }
            QueryOperation::Update => {
                let update = query.update_document()?;
                let outcome = if query.options.multi {
                    self.client
                        .update_many(&collection, &query.criteria, update, query.options.upsert)?
                } else {
                    self.client
                        .update_one(&collection, &query.criteria, update, query.options.upsert)?
                };
                if outcome.upserted {
                    1
                } else {
                    outcome.matched
                }
            }
            QueryOperation::Remove if query.options.just_one => self.client.delete_one(&collection, &query.criteria)?,
            QueryOperation::Remove => self.client.delete_many(&collection, &query.criteria)?,
            QueryOperation::Find | QueryOperation::FindOne | QueryOperation::Count | QueryOperation::Aggregate => {
                return Err(GridError::InvalidOperation(format!(
                    "{:?} does not write, run it as a native query",
                    query.operation
                )))
            }
        };
        tracing::debug!(collection = collection.as_str(), affected, "native update query done");
        Ok(affected)
    }
}

impl<C: DocumentClient> OptimisticLockingStore for DocumentDialect<C> {
    fn update_tuple_with_optimistic_lock(
        &self,
        key: &EntityKey,
        old_lock_state: &Tuple,
        tuple: &mut Tuple,
        _context: &TupleContext<'_>,
    ) -> Result<bool, GridError> {
        let update = update_for_operations(tuple, key);
        tracing::debug!(collection = key.table(), %key, "update with optimistic lock");
        let outcome = self
            .client
            .update_one(key.table(), &Self::lock_filter(key, old_lock_state), &update, false)?;
        if outcome.matched == 0 {
            tracing::debug!(collection = key.table(), %key, "optimistic lock failed");
            return Ok(false);
        }
        tuple.commit();
        Ok(true)
    }

    fn remove_tuple_with_optimistic_lock(
        &self,
        key: &EntityKey,
        old_lock_state: &Tuple,
        _context: &TupleContext<'_>,
    ) -> Result<bool, GridError> {
        tracing::debug!(collection = key.table(), %key, "delete with optimistic lock");
        let removed = self
            .client
            .delete_one(key.table(), &Self::lock_filter(key, old_lock_state))?;
        Ok(removed > 0)
    }
}

impl<C: DocumentClient> IdentityColumnStore for DocumentDialect<C> {
    /// The store generates `_id` and the tuple gets it back in its key column.
    fn insert_tuple(
        &self,
        metadata: &EntityKeyMetadata,
        tuple: &mut Tuple,
        _context: &TupleContext<'_>,
    ) -> Result<Value, GridError> {
        let [id_column] = metadata.column_names() else {
            return Err(GridError::InvalidOperation(format!(
                "identity insert into '{}' needs a single key column",
                metadata.table()
            )));
        };
        let mut document = Document::new();
        for column in tuple.column_names() {
            if is_id_column(metadata, &column) {
                continue;
            }
            if let Some(value) = tuple.get(&column).filter(|value| !value.is_null()) {
                gridstore_core::value::set_path(&mut document, &column, value.clone());
            }
        }
        tracing::debug!(collection = metadata.table(), "insert_one with generated id");
        let id = self.client.insert_one(metadata.table(), document)?;
        tuple.put(id_column.clone(), id.clone());
        tuple.commit();
        Ok(id)
    }
}

impl<C: DocumentClient> GridDialect for DocumentDialect<C> {
    fn name(&self) -> &str {
        "document"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
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

    fn optimistic_locking_store(&self) -> Option<&dyn OptimisticLockingStore> {
        Some(self)
    }

    fn identity_column_store(&self) -> Option<&dyn IdentityColumnStore> {
        Some(self)
    }
}
