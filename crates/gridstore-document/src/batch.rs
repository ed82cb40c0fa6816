//! Batched execution of an [`OperationsQueue`] for the document dialect.
//!
//! Inserts of new entities are buffered per collection and written with one
//! `insert_many` call per collection once the queue is drained. Everything
//! else is issued immediately, with three exceptions that touch the buffer
//! instead of the store:
//!
//! - a write for an entity already buffered is merged into the buffered document
//! - removing a buffered entity cancels its insert
//! - embedded association writes for a buffered owner are merged into it

use gridstore_core::value::{remove_path, set_path};
use gridstore_core::{
    AssociationContext, AssociationStore, BatchExecutor, Document, EntityKey, GridError, Operation, OperationsQueue,
    SnapshotKind, TupleContext, TupleStore,
};
use indexmap::IndexMap;

use crate::client::DocumentClient;
use crate::dialect::DocumentDialect;
use crate::mapping::{
    apply_operations_to_document, association_rows, document_for_insert, entity_id, id_filter, is_batch_safe,
    set_update,
};

/// Inserts waiting for the end of the batch, grouped by collection.
#[derive(Debug, Default)]
struct PendingInserts {
    collections: IndexMap<String, IndexMap<EntityKey, Document>>,
}

impl PendingInserts {
    fn contains(&self, key: &EntityKey) -> bool {
        self.collections
            .get(key.table())
            .is_some_and(|documents| documents.contains_key(key))
    }

    fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Document> {
        self.collections.get_mut(key.table())?.get_mut(key)
    }

    fn take(&mut self, key: &EntityKey) -> Option<Document> {
        self.collections.get_mut(key.table())?.shift_remove(key)
    }

    fn buffer(&mut self, key: EntityKey, document: Document) {
        self.collections
            .entry(key.table().to_string())
            .or_default()
            .insert(key, document);
    }
}

/// Counters reported once a batch is flushed.
#[derive(Debug, Default)]
struct BatchSummary {
    operations: usize,
    buffered_inserts: usize,
    fallbacks: usize,
    cancelled: usize,
}

impl<C: DocumentClient> DocumentDialect<C> {
    fn drain(&self, queue: &mut OperationsQueue) -> Result<BatchSummary, GridError> {
        let mut pending = PendingInserts::default();
        let mut summary = BatchSummary::default();
        while let Some(operation) = queue.poll() {
            summary.operations += 1;
            self.apply_queued(operation, &mut pending, &mut summary)?;
        }
        self.flush(pending, &mut summary)?;
        Ok(summary)
    }

    fn apply_queued(
        &self,
        operation: Operation,
        pending: &mut PendingInserts,
        summary: &mut BatchSummary,
    ) -> Result<(), GridError> {
        match operation {
            Operation::InsertOrUpdateTuple {
                key,
                mut tuple,
                context,
            } => {
                let safe = is_batch_safe(&tuple);
                if let Some(mut document) = pending.take(&key) {
                    apply_operations_to_document(&tuple, &key, &mut document);
                    if safe {
                        pending.buffer(key, document);
                    } else {
                        tracing::warn!(collection = key.table(), %key, "field name not batchable, upserting buffered entity");
                        summary.fallbacks += 1;
                        self.client()
                            .update_one(key.table(), &id_filter(entity_id(&key)), &set_update(&document), true)?;
                    }
                } else if tuple.kind() == SnapshotKind::Insert && self.config().batch_inserts && safe {
                    pending.buffer(key.clone(), document_for_insert(&tuple, &key));
                } else {
                    if tuple.kind() == SnapshotKind::Insert && self.config().batch_inserts {
                        tracing::warn!(collection = key.table(), %key, "field name not batchable, upserting");
                        summary.fallbacks += 1;
                    }
                    self.insert_or_update_tuple(&key, &mut tuple, &TupleContext::new(&context))?;
                }
            }
            Operation::RemoveTuple { key, context } => {
                if pending.take(&key).is_some() {
                    tracing::debug!(collection = key.table(), %key, "cancelled buffered insert");
                    summary.cancelled += 1;
                } else {
                    self.remove_tuple(&key, &TupleContext::new(&context))?;
                }
            }
            Operation::InsertOrUpdateAssociation {
                key,
                mut association,
                context,
            } => {
                let strategy = self.strategy(key.metadata(), &context.options);
                if strategy.is_embedded() {
                    if let Some(owner) = pending.get_mut(key.owner()) {
                        let rows = association_rows(&association, &key, self.map_storage(&context.options));
                        set_path(owner, key.collection_role(), rows);
                        return Ok(());
                    }
                }
                self.insert_or_update_association(&key, &mut association, &mut AssociationContext::new(context))?;
            }
            Operation::RemoveAssociation { key, context } => {
                let strategy = self.strategy(key.metadata(), &context.options);
                if strategy.is_embedded() {
                    if let Some(owner) = pending.get_mut(key.owner()) {
                        remove_path(owner, key.collection_role());
                        return Ok(());
                    }
                }
                self.remove_association(&key, &mut AssociationContext::new(context))?;
            }
        }
        Ok(())
    }

    fn flush(&self, pending: PendingInserts, summary: &mut BatchSummary) -> Result<(), GridError> {
        for (collection, documents) in pending.collections {
            if documents.is_empty() {
                // Emptied by removals queued after the inserts.
                continue;
            }
            let count = documents.len();
            tracing::debug!(collection = collection.as_str(), count, "insert_many");
            self.client()
                .insert_many(&collection, documents.into_values().collect())?;
            summary.buffered_inserts += count;
        }
        Ok(())
    }
}

impl<C: DocumentClient> BatchExecutor for DocumentDialect<C> {
    fn execute_batch(&self, queue: &mut OperationsQueue) -> Result<(), GridError> {
        if queue.is_closed() {
            return Ok(());
        }
        let result = self.drain(queue);
        queue.close();
        match result {
            Ok(summary) => {
                tracing::info!(
                    operations = summary.operations,
                    inserted = summary.buffered_inserts,
                    fallbacks = summary.fallbacks,
                    cancelled = summary.cancelled,
                    "executed batch"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "batch aborted, remaining operations discarded");
                Err(err)
            }
        }
    }
}
