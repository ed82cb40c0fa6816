//! In-memory implementation of [`DocumentClient`].
//!
//! [`InMemoryDocumentStore`] keeps every collection in a [`DashMap`] so that
//! calls touching one collection are atomic with respect to each other. It
//! also records call statistics, which tests use to observe how the dialect
//! talks to the store.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use indexmap::IndexMap;

use gridstore_core::{Cursor, Document, GridError, Value};

use crate::client::{DocumentClient, FindAndModify, FindOptions, UpdateOutcome};
use crate::filter::{apply_update, matches, project, run_pipeline, sort_documents, upsert_seed};
use crate::mapping::ID_FIELD;

/// Documents of one collection keyed by canonical `_id` text.
type Collection = IndexMap<String, Document>;

/// Counts of the calls made against an [`InMemoryDocumentStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub find_one: usize,
    pub find: usize,
    pub count: usize,
    pub aggregate: usize,
    pub insert_one: usize,
    pub update_one: usize,
    pub update_many: usize,
    pub find_one_and_update: usize,
    pub delete: usize,
    /// Size of every `insert_many` call, in call order.
    pub insert_many_sizes: Vec<usize>,
}

impl CallStats {
    /// Number of individual store writes.
    pub fn writes(&self) -> usize {
        self.insert_one
            + self.update_one
            + self.update_many
            + self.find_one_and_update
            + self.delete
            + self.insert_many_sizes.len()
    }
}

/// Document database held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: DashMap<String, Collection>,
    stats: Mutex<CallStats>,
    open_cursors: Arc<AtomicUsize>,
    /// Source of generated `_id` values.
    last_generated_id: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        InMemoryDocumentStore::default()
    }

    pub fn stats(&self) -> CallStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = CallStats::default();
    }

    /// Cursors handed out by `find` and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Looks a document up by `_id` without recording a call.
    pub fn document(&self, collection: &str, id: &Value) -> Option<Document> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(&canonical_json(id)).cloned())
    }

    /// Every document of a collection in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Hands out the 24 hex digit ids the store assigns to documents
    /// inserted without one.
    fn generate_id(&self) -> Value {
        let n = self.last_generated_id.fetch_add(1, Ordering::SeqCst) + 1;
        Value::String(format!("{n:024x}"))
    }

    fn cursor(&self, results: Vec<Document>) -> Cursor<Document> {
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        let open = Arc::clone(&self.open_cursors);
        Cursor::from_items(results).on_close(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn record(&self, f: impl FnOnce(&mut CallStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// JSON text with object keys sorted, so equal ids map to equal text.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// `_id` of a filter of the form `{"_id": <plain value>}`.
fn exact_id(filter: &Document) -> Option<&Value> {
    if filter.len() != 1 {
        return None;
    }
    match filter.get(ID_FIELD)? {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => None,
        id => Some(id),
    }
}

fn first_match(collection: &Collection, filter: &Document) -> Result<Option<String>, GridError> {
    if let Some(id) = exact_id(filter) {
        let key = canonical_json(id);
        return Ok(collection.contains_key(&key).then_some(key));
    }
    for (key, document) in collection {
        if matches(document, filter)? {
            return Ok(Some(key.clone()));
        }
    }
    Ok(None)
}

fn all_matches(collection: &Collection, filter: &Document) -> Result<Vec<String>, GridError> {
    let mut keys = Vec::new();
    for (key, document) in collection {
        if matches(document, filter)? {
            keys.push(key.clone());
        }
    }
    Ok(keys)
}

/// Rejects field names an insert cannot carry.
fn validate_field_names(document: &Document) -> Result<(), GridError> {
    for (field, value) in document {
        if field.is_empty() || field.starts_with('$') || field.contains('\0') || field.contains('.') {
            return Err(GridError::InvalidOperation(format!(
                "field name '{field}' cannot be inserted"
            )));
        }
        if let Value::Object(inner) = value {
            validate_field_names(inner)?;
        }
    }
    Ok(())
}

fn with_leading_id(id: Value, document: Document) -> Document {
    let mut with_id = Document::new();
    with_id.insert(ID_FIELD.to_string(), id);
    with_id.extend(document);
    with_id
}

fn document_id(document: &Document) -> Result<String, GridError> {
    document
        .get(ID_FIELD)
        .map(canonical_json)
        .ok_or_else(|| GridError::InvalidOperation("document has no _id".to_string()))
}

impl DocumentClient for InMemoryDocumentStore {
    fn find_one(&self, collection: &str, filter: &Document, projection: &[String]) -> Result<Option<Document>, GridError> {
        self.record(|s| s.find_one += 1);
        let Some(documents) = self.collections.get(collection) else {
            return Ok(None);
        };
        Ok(first_match(&documents, filter)?
            .and_then(|key| documents.get(&key))
            .map(|document| project(document, projection)))
    }

    fn find(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Cursor<Document>, GridError> {
        self.record(|s| s.find += 1);
        let mut found: Vec<Document> = match self.collections.get(collection) {
            Some(documents) => all_matches(&documents, filter)?
                .iter()
                .filter_map(|key| documents.get(key).cloned())
                .collect(),
            None => Vec::new(),
        };
        sort_documents(&mut found, &options.order_by);
        let projection = options.projection.clone();
        let results: Vec<Document> = found
            .into_iter()
            .skip(options.skip.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|document| project(&document, &projection))
            .collect();
        Ok(self.cursor(results))
    }

    fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Cursor<Document>, GridError> {
        self.record(|s| s.aggregate += 1);
        let documents = self
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        Ok(self.cursor(run_pipeline(documents, pipeline)?))
    }

    fn count(&self, collection: &str, filter: &Document) -> Result<u64, GridError> {
        self.record(|s| s.count += 1);
        match self.collections.get(collection) {
            Some(documents) => Ok(all_matches(&documents, filter)?.len() as u64),
            None => Ok(0),
        }
    }

    fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<(), GridError> {
        self.record(|s| s.insert_many_sizes.push(documents.len()));
        let mut keyed = Vec::with_capacity(documents.len());
        for document in documents {
            validate_field_names(&document)?;
            keyed.push((document_id(&document)?, document));
        }

        let mut target = self.collections.entry(collection.to_string()).or_default();
        for (i, (key, _)) in keyed.iter().enumerate() {
            if target.contains_key(key) || keyed[..i].iter().any(|(other, _)| other == key) {
                return Err(GridError::TupleAlreadyExists {
                    table: collection.to_string(),
                    key: key.clone(),
                });
            }
        }
        for (key, document) in keyed {
            target.insert(key, document);
        }
        Ok(())
    }

    fn insert_one(&self, collection: &str, mut document: Document) -> Result<Value, GridError> {
        self.record(|s| s.insert_one += 1);
        validate_field_names(&document)?;
        let id = match document.get(ID_FIELD) {
            Some(id) => id.clone(),
            None => {
                let id = self.generate_id();
                document = with_leading_id(id.clone(), document);
                id
            }
        };
        let key = canonical_json(&id);
        let mut target = self.collections.entry(collection.to_string()).or_default();
        if target.contains_key(&key) {
            return Err(GridError::TupleAlreadyExists {
                table: collection.to_string(),
                key,
            });
        }
        target.insert(key, document);
        Ok(id)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, GridError> {
        self.record(|s| s.update_many += 1);
        let mut target = self.collections.entry(collection.to_string()).or_default();
        let keys = all_matches(&target, filter)?;
        if keys.is_empty() {
            drop(target);
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let mut created = upsert_seed(filter);
            apply_update(&mut created, update, true)?;
            if !created.contains_key(ID_FIELD) {
                created = with_leading_id(self.generate_id(), created);
            }
            let key = document_id(&created)?;
            self.collections
                .entry(collection.to_string())
                .or_default()
                .insert(key, created);
            return Ok(UpdateOutcome {
                matched: 0,
                upserted: true,
            });
        }
        // All or nothing: a failing update leaves every document unchanged.
        let mut updated = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(existing) = target.get(key) {
                let mut copy = existing.clone();
                apply_update(&mut copy, update, false)?;
                updated.push((key.clone(), copy));
            }
        }
        for (key, document) in updated {
            target.insert(key, document);
        }
        Ok(UpdateOutcome {
            matched: keys.len() as u64,
            upserted: false,
        })
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, GridError> {
        self.record(|s| s.update_one += 1);
        let mut target = self.collections.entry(collection.to_string()).or_default();
        if let Some(key) = first_match(&target, filter)? {
            if let Some(existing) = target.get_mut(&key) {
                let mut updated = existing.clone();
                apply_update(&mut updated, update, false)?;
                *existing = updated;
            }
            return Ok(UpdateOutcome {
                matched: 1,
                upserted: false,
            });
        }
        if !upsert {
            return Ok(UpdateOutcome::default());
        }
        let mut created = upsert_seed(filter);
        apply_update(&mut created, update, true)?;
        if !created.contains_key(ID_FIELD) {
            let id = filter.get(ID_FIELD).cloned().unwrap_or_else(|| self.generate_id());
            created = with_leading_id(id, created);
        }
        let key = document_id(&created)?;
        target.insert(key, created);
        Ok(UpdateOutcome {
            matched: 0,
            upserted: true,
        })
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: FindAndModify,
    ) -> Result<Option<Document>, GridError> {
        self.record(|s| s.find_one_and_update += 1);
        let mut target = self.collections.entry(collection.to_string()).or_default();
        if let Some(key) = first_match(&target, filter)? {
            let Some(existing) = target.get_mut(&key) else {
                return Ok(None);
            };
            let before = existing.clone();
            let mut updated = existing.clone();
            apply_update(&mut updated, update, false)?;
            *existing = updated.clone();
            return Ok(Some(if options.return_new { updated } else { before }));
        }
        if !options.upsert {
            return Ok(None);
        }
        let mut created = upsert_seed(filter);
        apply_update(&mut created, update, true)?;
        let key = document_id(&created)?;
        target.insert(key, created.clone());
        Ok(options.return_new.then_some(created))
    }

    fn delete_one(&self, collection: &str, filter: &Document) -> Result<u64, GridError> {
        self.record(|s| s.delete += 1);
        let Some(mut target) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        match first_match(&target, filter)? {
            Some(key) => Ok(target.shift_remove(&key).map_or(0, |_| 1)),
            None => Ok(0),
        }
    }

    fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64, GridError> {
        self.record(|s| s.delete += 1);
        let Some(mut target) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let keys = all_matches(&target, filter)?;
        for key in &keys {
            target.shift_remove(key);
        }
        Ok(keys.len() as u64)
    }
}
