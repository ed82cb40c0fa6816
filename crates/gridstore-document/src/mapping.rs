//! Translation between the tuple/association model and documents.
//!
//! Everything here is a pure function of keys, tuples and associations, so
//! the write paths of the dialect can be tested without a store.

use std::collections::HashSet;

use gridstore_core::value::{flatten, get_path, remove_path, set_path, PATH_SEPARATOR};
use gridstore_core::{
    Association, AssociationKey, AssociationKeyMetadata, AssociationStorageStrategy, AssociationType, Document,
    EntityKey, EntityKeyMetadata, GridError, MapStorageType, Row, RowKey, SnapshotKind, Tuple, TupleOperationKind,
    TupleSnapshot, Value,
};
use indexmap::IndexMap;

pub const ID_FIELD: &str = "_id";
pub const ROWS_FIELD: &str = "rows";
pub const TABLE_FIELD: &str = "table";

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

fn short_name(column: &str) -> &str {
    column
        .split_once(PATH_SEPARATOR)
        .map_or(column, |(_, rest)| rest)
}

/// `_id` value of a key: the bare value for a single column, otherwise an
/// object keyed by the column names without their first path segment.
pub fn id_value(column_names: &[String], column_values: &[Value]) -> Value {
    if column_names.len() == 1 {
        return column_values[0].clone();
    }
    let mut id = Document::new();
    for (name, value) in column_names.iter().zip(column_values) {
        id.insert(short_name(name).to_string(), value.clone());
    }
    Value::Object(id)
}

pub fn entity_id(key: &EntityKey) -> Value {
    id_value(key.column_names(), key.column_values())
}

/// `{"_id": id}`
pub fn id_filter(id: Value) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), id);
    filter
}

/// Recovers the key columns of an entity from its `_id` value.
pub fn key_columns_from_id(metadata: &EntityKeyMetadata, id: &Value) -> Vec<(String, Value)> {
    let names = metadata.column_names();
    if names.len() == 1 {
        return vec![(names[0].clone(), id.clone())];
    }
    names
        .iter()
        .map(|name| {
            let value = id.get(short_name(name)).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect()
}

/// Columns shared prefix (`id.` in `id.author`, `id.title`), if every column has it.
fn shared_prefix(names: &[String]) -> Option<&str> {
    let (first, _) = names.first()?.split_once(PATH_SEPARATOR)?;
    names
        .iter()
        .all(|name| matches!(name.split_once(PATH_SEPARATOR), Some((head, _)) if head == first))
        .then_some(first)
}

/// `_id` of a separate association document. In the shared collection it
/// also carries the association table so roles of different types don't
/// collide.
pub fn association_id(key: &AssociationKey, strategy: AssociationStorageStrategy) -> Value {
    let prefix_len = shared_prefix(key.column_names()).map_or(0, |p| p.len() + 1);
    let mut id = Document::new();
    for (name, value) in key.columns() {
        set_path(&mut id, &name[prefix_len..], value.clone());
    }
    if strategy == AssociationStorageStrategy::GlobalCollection {
        id.insert(TABLE_FIELD.to_string(), Value::String(key.table().to_string()));
    }
    Value::Object(id)
}

// ---------------------------------------------------------------------------
// Tuples
// ---------------------------------------------------------------------------

/// Whether a column is carried by `_id` instead of a regular field.
pub fn is_id_column(metadata: &EntityKeyMetadata, column: &str) -> bool {
    column == ID_FIELD
        || column.ends_with(&format!("{PATH_SEPARATOR}{ID_FIELD}"))
        || metadata.is_key_column(column)
}

/// Builds a tuple from a stored document. With metadata, the key columns
/// are recovered from `_id`; without it the document is flattened as is.
///
/// Nested objects always come back as dotted columns, since embedded
/// values are written that way. A column whose value was itself an object
/// therefore reads back as one column per leaf (`meta = {"a": 1}` becomes
/// `meta.a = 1`). Arrays are leaves and keep their elements intact.
pub fn tuple_from_document(mut document: Document, metadata: Option<&EntityKeyMetadata>) -> Tuple {
    let mut columns: IndexMap<String, Value> = IndexMap::new();
    if let Some(metadata) = metadata {
        if let Some(id) = document.shift_remove(ID_FIELD) {
            columns.extend(key_columns_from_id(metadata, &id));
        }
    }
    columns.extend(flatten(&document));
    Tuple::new(TupleSnapshot::new(columns, SnapshotKind::Update))
}

/// A tuple holding only the key columns.
pub fn key_only_tuple(key: &EntityKey, kind: SnapshotKind) -> Tuple {
    let columns = key
        .columns()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    Tuple::new(TupleSnapshot::new(columns, kind))
}

/// Whether a column name can travel through a multi-document insert.
pub fn is_batch_safe_column(column: &str) -> bool {
    !column.contains('\0')
        && column
            .split(PATH_SEPARATOR)
            .all(|segment| !segment.is_empty() && !segment.starts_with('$'))
}

pub fn is_batch_safe(tuple: &Tuple) -> bool {
    tuple
        .column_names()
        .iter()
        .chain(tuple.operations().iter().map(|op| &op.column))
        .all(|column| is_batch_safe_column(column))
}

/// Full document of a tuple to be inserted: `_id` plus every current
/// non-key column.
pub fn document_for_insert(tuple: &Tuple, key: &EntityKey) -> Document {
    let mut document = id_filter(entity_id(key));
    for column in tuple.column_names() {
        if is_id_column(key.metadata(), &column) {
            continue;
        }
        if let Some(value) = tuple.get(&column) {
            if !value.is_null() {
                set_path(&mut document, &column, value.clone());
            }
        }
    }
    document
}

/// Replays the pending operations of `tuple` onto a document.
pub fn apply_operations_to_document(tuple: &Tuple, key: &EntityKey, document: &mut Document) {
    for op in tuple.operations() {
        if is_id_column(key.metadata(), &op.column) {
            continue;
        }
        match &op.kind {
            TupleOperationKind::Put(value) => set_path(document, &op.column, value.clone()),
            TupleOperationKind::PutNull | TupleOperationKind::Remove => {
                remove_path(document, &op.column);
            }
        }
    }
}

/// `$set` of every top-level field of `document` except `_id`. An empty
/// result upserts a key-only document.
pub fn set_update(document: &Document) -> Document {
    let fields: Document = document
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();
    let mut update = Document::new();
    if !fields.is_empty() {
        update.insert("$set".to_string(), Value::Object(fields));
    }
    update
}

/// Update operators for the pending operations of an existing entity.
///
/// Removing the last non-null column of an embedded object unsets the
/// outermost such object instead of leaving an empty shell behind.
pub fn update_for_operations(tuple: &Tuple, key: &EntityKey) -> Document {
    let mut set = Document::new();
    let mut unset = Document::new();
    let mut null_embeddables: HashSet<String> = HashSet::new();
    for op in tuple.operations() {
        if is_id_column(key.metadata(), &op.column) {
            continue;
        }
        match &op.kind {
            TupleOperationKind::Put(value) => {
                unset.shift_remove(&op.column);
                set.insert(op.column.clone(), value.clone());
            }
            TupleOperationKind::PutNull | TupleOperationKind::Remove => {
                set.shift_remove(&op.column);
                match outermost_null_embeddable(tuple, &op.column) {
                    Some(embeddable) => {
                        if null_embeddables.insert(embeddable.clone()) {
                            let nested = format!("{embeddable}{PATH_SEPARATOR}");
                            let shadowed: Vec<String> =
                                set.keys().filter(|field| field.starts_with(&nested)).cloned().collect();
                            for field in shadowed {
                                set.shift_remove(&field);
                            }
                            unset.insert(embeddable, Value::from(1));
                        }
                    }
                    None => {
                        unset.insert(op.column.clone(), Value::from(1));
                    }
                }
            }
        }
    }
    let mut update = Document::new();
    if !set.is_empty() {
        update.insert("$set".to_string(), Value::Object(set));
    }
    if !unset.is_empty() {
        update.insert("$unset".to_string(), Value::Object(unset));
    }
    update
}

/// Outermost embedded object on the path of `column` whose columns are all
/// null or removed.
fn outermost_null_embeddable(tuple: &Tuple, column: &str) -> Option<String> {
    let names = tuple.column_names();
    let mut prefix = String::new();
    let segments: Vec<&str> = column.split(PATH_SEPARATOR).collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push(PATH_SEPARATOR);
        }
        prefix.push_str(segment);
        let nested = format!("{prefix}{PATH_SEPARATOR}");
        let all_null = names
            .iter()
            .filter(|name| name.starts_with(&nested))
            .all(|name| tuple.get(name).map_or(true, Value::is_null));
        if all_null {
            return Some(prefix);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

/// Stored form of one row: the bare value when a single non-key column is
/// left, otherwise an object of the non-key columns.
fn row_value(row: &Row, metadata: &AssociationKeyMetadata) -> Value {
    let columns: Vec<&String> = row.keys().filter(|c| !metadata.is_key_column(c)).collect();
    if let [single] = columns.as_slice() {
        return row.get(single.as_str()).cloned().unwrap_or(Value::Null);
    }
    let mut object = Document::new();
    for column in columns {
        if let Some(value) = row.get(column.as_str()) {
            if !value.is_null() {
                set_path(&mut object, column, value.clone());
            }
        }
    }
    Value::Object(object)
}

/// Stored form of all rows. One-to-one associations store their single
/// element rather than an array; string-keyed maps an object keyed by the
/// map key unless `map_storage` asks for a list.
pub fn association_rows(association: &Association, key: &AssociationKey, map_storage: MapStorageType) -> Value {
    let metadata = key.metadata();
    let rows = association.rows();
    if let Some(index) = map_index_column(metadata) {
        let string_keyed = rows
            .values()
            .all(|row| matches!(row.get(index), Some(Value::String(_))));
        if map_storage == MapStorageType::AsDocument && string_keyed {
            return map_rows(&rows, metadata, index);
        }
    }
    let rows: Vec<Value> = rows.values().map(|row| row_value(row, metadata)).collect();
    if metadata.association_type() == AssociationType::OneToOne {
        rows.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(rows)
    }
}

/// The map key column of a map association, if it has exactly one.
fn map_index_column(metadata: &AssociationKeyMetadata) -> Option<&str> {
    match metadata.row_key_index_column_names() {
        [index] if metadata.association_type() == AssociationType::Map => Some(index.as_str()),
        _ => None,
    }
}

/// Column a map stores as a bare value: the single column linking a row
/// to the associated entity.
fn map_value_column(metadata: &AssociationKeyMetadata) -> Option<&str> {
    match metadata.associated_entity()?.association_key_columns() {
        [column] => Some(column.as_str()),
        _ => None,
    }
}

/// `{"home": 10, "work": {"street": "..."}}`: one entry per row, the map
/// key removed from the stored value.
fn map_rows(rows: &IndexMap<RowKey, Row>, metadata: &AssociationKeyMetadata, index: &str) -> Value {
    let bare = map_value_column(metadata);
    let mut object = Document::new();
    for row in rows.values() {
        let Some(Value::String(map_key)) = row.get(index) else {
            continue;
        };
        let columns: Vec<(&String, &Value)> = row
            .iter()
            .filter(|(column, value)| column.as_str() != index && !metadata.is_key_column(column) && !value.is_null())
            .collect();
        let stored = match columns.as_slice() {
            [(column, value)] if bare == Some(column.as_str()) => (*value).clone(),
            _ => {
                let mut element = Document::new();
                for (column, value) in columns {
                    set_path(&mut element, column, value.clone());
                }
                Value::Object(element)
            }
        };
        object.insert(map_key.clone(), stored);
    }
    Value::Object(object)
}

fn bare_column(metadata: &AssociationKeyMetadata) -> Option<&str> {
    metadata.single_row_key_column_not_in_association_key().or_else(|| {
        metadata
            .row_key_column_names()
            .iter()
            .find(|c| !metadata.is_key_column(c))
            .map(String::as_str)
    })
}

/// Rebuilds an association from its stored rows.
pub fn association_from_value(value: &Value, key: &AssociationKey) -> Result<Association, GridError> {
    let metadata = key.metadata();
    let mut rows: IndexMap<RowKey, Row> = IndexMap::new();

    if let (Some(index), Value::Object(entries)) = (map_index_column(metadata), value) {
        for (map_key, element) in entries {
            let mut row = owner_columns(key);
            row.insert(index.to_string(), Value::String(map_key.clone()));
            match element {
                Value::Object(object) => row.extend(flatten(object)),
                bare => {
                    let column = map_value_column(metadata).ok_or_else(|| no_bare_column(metadata))?;
                    row.insert(column.to_string(), bare.clone());
                }
            }
            let (row_key, row) = keyed_row(metadata, row)?;
            rows.insert(row_key, row);
        }
        return Ok(Association::new(rows));
    }

    let elements: Vec<&Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    for element in elements {
        let mut row = owner_columns(key);
        match element {
            Value::Object(object) => row.extend(flatten(object)),
            bare => {
                let column = bare_column(metadata).ok_or_else(|| no_bare_column(metadata))?;
                row.insert(column.to_string(), bare.clone());
            }
        }
        let (row_key, row) = keyed_row(metadata, row)?;
        rows.insert(row_key, row);
    }
    Ok(Association::new(rows))
}

fn owner_columns(key: &AssociationKey) -> Row {
    key.columns()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn keyed_row(metadata: &AssociationKeyMetadata, row: Row) -> Result<(RowKey, Row), GridError> {
    let values = metadata
        .row_key_column_names()
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    let row_key = RowKey::new(metadata.row_key_column_names().iter().cloned(), values)?;
    Ok((row_key, row))
}

fn no_bare_column(metadata: &AssociationKeyMetadata) -> GridError {
    GridError::InvalidOperation(format!(
        "association '{}' has no row column to hold a bare value",
        metadata.collection_role()
    ))
}

/// Value of an embedded association inside its owner document.
pub fn embedded_rows<'a>(owner: &'a Document, key: &AssociationKey) -> Option<&'a Value> {
    get_path(owner, key.collection_role())
}
