//! Store key layout.
//!
//! | data | key |
//! |---|---|
//! | entity | `<table>:<id>` |
//! | association | `Associations:<table>:<id>:<role>` |
//! | id source | `Identifiers:<table>:<segment>` |
//! | key index | `__keys:<table>` |
//!
//! A single-column id is the value's text. A composite id is a JSON object
//! with its columns sorted by name, so equal keys always map to equal text.

use gridstore_core::{AssociationKey, Document, EntityKey, IdSourceKey, Value};

pub const ASSOCIATIONS_PREFIX: &str = "Associations";
pub const IDENTIFIERS_PREFIX: &str = "Identifiers";
pub const KEY_INDEX_PREFIX: &str = "__keys";

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Id text of the given key columns.
pub fn id_text<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut columns: Vec<(&str, &Value)> = columns.into_iter().collect();
    if let [(_, value)] = columns.as_slice() {
        return value_text(value);
    }
    columns.sort_by(|a, b| a.0.cmp(b.0));
    let object: Document = columns
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    Value::Object(object).to_string()
}

pub fn entity_key(key: &EntityKey) -> String {
    indexed_entity_key(key.table(), &id_text(key.columns()))
}

/// Entity key of an id read back from the key index.
pub fn indexed_entity_key(table: &str, id: &str) -> String {
    format!("{table}:{id}")
}

pub fn association_key(key: &AssociationKey) -> String {
    format!(
        "{ASSOCIATIONS_PREFIX}:{}:{}:{}",
        key.table(),
        id_text(key.columns()),
        key.collection_role()
    )
}

pub fn identifier_key(key: &IdSourceKey) -> String {
    format!("{IDENTIFIERS_PREFIX}:{}:{}", key.table(), key.segment())
}

pub fn key_index(table: &str) -> String {
    format!("{KEY_INDEX_PREFIX}:{table}")
}
