//! The key-value dialect over a file-backed SQLite store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use gridstore_core::{
    Association, AssociationContext, AssociationKey, AssociationKeyMetadata, AssociationStore,
    AssociationTypeContext, EntityKey, EntityKeyMetadata, EntityOptions, GridConfig, IdSourceKey,
    IdSourceKeyMetadata, NextValueRequest, Row, RowKey, SequenceGenerator, TupleContext, TupleStore,
    TupleTypeContext,
};
use gridstore_kv::{KeyValueClient, KeyValueDialect, SqliteKeyValueStore};

fn person_key(id: i64) -> EntityKey {
    EntityKey::new(Arc::new(EntityKeyMetadata::new("Person", ["id"])), vec![json!(id)]).unwrap()
}

fn open(path: &str) -> KeyValueDialect<SqliteKeyValueStore> {
    KeyValueDialect::new(Arc::new(SqliteKeyValueStore::new(path).unwrap()), GridConfig::default())
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.db");
    let path = path.to_str().unwrap();

    let type_context = TupleTypeContext::default();
    let metadata = AssociationKeyMetadata::builder("Person_phones", "phones")
        .column_names(["person_id"])
        .row_key_column_names(["person_id", "phones"])
        .build();
    let phones = AssociationKey::new(metadata, vec![json!(1)], person_key(1)).unwrap();
    let request = NextValueRequest::new(
        IdSourceKey::for_sequence(IdSourceKeyMetadata::sequence("person_seq")),
        1,
        1,
    );

    {
        let dialect = open(path);
        let context = TupleContext::new(&type_context);
        let mut tuple = dialect.create_tuple(&person_key(1), &context);
        tuple.put("name", json!("Ada"));
        tuple.put("address.city", json!("London"));
        dialect.insert_or_update_tuple(&person_key(1), &mut tuple, &context).unwrap();

        let mut association = Association::empty();
        let mut row = Row::new();
        row.insert("person_id".to_string(), json!(1));
        row.insert("phones".to_string(), json!("555-1"));
        association.put(
            RowKey::new(["person_id", "phones"], vec![json!(1), json!("555-1")]).unwrap(),
            row,
        );
        let mut association_context = AssociationContext::new(AssociationTypeContext::default());
        dialect
            .insert_or_update_association(&phones, &mut association, &mut association_context)
            .unwrap();

        assert_eq!(dialect.next_value(&request).unwrap(), 1);
        assert_eq!(dialect.next_value(&request).unwrap(), 2);
    }

    let dialect = open(path);
    let tuple = dialect
        .get_tuple(&person_key(1), &TupleContext::new(&type_context))
        .unwrap()
        .unwrap();
    assert_eq!(tuple.get("name"), Some(&json!("Ada")));
    assert_eq!(tuple.get("address.city"), Some(&json!("London")));

    let mut association_context = AssociationContext::new(AssociationTypeContext::default());
    let association = dialect
        .get_association(&phones, &mut association_context)
        .unwrap()
        .unwrap();
    assert_eq!(association.len(), 1);
    assert_eq!(dialect.next_value(&request).unwrap(), 3);
}

#[test]
fn test_expired_rows_read_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ttl.db");
    let dialect = open(path.to_str().unwrap());

    let ephemeral = TupleTypeContext::default().with_options(EntityOptions {
        ttl: Some(Duration::ZERO),
    });
    let context = TupleContext::new(&ephemeral);
    let mut tuple = dialect.create_tuple(&person_key(7), &context);
    tuple.put("name", json!("Grace"));
    dialect.insert_or_update_tuple(&person_key(7), &mut tuple, &context).unwrap();

    assert!(dialect.get_tuple(&person_key(7), &context).unwrap().is_none());
    assert_eq!(dialect.client().purge_expired().unwrap(), 1);
    assert!(dialect.client().get("__keys:Person").unwrap().is_some());
}
