//! Integration tests for the document dialect against the in-memory store.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use gridstore_core::{
    AssociatedEntityKeyMetadata, Association, AssociationContext, AssociationDocumentStorageType, AssociationKey,
    AssociationKeyMetadata, AssociationKind, AssociationOptions, AssociationStorageType, AssociationStore,
    AssociationType, AssociationTypeContext, BulkScanner, Document, EntityKey, EntityKeyMetadata, GridConfig,
    GridDialect, GridError, IdSourceKey, IdSourceKeyMetadata, IdentityColumnStore, MapStorageType,
    NativeQueryExecutor, NextValueRequest, Operation, OperationsQueue, OptimisticLockingStore, Row, RowKey,
    SequenceGenerator, SnapshotKind, Tuple, TupleContext, TupleSnapshot, TupleStore, TupleTypeContext, Value,
};
use gridstore_document::{DocumentClient, DocumentDialect, DocumentQuery, InMemoryDocumentStore, WriteOptions};

fn setup() -> (Arc<InMemoryDocumentStore>, DocumentDialect<InMemoryDocumentStore>) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let dialect = DocumentDialect::new(Arc::clone(&store), GridConfig::default());
    (store, dialect)
}

fn person_metadata() -> Arc<EntityKeyMetadata> {
    Arc::new(EntityKeyMetadata::new("Person", ["id"]))
}

fn person_key(id: i64) -> EntityKey {
    EntityKey::new(person_metadata(), vec![json!(id)]).unwrap()
}

fn all_columns() -> TupleTypeContext {
    TupleTypeContext::new(Vec::<String>::new())
}

fn doc(value: Value) -> Document {
    match value {
        Value::Object(document) => document,
        other => panic!("not an object: {other}"),
    }
}

fn insert_person(dialect: &DocumentDialect<InMemoryDocumentStore>, id: i64, name: &str, age: i64) {
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(id);
    let mut tuple = dialect.create_tuple(&key, &context);
    tuple.put("name", json!(name));
    tuple.put("age", json!(age));
    dialect.insert_or_update_tuple(&key, &mut tuple, &context).unwrap();
}

fn addresses_key(owner: i64) -> AssociationKey {
    let metadata = AssociationKeyMetadata::builder("Person_Address", "addresses")
        .column_names(["person_id"])
        .row_key_column_names(["person_id", "address_id"])
        .build();
    AssociationKey::new(metadata, vec![json!(owner)], person_key(owner)).unwrap()
}

fn address_row(owner: i64, address: i64) -> (RowKey, Row) {
    let key = RowKey::new(["person_id", "address_id"], vec![json!(owner), json!(address)]).unwrap();
    let mut row = Row::new();
    row.insert("person_id".to_string(), json!(owner));
    row.insert("address_id".to_string(), json!(address));
    (key, row)
}

fn options_for(strategy: &str) -> AssociationOptions {
    let options = AssociationOptions::default();
    match strategy {
        "embedded" => options.with_storage(AssociationStorageType::InEntity),
        "per_type" => options
            .with_storage(AssociationStorageType::AssociationDocument)
            .with_document_storage(AssociationDocumentStorageType::CollectionPerAssociation),
        _ => options
            .with_storage(AssociationStorageType::AssociationDocument)
            .with_document_storage(AssociationDocumentStorageType::GlobalCollection),
    }
}

fn write_addresses(
    dialect: &DocumentDialect<InMemoryDocumentStore>,
    owner: i64,
    addresses: &[i64],
    options: AssociationOptions,
) {
    let key = addresses_key(owner);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options));
    let mut association = dialect.create_association(&key, &mut context).unwrap();
    for address in addresses {
        let (row_key, row) = address_row(owner, *address);
        association.put(row_key, row);
    }
    dialect
        .insert_or_update_association(&key, &mut association, &mut context)
        .unwrap();
    assert!(!association.has_pending_operations());
}

fn read_addresses(
    dialect: &DocumentDialect<InMemoryDocumentStore>,
    owner: i64,
    options: AssociationOptions,
) -> Option<Association> {
    let key = addresses_key(owner);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options));
    dialect.get_association(&key, &mut context).unwrap()
}

// ---------------------------------------------------------------------------
// Tuples
// ---------------------------------------------------------------------------

#[test]
fn test_insert_then_read_back() {
    let (store, dialect) = setup();
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(1);

    let mut tuple = dialect.create_tuple(&key, &context);
    assert_eq!(tuple.kind(), SnapshotKind::Insert);
    tuple.put("name", json!("Ada"));
    tuple.put("address.city", json!("London"));
    dialect.insert_or_update_tuple(&key, &mut tuple, &context).unwrap();
    assert_eq!(tuple.kind(), SnapshotKind::Update);

    let stored = store.document("Person", &json!(1)).unwrap();
    assert_eq!(
        Value::Object(stored),
        json!({"_id": 1, "name": "Ada", "address": {"city": "London"}})
    );

    let loaded = dialect.get_tuple(&key, &context).unwrap().unwrap();
    assert_eq!(loaded.kind(), SnapshotKind::Update);
    assert_eq!(loaded.get("id"), Some(&json!(1)));
    assert_eq!(loaded.get("name"), Some(&json!("Ada")));
    assert_eq!(loaded.get("address.city"), Some(&json!("London")));
}

#[test]
fn test_update_unsets_emptied_embeddable() {
    let (store, dialect) = setup();
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(1);

    let mut tuple = dialect.create_tuple(&key, &context);
    tuple.put("name", json!("Ada"));
    tuple.put("address.city", json!("London"));
    dialect.insert_or_update_tuple(&key, &mut tuple, &context).unwrap();

    let mut loaded = dialect.get_tuple(&key, &context).unwrap().unwrap();
    loaded.put("name", json!("Grace"));
    loaded.remove("address.city");
    dialect.insert_or_update_tuple(&key, &mut loaded, &context).unwrap();

    let stored = store.document("Person", &json!(1)).unwrap();
    assert_eq!(Value::Object(stored), json!({"_id": 1, "name": "Grace"}));
}

#[test]
fn test_remove_tuple() {
    let (_, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);

    dialect.remove_tuple(&person_key(1), &context).unwrap();
    assert!(dialect.get_tuple(&person_key(1), &context).unwrap().is_none());
    // Removing twice is not an error.
    dialect.remove_tuple(&person_key(1), &context).unwrap();
}

#[test]
fn test_get_tuple_projects_selectable_columns() {
    let (_, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    let type_context = TupleTypeContext::new(["name"]);
    let context = TupleContext::new(&type_context);

    let tuple = dialect.get_tuple(&person_key(1), &context).unwrap().unwrap();
    assert_eq!(tuple.get("name"), Some(&json!("Ada")));
    assert_eq!(tuple.get("age"), None);
}

#[test]
fn test_get_tuple_sees_queued_insert() {
    let (_, dialect) = setup();
    let type_context = all_columns();
    let mut queue = OperationsQueue::new();
    let mut pending = Tuple::for_insert();
    pending.put("name", json!("Ada"));
    queue
        .add(Operation::insert_or_update_tuple(person_key(7), pending, type_context.clone()))
        .unwrap();

    let context = TupleContext::new(&type_context).with_queue(&queue);
    let tuple = dialect.get_tuple(&person_key(7), &context).unwrap().unwrap();
    assert_eq!(tuple.kind(), SnapshotKind::Insert);
    assert_eq!(tuple.get("id"), Some(&json!(7)));

    let without_queue = TupleContext::new(&type_context);
    assert!(dialect.get_tuple(&person_key(7), &without_queue).unwrap().is_none());
}

#[test]
fn test_get_tuples_keeps_key_order() {
    let (store, dialect) = setup();
    for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Barbara")] {
        insert_person(&dialect, id, name, 40);
    }
    store.reset_stats();

    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let keys = [person_key(3), person_key(9), person_key(1)];
    let tuples = dialect.get_tuples(&keys, &context).unwrap();

    assert_eq!(tuples.len(), 3);
    assert_eq!(tuples[0].as_ref().unwrap().get("name"), Some(&json!("Barbara")));
    assert!(tuples[1].is_none());
    assert_eq!(tuples[2].as_ref().unwrap().get("name"), Some(&json!("Ada")));
    assert_eq!(store.stats().find, 1);
    assert_eq!(store.open_cursors(), 0);

    assert!(dialect.get_tuples(&[], &context).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

#[test]
fn test_association_locations_per_strategy() {
    let (store, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);

    write_addresses(&dialect, 1, &[10, 11], options_for("embedded"));
    let owner = store.document("Person", &json!(1)).unwrap();
    assert_eq!(owner.get("addresses"), Some(&json!([10, 11])));

    write_addresses(&dialect, 1, &[20], options_for("per_type"));
    let per_type = store.documents("associations_Person_Address");
    assert_eq!(per_type.len(), 1);
    assert_eq!(
        Value::Object(per_type[0].clone()),
        json!({"_id": {"person_id": 1}, "rows": [20]})
    );

    write_addresses(&dialect, 1, &[30, 31, 32], options_for("global"));
    let global = store.documents("Associations");
    assert_eq!(global.len(), 1);
    assert_eq!(
        Value::Object(global[0].clone()),
        json!({"_id": {"person_id": 1, "table": "Person_Address"}, "rows": [30, 31, 32]})
    );
}

#[test]
fn test_association_rows_stay_with_their_owner() {
    for strategy in ["embedded", "per_type", "global"] {
        let (_, dialect) = setup();
        insert_person(&dialect, 1, "Ada", 36);
        insert_person(&dialect, 2, "Grace", 45);
        write_addresses(&dialect, 1, &[10, 11], options_for(strategy));
        write_addresses(&dialect, 2, &[20], options_for(strategy));

        let first = read_addresses(&dialect, 1, options_for(strategy)).unwrap();
        assert_eq!(first.len(), 2, "strategy {strategy}");
        assert!(first.contains(&address_row(1, 10).0));
        assert!(first.contains(&address_row(1, 11).0));
        assert!(!first.contains(&address_row(2, 20).0));

        let second = read_addresses(&dialect, 2, options_for(strategy)).unwrap();
        assert_eq!(second.len(), 1, "strategy {strategy}");
        assert_eq!(second.get(&address_row(2, 20).0), Some(address_row(2, 20).1));
    }
}

#[test]
fn test_missing_association_reads_as_none() {
    let (_, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    for strategy in ["embedded", "per_type", "global"] {
        assert!(read_addresses(&dialect, 1, options_for(strategy)).is_none());
    }
}

#[test]
fn test_remove_association() {
    for strategy in ["embedded", "per_type", "global"] {
        let (store, dialect) = setup();
        insert_person(&dialect, 1, "Ada", 36);
        write_addresses(&dialect, 1, &[10], options_for(strategy));

        let key = addresses_key(1);
        let mut context = AssociationContext::new(AssociationTypeContext::new(options_for(strategy)));
        dialect.remove_association(&key, &mut context).unwrap();
        assert!(read_addresses(&dialect, 1, options_for(strategy)).is_none(), "strategy {strategy}");
        // The owner survives.
        assert!(store.document("Person", &json!(1)).is_some());
    }
}

#[test]
fn test_embedded_association_read_from_entity_tuple() {
    let (store, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    write_addresses(&dialect, 1, &[10, 11], options_for("embedded"));

    let type_context = all_columns();
    let mut owner = dialect
        .get_tuple(&person_key(1), &TupleContext::new(&type_context))
        .unwrap()
        .unwrap();
    store.reset_stats();

    let key = addresses_key(1);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options_for("embedded")))
        .with_entity_tuple(&mut owner);
    let association = dialect.get_association(&key, &mut context).unwrap().unwrap();
    assert_eq!(association.len(), 2);
    assert_eq!(store.stats().find_one, 0);
}

#[test]
fn test_embedded_write_refreshes_entity_tuple() {
    let (_, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    let type_context = all_columns();
    let mut owner = dialect
        .get_tuple(&person_key(1), &TupleContext::new(&type_context))
        .unwrap()
        .unwrap();

    let key = addresses_key(1);
    let mut association = Association::empty();
    let (row_key, row) = address_row(1, 10);
    association.put(row_key, row);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options_for("embedded")))
        .with_entity_tuple(&mut owner);
    dialect
        .insert_or_update_association(&key, &mut association, &mut context)
        .unwrap();

    assert_eq!(owner.get("addresses"), Some(&json!([10])));
    assert!(!owner.has_pending_operations());
}

#[test]
fn test_embedded_collection_always_stays_in_owner() {
    let (_, dialect) = setup();
    let metadata = AssociationKeyMetadata::builder("Person_nicknames", "nicknames")
        .column_names(["Person_id"])
        .row_key_column_names(["Person_id", "nicknames"])
        .kind(AssociationKind::EmbeddedCollection)
        .build();
    assert!(dialect.is_stored_in_entity_structure(&metadata, &AssociationTypeContext::new(options_for("global"))));

    let plain = addresses_key(1).metadata().clone();
    assert!(!dialect.is_stored_in_entity_structure(&plain, &AssociationTypeContext::new(options_for("global"))));
    assert!(dialect.is_stored_in_entity_structure(&plain, &AssociationTypeContext::new(options_for("embedded"))));
}

#[test]
fn test_get_association_flushes_queue_first() {
    let (store, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);

    let options = options_for("global");
    let mut queue = OperationsQueue::new();
    let mut association = Association::empty();
    let (row_key, row) = address_row(1, 10);
    association.put(row_key, row);
    queue
        .add(Operation::insert_or_update_association(
            addresses_key(1),
            association,
            AssociationTypeContext::new(options),
        ))
        .unwrap();

    let key = addresses_key(1);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options)).with_queue(&mut queue);
    let found = dialect.get_association(&key, &mut context).unwrap().unwrap();
    assert_eq!(found.len(), 1);
    assert!(queue.is_closed());
    assert_eq!(store.documents("Associations").len(), 1);
}

#[test]
fn test_embedded_association_of_queued_owner_is_empty() {
    let (store, dialect) = setup();
    let type_context = all_columns();
    let mut queue = OperationsQueue::new();
    queue
        .add(Operation::insert_or_update_tuple(person_key(5), Tuple::for_insert(), type_context))
        .unwrap();

    let key = addresses_key(5);
    let mut context =
        AssociationContext::new(AssociationTypeContext::new(options_for("embedded"))).with_queue(&mut queue);
    let found = dialect.get_association(&key, &mut context).unwrap().unwrap();
    assert!(found.is_empty());
    // Nothing was flushed.
    assert!(!queue.is_closed());
    assert_eq!(store.stats().writes(), 0);
}

#[test]
fn test_embedded_association_of_owner_with_queued_update_is_read() {
    let (store, dialect) = setup();
    insert_person(&dialect, 1, "Ada", 36);
    write_addresses(&dialect, 1, &[10, 20], options_for("embedded"));

    let type_context = all_columns();
    let mut owner = dialect
        .get_tuple(&person_key(1), &TupleContext::new(&type_context))
        .unwrap()
        .unwrap();
    owner.put("name", json!("Grace"));
    let mut queue = OperationsQueue::new();
    queue
        .add(Operation::insert_or_update_tuple(person_key(1), owner, type_context))
        .unwrap();

    let key = addresses_key(1);
    let mut context =
        AssociationContext::new(AssociationTypeContext::new(options_for("embedded"))).with_queue(&mut queue);
    let found = dialect.get_association(&key, &mut context).unwrap().unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&address_row(1, 10).0));
    assert!(found.contains(&address_row(1, 20).0));

    // The queued update was flushed before reading.
    assert!(queue.is_closed());
    let stored = store.document("Person", &json!(1)).unwrap();
    assert_eq!(stored.get("name"), Some(&json!("Grace")));
    assert_eq!(stored.get("addresses"), Some(&json!([10, 20])));
}

fn phones_key(owner: i64) -> AssociationKey {
    let metadata = AssociationKeyMetadata::builder("Person_phones", "phones")
        .column_names(["person_id"])
        .row_key_column_names(["person_id", "phone_type"])
        .row_key_index_column_names(["phone_type"])
        .association_type(AssociationType::Map)
        .associated_entity(AssociatedEntityKeyMetadata::new(
            ["phone_id"],
            Arc::new(EntityKeyMetadata::new("Phone", ["id"])),
        ))
        .build();
    AssociationKey::new(metadata, vec![json!(owner)], person_key(owner)).unwrap()
}

fn write_phones(dialect: &DocumentDialect<InMemoryDocumentStore>, options: AssociationOptions) -> Association {
    let key = phones_key(1);
    let mut context = AssociationContext::new(AssociationTypeContext::new(options));
    let mut association = dialect.create_association(&key, &mut context).unwrap();
    for (kind, phone) in [("home", 10), ("work", 11)] {
        let row_key = RowKey::new(["person_id", "phone_type"], vec![json!(1), json!(kind)]).unwrap();
        let mut row = Row::new();
        row.insert("person_id".to_string(), json!(1));
        row.insert("phone_type".to_string(), json!(kind));
        row.insert("phone_id".to_string(), json!(phone));
        association.put(row_key, row);
    }
    dialect
        .insert_or_update_association(&key, &mut association, &mut context)
        .unwrap();
    association
}

#[test]
fn test_map_association_stored_by_map_key() {
    let (store, dialect) = setup();
    let options = options_for("embedded");
    let written = write_phones(&dialect, options.clone());

    let owner = store.document("Person", &json!(1)).unwrap();
    assert_eq!(owner.get("phones"), Some(&json!({"home": 10, "work": 11})));

    let mut context = AssociationContext::new(AssociationTypeContext::new(options));
    let read = dialect.get_association(&phones_key(1), &mut context).unwrap().unwrap();
    assert_eq!(read.rows(), written.rows());
}

#[test]
fn test_map_association_stored_as_list_when_configured() {
    let (store, dialect) = setup();
    let options = options_for("per_type").with_map_storage(MapStorageType::AsList);
    let written = write_phones(&dialect, options.clone());

    let documents = store.documents("associations_Person_phones");
    assert_eq!(documents.len(), 1);
    assert_eq!(
        documents[0].get("rows"),
        Some(&json!([{"phone_type": "home", "phone_id": 10}, {"phone_type": "work", "phone_id": 11}]))
    );

    let mut context = AssociationContext::new(AssociationTypeContext::new(options));
    let read = dialect.get_association(&phones_key(1), &mut context).unwrap().unwrap();
    assert_eq!(read.rows(), written.rows());
}

fn row_ids(association: Option<Association>) -> BTreeSet<i64> {
    association
        .map(|association| {
            association
                .keys()
                .iter()
                .filter_map(|key| key.get("address_id").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

proptest! {
    #[test]
    fn removed_rows_stay_removed(
        strategy in prop::sample::select(vec!["embedded", "per_type", "global"]),
        initial in prop::collection::btree_set(0i64..20, 1..10),
        removed in prop::collection::btree_set(0i64..20, 0..10),
        added in prop::collection::btree_set(20i64..30, 0..4),
        clear in any::<bool>(),
    ) {
        let (_, dialect) = setup();
        let initial: Vec<i64> = initial.into_iter().collect();
        write_addresses(&dialect, 1, &initial, options_for(strategy));
        write_addresses(&dialect, 2, &[1, 2], options_for(strategy));

        let key = addresses_key(1);
        let mut context = AssociationContext::new(AssociationTypeContext::new(options_for(strategy)));
        let mut association = dialect.get_association(&key, &mut context).unwrap().unwrap();
        let mut expected: BTreeSet<i64> = initial.iter().copied().collect();
        if clear {
            association.clear();
            expected.clear();
        } else {
            for address in &removed {
                let (row_key, _) = address_row(1, *address);
                association.remove(row_key);
                expected.remove(address);
            }
        }
        for address in &added {
            let (row_key, row) = address_row(1, *address);
            association.put(row_key, row);
            expected.insert(*address);
        }
        dialect.insert_or_update_association(&key, &mut association, &mut context).unwrap();

        prop_assert_eq!(row_ids(read_addresses(&dialect, 1, options_for(strategy))), expected);
        prop_assert_eq!(
            row_ids(read_addresses(&dialect, 2, options_for(strategy))),
            BTreeSet::from([1, 2])
        );
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

fn sequence_request(name: &str, increment: i64, initial_value: i64) -> NextValueRequest {
    NextValueRequest::new(
        IdSourceKey::for_sequence(IdSourceKeyMetadata::sequence(name)),
        increment,
        initial_value,
    )
}

#[test]
fn test_next_value_starts_at_initial_value() {
    let (store, dialect) = setup();
    let request = sequence_request("person_seq", 1, 1);
    let values: Vec<i64> = (0..3).map(|_| dialect.next_value(&request).unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);

    let counter = store.document("hibernate_sequences", &json!("person_seq")).unwrap();
    assert_eq!(counter.get("next_val"), Some(&json!(4)));
}

#[test]
fn test_next_value_with_large_increment() {
    let (_, dialect) = setup();
    let request = sequence_request("order_seq", 10, 1);
    let values: Vec<i64> = (0..3).map(|_| dialect.next_value(&request).unwrap()).collect();
    assert_eq!(values, vec![1, 11, 21]);
}

#[test]
fn test_table_generator_segments_are_independent() {
    let (store, dialect) = setup();
    let metadata = IdSourceKeyMetadata::table("id_generators", "segment", "next");
    let person = NextValueRequest::new(IdSourceKey::for_table(Arc::clone(&metadata), "Person"), 1, 100);
    let order = NextValueRequest::new(IdSourceKey::for_table(metadata, "Order"), 1, 1);

    assert_eq!(dialect.next_value(&person).unwrap(), 100);
    assert_eq!(dialect.next_value(&order).unwrap(), 1);
    assert_eq!(dialect.next_value(&person).unwrap(), 101);
    assert_eq!(store.documents("id_generators").len(), 2);
}

#[test]
fn test_next_value_is_unique_across_threads() {
    let (_, dialect) = setup();
    let request = sequence_request("shared_seq", 1, 1);
    // The first call seeds the counter.
    assert_eq!(dialect.next_value(&request).unwrap(), 1);

    let values: Vec<i64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| (0..25).map(|_| dialect.next_value(&request).unwrap()).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let distinct: HashSet<i64> = values.iter().copied().collect();
    assert_eq!(values.len(), 100);
    assert_eq!(distinct.len(), 100);
    assert_eq!(values.iter().min(), Some(&2));
    assert_eq!(values.iter().max(), Some(&101));
}

#[test]
fn test_non_numeric_sequence_is_rejected() {
    let (store, dialect) = setup();
    let mut filter = Document::new();
    filter.insert("_id".to_string(), json!("broken_seq"));
    store
        .update_one(
            "hibernate_sequences",
            &filter,
            &doc(json!({"$set": {"next_val": "abc"}})),
            true,
        )
        .unwrap();

    let err = dialect.next_value(&sequence_request("broken_seq", 1, 1)).unwrap_err();
    assert!(matches!(err, GridError::NonNumericSequence { .. }), "got {err:?}");
}

#[test]
fn test_sequence_past_i64_max_is_exhausted() {
    let (store, dialect) = setup();
    store
        .update_one(
            "hibernate_sequences",
            &doc(json!({"_id": "full_seq"})),
            &doc(json!({"$set": {"next_val": i64::MAX}})),
            true,
        )
        .unwrap();
    let request = sequence_request("full_seq", 1, 1);

    assert_eq!(dialect.next_value(&request).unwrap(), i64::MAX);
    let err = dialect.next_value(&request).unwrap_err();
    assert!(matches!(err, GridError::SequenceExhausted { .. }), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Native queries and scans
// ---------------------------------------------------------------------------

fn seed_people(dialect: &DocumentDialect<InMemoryDocumentStore>) {
    insert_person(dialect, 1, "Ada", 36);
    insert_person(dialect, 2, "Grace", 45);
    insert_person(dialect, 3, "Barbara", 28);
}

#[test]
fn test_native_find_with_order_and_limit() {
    let (store, dialect) = setup();
    seed_people(&dialect);

    let query = DocumentQuery::find(doc(json!({"age": {"$gt": 30}})))
        .order_by(doc(json!({"age": -1})))
        .limit(5);
    let cursor = dialect.execute_backend_query(&query, &[person_metadata()]).unwrap();
    assert_eq!(store.open_cursors(), 1);

    let tuples: Vec<Tuple> = cursor.collect::<Result<_, _>>().unwrap();
    let names: Vec<&Value> = tuples.iter().filter_map(|t| t.get("name")).collect();
    assert_eq!(names, vec![&json!("Grace"), &json!("Ada")]);
    assert_eq!(tuples[0].get("id"), Some(&json!(2)));
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn test_native_find_one_and_count() {
    let (_, dialect) = setup();
    seed_people(&dialect);
    let targets = [person_metadata()];

    let query = DocumentQuery::find_one(doc(json!({"name": "Barbara"})));
    let tuples: Vec<Tuple> = dialect
        .execute_backend_query(&query, &targets)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(tuples.len(), 1);
    assert_eq!(tuples[0].get("age"), Some(&json!(28)));

    let query = DocumentQuery::parse(r#"{"collection": "Person", "operation": "count", "criteria": {"age": {"$lt": 40}}}"#)
        .unwrap();
    let mut cursor = dialect.execute_backend_query(&query, &[]).unwrap();
    let count = cursor.next().unwrap().unwrap();
    assert_eq!(count.get("n"), Some(&json!(2)));
    assert!(cursor.next().is_none());
}

#[test]
fn test_native_query_target_errors() {
    let (_, dialect) = setup();
    let query = DocumentQuery::find(Document::new());

    let err = dialect.execute_backend_query(&query, &[]).unwrap_err();
    assert!(matches!(err, GridError::UnknownCollection(_)), "got {err:?}");

    let order = Arc::new(EntityKeyMetadata::new("Order", ["id"]));
    let err = dialect
        .execute_backend_query(&query, &[person_metadata(), order])
        .unwrap_err();
    assert!(matches!(err, GridError::MultipleTargetsUnsupported(2)), "got {err:?}");

    assert!(DocumentQuery::parse(r#"{"operation": "map_reduce"}"#).is_err());

    let err = dialect
        .execute_backend_query(&DocumentQuery::remove(Document::new()), &[person_metadata()])
        .unwrap_err();
    assert!(matches!(err, GridError::InvalidOperation(_)), "got {err:?}");
    let err = dialect
        .execute_backend_update_query(&query, &[person_metadata()])
        .unwrap_err();
    assert!(matches!(err, GridError::InvalidOperation(_)), "got {err:?}");
}

#[test]
fn test_closing_query_cursor_early() {
    let (store, dialect) = setup();
    seed_people(&dialect);

    let mut cursor = dialect
        .execute_backend_query(&DocumentQuery::find(Document::new()), &[person_metadata()])
        .unwrap();
    assert!(cursor.next().is_some());
    cursor.close();
    assert!(cursor.is_closed());
    assert!(cursor.next().is_none());
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn test_for_each_tuple_visits_every_entity() {
    let (_, dialect) = setup();
    seed_people(&dialect);
    let order_metadata = Arc::new(EntityKeyMetadata::new("Order", ["id"]));
    let order_key = EntityKey::new(Arc::clone(&order_metadata), vec![json!(100)]).unwrap();
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let mut order = dialect.create_tuple(&order_key, &context);
    order.put("total", json!(12.5));
    dialect.insert_or_update_tuple(&order_key, &mut order, &context).unwrap();

    let mut seen: Vec<Tuple> = Vec::new();
    dialect
        .for_each_tuple(&mut |tuple: Tuple| seen.push(tuple), &[person_metadata(), order_metadata])
        .unwrap();

    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3].get("id"), Some(&json!(100)));
    assert_eq!(seen[3].get("total"), Some(&json!(12.5)));
}

#[test]
fn test_dialect_exposes_every_capability() {
    let (_, dialect) = setup();
    assert_eq!(dialect.name(), "document");
    assert!(dialect.capabilities().batching);
    assert!(dialect.tuple_store().is_some());
    assert!(dialect.association_store().is_some());
    assert!(dialect.sequence_generator().is_some());
    assert!(dialect.batch_executor().is_some());
    assert!(dialect.bulk_scanner().is_some());
    assert!(dialect.capabilities().optimistic_locking);
    assert!(dialect.optimistic_locking_store().is_some());
    assert!(dialect.identity_column_store().is_some());
}

// ---------------------------------------------------------------------------
// Optimistic locking and identity columns
// ---------------------------------------------------------------------------

fn lock_state(version: i64) -> Tuple {
    Tuple::new(TupleSnapshot::from_columns([("version".to_string(), json!(version))]))
}

fn insert_versioned(dialect: &DocumentDialect<InMemoryDocumentStore>, id: i64) {
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(id);
    let mut tuple = dialect.create_tuple(&key, &context);
    tuple.put("name", json!("Ada"));
    tuple.put("version", json!(1));
    dialect.insert_or_update_tuple(&key, &mut tuple, &context).unwrap();
}

#[test]
fn test_update_with_optimistic_lock() {
    let (store, dialect) = setup();
    insert_versioned(&dialect, 1);
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(1);

    let mut tuple = dialect.get_tuple(&key, &context).unwrap().unwrap();
    tuple.put("name", json!("Ada Lovelace"));
    tuple.put("version", json!(2));
    assert!(dialect
        .update_tuple_with_optimistic_lock(&key, &lock_state(1), &mut tuple, &context)
        .unwrap());
    assert!(!tuple.has_pending_operations());

    let mut stale = dialect.get_tuple(&key, &context).unwrap().unwrap();
    stale.put("name", json!("Grace"));
    assert!(!dialect
        .update_tuple_with_optimistic_lock(&key, &lock_state(1), &mut stale, &context)
        .unwrap());
    assert!(stale.has_pending_operations());

    assert_eq!(
        store.document("Person", &json!(1)),
        Some(doc(json!({"_id": 1, "name": "Ada Lovelace", "version": 2})))
    );
}

#[test]
fn test_remove_with_optimistic_lock() {
    let (store, dialect) = setup();
    insert_versioned(&dialect, 1);
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let key = person_key(1);

    assert!(!dialect.remove_tuple_with_optimistic_lock(&key, &lock_state(3), &context).unwrap());
    assert!(store.document("Person", &json!(1)).is_some());
    assert!(dialect.remove_tuple_with_optimistic_lock(&key, &lock_state(1), &context).unwrap());
    assert!(store.document("Person", &json!(1)).is_none());
    assert!(!dialect.remove_tuple_with_optimistic_lock(&key, &lock_state(1), &context).unwrap());
}

#[test]
fn test_insert_tuple_assigns_generated_id() {
    let (store, dialect) = setup();
    let type_context = all_columns();
    let context = TupleContext::new(&type_context);
    let metadata = person_metadata();

    let mut first = Tuple::for_insert();
    first.put("name", json!("Ada"));
    let id = dialect.insert_tuple(&metadata, &mut first, &context).unwrap();
    assert_eq!(first.get("id"), Some(&id));
    assert!(!first.has_pending_operations());

    let mut second = Tuple::for_insert();
    second.put("name", json!("Grace"));
    let other = dialect.insert_tuple(&metadata, &mut second, &context).unwrap();
    assert_ne!(id, other);

    let stored = store.document("Person", &id).unwrap();
    assert_eq!(stored.get("name"), Some(&json!("Ada")));

    let composite = EntityKeyMetadata::new("Book", ["id.author", "id.title"]);
    let err = dialect
        .insert_tuple(&composite, &mut Tuple::for_insert(), &context)
        .unwrap_err();
    assert!(matches!(err, GridError::InvalidOperation(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Native update queries and aggregation
// ---------------------------------------------------------------------------

#[test]
fn test_native_update_queries() {
    let (store, dialect) = setup();
    seed_people(&dialect);
    let targets = [person_metadata()];

    let update = DocumentQuery::update(doc(json!({"age": {"$gt": 30}})), doc(json!({"$set": {"senior": true}})));
    assert_eq!(dialect.execute_backend_update_query(&update, &targets).unwrap(), 1);
    let update = update.with_options(WriteOptions {
        multi: true,
        ..WriteOptions::default()
    });
    assert_eq!(dialect.execute_backend_update_query(&update, &targets).unwrap(), 2);
    assert_eq!(
        store.documents("Person").iter().filter(|d| d.get("senior").is_some()).count(),
        2
    );

    let upsert = DocumentQuery::update(doc(json!({"name": "Edsger"})), doc(json!({"$set": {"age": 72}})))
        .with_options(WriteOptions {
            upsert: true,
            ..WriteOptions::default()
        });
    assert_eq!(dialect.execute_backend_update_query(&upsert, &targets).unwrap(), 1);
    assert_eq!(store.documents("Person").len(), 4);

    let insert = DocumentQuery::insert(json!([{"_id": 7, "name": "Alan"}, {"name": "Kurt"}]));
    assert_eq!(dialect.execute_backend_update_query(&insert, &targets).unwrap(), 2);
    assert_eq!(store.documents("Person").len(), 6);

    let remove_one = DocumentQuery::remove(doc(json!({"age": {"$gt": 30}}))).with_options(WriteOptions {
        just_one: true,
        ..WriteOptions::default()
    });
    assert_eq!(dialect.execute_backend_update_query(&remove_one, &targets).unwrap(), 1);
    let remove_all = DocumentQuery::remove(doc(json!({"age": {"$gt": 30}})));
    assert_eq!(dialect.execute_backend_update_query(&remove_all, &targets).unwrap(), 2);
    assert_eq!(store.documents("Person").len(), 3);
}

#[test]
fn test_native_aggregate_unwinds_arrays() {
    let (store, dialect) = setup();
    store
        .insert_many(
            "Person",
            vec![
                doc(json!({"_id": 1, "name": "Ada", "tags": ["math", "poetry"]})),
                doc(json!({"_id": 2, "name": "Grace", "tags": ["navy"]})),
            ],
        )
        .unwrap();

    let query = DocumentQuery::aggregate(Document::new())
        .with_projection(["tags"])
        .unwind("tags")
        .order_by(doc(json!({"tags": 1})));
    let tuples: Vec<Tuple> = dialect
        .execute_backend_query(&query, &[person_metadata()])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let tags: Vec<&Value> = tuples.iter().filter_map(|t| t.get("tags")).collect();
    assert_eq!(tags, vec![&json!("math"), &json!("navy"), &json!("poetry")]);
    assert_eq!(tuples[1].get("id"), Some(&json!(2)));
    assert_eq!(store.open_cursors(), 0);
}
