//! Immutable composite identifiers.
//!
//! Every key is a table (or collection) name plus ordered column names and
//! ordered column values. Metadata is shared behind an [`Arc`] because it is
//! supplied once per entity or association type and never changes for the
//! lifetime of a session.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::GridError;
use crate::value::{hash_values, Value};

/// Column values of a key. Most keys have one or two columns.
pub type KeyValues = SmallVec<[Value; 2]>;

fn check_lengths(table: &str, names: usize, values: usize) -> Result<(), GridError> {
    if names != values {
        return Err(GridError::InvalidKey {
            table: table.to_string(),
            column_count: names,
            value_count: values,
        });
    }
    Ok(())
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// The table and key columns of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKeyMetadata {
    table: String,
    column_names: Vec<String>,
}

impl EntityKeyMetadata {
    pub fn new<I, S>(table: impl Into<String>, column_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EntityKeyMetadata {
            table: table.into(),
            column_names: strings(column_names),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

/// The primary key of one stored entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityKey {
    metadata: Arc<EntityKeyMetadata>,
    column_values: KeyValues,
}

impl EntityKey {
    /// Fails with [`GridError::InvalidKey`] when the value count does not
    /// match the metadata's key columns.
    pub fn new(metadata: Arc<EntityKeyMetadata>, column_values: Vec<Value>) -> Result<Self, GridError> {
        check_lengths(&metadata.table, metadata.column_names.len(), column_values.len())?;
        Ok(EntityKey {
            metadata,
            column_values: SmallVec::from_vec(column_values),
        })
    }

    pub fn metadata(&self) -> &Arc<EntityKeyMetadata> {
        &self.metadata
    }

    pub fn table(&self) -> &str {
        &self.metadata.table
    }

    pub fn column_names(&self) -> &[String] {
        &self.metadata.column_names
    }

    pub fn column_values(&self) -> &[Value] {
        &self.column_values
    }

    /// Value of one key column, if it is part of this key.
    pub fn column_value(&self, column: &str) -> Option<&Value> {
        self.metadata
            .column_names
            .iter()
            .position(|c| c == column)
            .map(|i| &self.column_values[i])
    }

    /// Pairs of (column name, value) in key order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .column_names
            .iter()
            .map(String::as_str)
            .zip(self.column_values.iter())
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.table == other.metadata.table
            && self.metadata.column_names == other.metadata.column_names
            && self.column_values == other.column_values
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metadata.table.hash(state);
        hash_values(&self.column_values, state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.metadata.table)?;
        for (i, (name, value)) in self.columns().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

/// Whether an association links entities or holds embedded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    /// Rows point at other entities.
    Entity,
    /// Rows are value objects owned by the entity (element collections).
    EmbeddedCollection,
}

/// Collection semantics of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationType {
    Bag,
    Set,
    List,
    /// Rows keyed by their row key index column.
    Map,
    /// A single-valued association; stores one element rather than an array.
    OneToOne,
}

/// Describes the entity referenced by the rows of an association.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssociatedEntityKeyMetadata {
    association_key_columns: Vec<String>,
    entity_key_metadata: Arc<EntityKeyMetadata>,
}

impl AssociatedEntityKeyMetadata {
    /// `association_key_columns` are the row columns holding the target's
    /// key, in the order of the target's key columns.
    pub fn new<I, S>(association_key_columns: I, entity_key_metadata: Arc<EntityKeyMetadata>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AssociatedEntityKeyMetadata {
            association_key_columns: strings(association_key_columns),
            entity_key_metadata,
        }
    }

    pub fn association_key_columns(&self) -> &[String] {
        &self.association_key_columns
    }

    pub fn entity_key_metadata(&self) -> &Arc<EntityKeyMetadata> {
        &self.entity_key_metadata
    }

    /// Maps a row column to the target entity key column it carries.
    pub fn entity_key_column(&self, association_key_column: &str) -> Option<&str> {
        self.association_key_columns
            .iter()
            .position(|c| c == association_key_column)
            .and_then(|i| self.entity_key_metadata.column_names().get(i))
            .map(String::as_str)
    }

    /// Whether the given row column references the target entity.
    pub fn is_association_key_column(&self, column: &str) -> bool {
        self.association_key_columns.iter().any(|c| c == column)
    }
}

/// Metadata shared by all keys of one association type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationKeyMetadata {
    table: String,
    column_names: Vec<String>,
    row_key_column_names: Vec<String>,
    row_key_index_column_names: Vec<String>,
    collection_role: String,
    kind: AssociationKind,
    association_type: AssociationType,
    inverse: bool,
    associated_entity: Option<AssociatedEntityKeyMetadata>,
}

impl AssociationKeyMetadata {
    pub fn builder(table: impl Into<String>, collection_role: impl Into<String>) -> AssociationKeyMetadataBuilder {
        AssociationKeyMetadataBuilder {
            table: table.into(),
            collection_role: collection_role.into(),
            column_names: Vec::new(),
            row_key_column_names: Vec::new(),
            row_key_index_column_names: Vec::new(),
            kind: AssociationKind::Entity,
            association_type: AssociationType::Bag,
            inverse: false,
            associated_entity: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns of the association key (the owner's foreign key columns).
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Columns identifying one row of the association.
    pub fn row_key_column_names(&self) -> &[String] {
        &self.row_key_column_names
    }

    /// Map keys or order columns of indexed collections.
    pub fn row_key_index_column_names(&self) -> &[String] {
        &self.row_key_index_column_names
    }

    pub fn collection_role(&self) -> &str {
        &self.collection_role
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    pub fn association_type(&self) -> AssociationType {
        self.association_type
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    pub fn associated_entity(&self) -> Option<&AssociatedEntityKeyMetadata> {
        self.associated_entity.as_ref()
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }

    /// Candidates that are not association key columns. Those are the only
    /// columns a store has to persist per row; the rest can be recovered
    /// from the key itself.
    pub fn columns_without_key_columns<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        candidates
            .into_iter()
            .filter(|c| !self.is_key_column(c))
            .cloned()
            .collect()
    }

    /// The single row key column outside the association key, if there is
    /// exactly one.
    pub fn single_row_key_column_not_in_association_key(&self) -> Option<&str> {
        let mut found = None;
        for column in &self.row_key_column_names {
            if !self.is_key_column(column) {
                if found.is_some() {
                    return None;
                }
                found = Some(column.as_str());
            }
        }
        found
    }
}

impl PartialEq for AssociationKeyMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.column_names == other.column_names
            && self.collection_role == other.collection_role
    }
}

impl Eq for AssociationKeyMetadata {}

impl Hash for AssociationKeyMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.collection_role.hash(state);
    }
}

/// Builder for [`AssociationKeyMetadata`].
#[derive(Debug, Clone)]
pub struct AssociationKeyMetadataBuilder {
    table: String,
    collection_role: String,
    column_names: Vec<String>,
    row_key_column_names: Vec<String>,
    row_key_index_column_names: Vec<String>,
    kind: AssociationKind,
    association_type: AssociationType,
    inverse: bool,
    associated_entity: Option<AssociatedEntityKeyMetadata>,
}

impl AssociationKeyMetadataBuilder {
    pub fn column_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = strings(names);
        self
    }

    pub fn row_key_column_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.row_key_column_names = strings(names);
        self
    }

    pub fn row_key_index_column_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.row_key_index_column_names = strings(names);
        self
    }

    pub fn kind(mut self, kind: AssociationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn association_type(mut self, association_type: AssociationType) -> Self {
        self.association_type = association_type;
        self
    }

    pub fn inverse(mut self, inverse: bool) -> Self {
        self.inverse = inverse;
        self
    }

    pub fn associated_entity(mut self, associated: AssociatedEntityKeyMetadata) -> Self {
        self.associated_entity = Some(associated);
        self
    }

    pub fn build(self) -> Arc<AssociationKeyMetadata> {
        Arc::new(AssociationKeyMetadata {
            table: self.table,
            column_names: self.column_names,
            row_key_column_names: self.row_key_column_names,
            row_key_index_column_names: self.row_key_index_column_names,
            collection_role: self.collection_role,
            kind: self.kind,
            association_type: self.association_type,
            inverse: self.inverse,
            associated_entity: self.associated_entity,
        })
    }
}

/// The association belonging to one owner under one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationKey {
    metadata: Arc<AssociationKeyMetadata>,
    column_values: KeyValues,
    owner: EntityKey,
}

impl AssociationKey {
    pub fn new(
        metadata: Arc<AssociationKeyMetadata>,
        column_values: Vec<Value>,
        owner: EntityKey,
    ) -> Result<Self, GridError> {
        check_lengths(&metadata.table, metadata.column_names.len(), column_values.len())?;
        Ok(AssociationKey {
            metadata,
            column_values: SmallVec::from_vec(column_values),
            owner,
        })
    }

    pub fn metadata(&self) -> &Arc<AssociationKeyMetadata> {
        &self.metadata
    }

    pub fn table(&self) -> &str {
        &self.metadata.table
    }

    pub fn column_names(&self) -> &[String] {
        &self.metadata.column_names
    }

    pub fn column_values(&self) -> &[Value] {
        &self.column_values
    }

    pub fn collection_role(&self) -> &str {
        &self.metadata.collection_role
    }

    /// Key of the entity owning this association.
    pub fn owner(&self) -> &EntityKey {
        &self.owner
    }

    pub fn column_value(&self, column: &str) -> Option<&Value> {
        self.metadata
            .column_names
            .iter()
            .position(|c| c == column)
            .map(|i| &self.column_values[i])
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .column_names
            .iter()
            .map(String::as_str)
            .zip(self.column_values.iter())
    }
}

impl PartialEq for AssociationKey {
    fn eq(&self, other: &Self) -> bool {
        *self.metadata == *other.metadata && self.column_values == other.column_values
    }
}

impl Eq for AssociationKey {}

impl Hash for AssociationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metadata.hash(state);
        hash_values(&self.column_values, state);
    }
}

impl fmt::Display for AssociationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] of {}", self.metadata.table, self.metadata.collection_role, self.owner)
    }
}

/// Identifies one element within an association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowKey {
    column_names: Vec<String>,
    column_values: KeyValues,
}

impl RowKey {
    pub fn new<I, S>(column_names: I, column_values: Vec<Value>) -> Result<Self, GridError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let column_names = strings(column_names);
        check_lengths("row", column_names.len(), column_values.len())?;
        Ok(RowKey {
            column_names,
            column_values: SmallVec::from_vec(column_values),
        })
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_values(&self) -> &[Value] {
        &self.column_values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.column_names
            .iter()
            .position(|c| c == column)
            .map(|i| &self.column_values[i])
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names
            .iter()
            .map(String::as_str)
            .zip(self.column_values.iter())
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.column_names == other.column_names && self.column_values == other.column_values
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.column_names.hash(state);
        hash_values(&self.column_values, state);
    }
}

// ---------------------------------------------------------------------------
// Id sources
// ---------------------------------------------------------------------------

/// Whether an id source is a named sequence or a row of a generator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdSourceType {
    Sequence,
    Table,
}

/// Describes a family of id generators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdSourceKeyMetadata {
    kind: IdSourceType,
    name: String,
    key_column_name: String,
    value_column_name: String,
}

impl IdSourceKeyMetadata {
    /// A generator table such as `hibernate_sequences(sequence_name, next_val)`.
    pub fn table(
        name: impl Into<String>,
        key_column_name: impl Into<String>,
        value_column_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(IdSourceKeyMetadata {
            kind: IdSourceType::Table,
            name: name.into(),
            key_column_name: key_column_name.into(),
            value_column_name: value_column_name.into(),
        })
    }

    /// A named sequence. Sequences share one backing table.
    pub fn sequence(name: impl Into<String>) -> Arc<Self> {
        Arc::new(IdSourceKeyMetadata {
            kind: IdSourceType::Sequence,
            name: name.into(),
            key_column_name: "sequence_name".to_string(),
            value_column_name: "next_val".to_string(),
        })
    }

    pub fn kind(&self) -> IdSourceType {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_column_name(&self) -> &str {
        &self.key_column_name
    }

    pub fn value_column_name(&self) -> &str {
        &self.value_column_name
    }
}

/// Table used to store named sequences.
pub const SEQUENCES_TABLE: &str = "hibernate_sequences";

/// One id generator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSourceKey {
    metadata: Arc<IdSourceKeyMetadata>,
    segment: String,
}

impl IdSourceKey {
    /// A row of a table-based generator, e.g. the `Person` segment.
    pub fn for_table(metadata: Arc<IdSourceKeyMetadata>, segment: impl Into<String>) -> Self {
        IdSourceKey {
            metadata,
            segment: segment.into(),
        }
    }

    /// A named sequence; the segment is the sequence name.
    pub fn for_sequence(metadata: Arc<IdSourceKeyMetadata>) -> Self {
        let segment = metadata.name.clone();
        IdSourceKey { metadata, segment }
    }

    pub fn metadata(&self) -> &Arc<IdSourceKeyMetadata> {
        &self.metadata
    }

    /// Backing table of the generator.
    pub fn table(&self) -> &str {
        match self.metadata.kind {
            IdSourceType::Table => &self.metadata.name,
            IdSourceType::Sequence => SEQUENCES_TABLE,
        }
    }

    /// Name identifying this generator within its table.
    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn column_names(&self) -> [&str; 1] {
        [self.metadata.key_column_name.as_str()]
    }

    pub fn column_values(&self) -> [Value; 1] {
        [Value::String(self.segment.clone())]
    }
}

impl Hash for IdSourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metadata.hash(state);
        self.segment.hash(state);
    }
}

impl fmt::Display for IdSourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table(), self.segment)
    }
}

/// Parameters of one `next_value` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextValueRequest {
    pub key: IdSourceKey,
    pub increment: i64,
    pub initial_value: i64,
}

impl NextValueRequest {
    pub fn new(key: IdSourceKey, increment: i64, initial_value: i64) -> Self {
        NextValueRequest {
            key,
            increment,
            initial_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    fn person() -> Arc<EntityKeyMetadata> {
        Arc::new(EntityKeyMetadata::new("Person", ["id"]))
    }

    #[test]
    fn entity_key_rejects_length_mismatch() {
        let err = EntityKey::new(person(), vec![json!(1), json!(2)]).unwrap_err();
        assert!(matches!(
            err,
            GridError::InvalidKey {
                column_count: 1,
                value_count: 2,
                ..
            }
        ));
    }

    #[test]
    fn entity_keys_compare_structurally() {
        let a = EntityKey::new(person(), vec![json!(1)]).unwrap();
        let b = EntityKey::new(person(), vec![json!(1)]).unwrap();
        let c = EntityKey::new(person(), vec![json!(2)]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<EntityKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.column_value("id"), Some(&json!(1)));
        assert_eq!(a.to_string(), "Person(id=1)");
    }

    #[test]
    fn row_key_rejects_length_mismatch() {
        assert!(RowKey::new(["a", "b"], vec![json!(1)]).is_err());
        let row = RowKey::new(["a", "b"], vec![json!(1), json!("x")]).unwrap();
        assert_eq!(row.get("b"), Some(&json!("x")));
        assert_eq!(row.get("c"), None);
    }

    #[test]
    fn association_metadata_finds_single_non_key_row_column() {
        let metadata = AssociationKeyMetadata::builder("Person_Address", "addresses")
            .column_names(["person_id"])
            .row_key_column_names(["person_id", "address_id"])
            .build();
        assert_eq!(
            metadata.single_row_key_column_not_in_association_key(),
            Some("address_id")
        );

        let indexed = AssociationKeyMetadata::builder("Person_Phone", "phones")
            .column_names(["person_id"])
            .row_key_column_names(["person_id", "phone_id", "position"])
            .build();
        assert_eq!(indexed.single_row_key_column_not_in_association_key(), None);
    }

    #[test]
    fn association_key_validates_and_exposes_owner() {
        let metadata = AssociationKeyMetadata::builder("Person_Address", "addresses")
            .column_names(["person_id"])
            .build();
        let owner = EntityKey::new(person(), vec![json!(7)]).unwrap();
        assert!(AssociationKey::new(metadata.clone(), vec![], owner.clone()).is_err());

        let key = AssociationKey::new(metadata, vec![json!(7)], owner.clone()).unwrap();
        assert_eq!(key.owner(), &owner);
        assert_eq!(key.collection_role(), "addresses");
    }

    #[test]
    fn associated_entity_maps_row_columns_to_target_key() {
        let address = Arc::new(EntityKeyMetadata::new("Address", ["id"]));
        let associated = AssociatedEntityKeyMetadata::new(["address_id"], address);
        assert_eq!(associated.entity_key_column("address_id"), Some("id"));
        assert_eq!(associated.entity_key_column("person_id"), None);
    }

    #[test]
    fn id_source_table_depends_on_kind() {
        let seq = IdSourceKey::for_sequence(IdSourceKeyMetadata::sequence("person_seq"));
        assert_eq!(seq.table(), SEQUENCES_TABLE);
        assert_eq!(seq.segment(), "person_seq");

        let table = IdSourceKey::for_table(
            IdSourceKeyMetadata::table("id_gen", "gen_name", "gen_val"),
            "Person",
        );
        assert_eq!(table.table(), "id_gen");
        assert_eq!(table.column_names(), ["gen_name"]);
    }
}
