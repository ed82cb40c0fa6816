//! Per-entity and per-association option values.
//!
//! Options are resolved by the caller; dialects only read the final values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where association rows are stored relative to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStorageType {
    /// Rows live inside the owner's document or node.
    InEntity,
    /// Rows live in a separate association document.
    AssociationDocument,
}

/// How separate association documents are grouped into collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationDocumentStorageType {
    /// One shared collection for every association type.
    GlobalCollection,
    /// One collection per association table.
    CollectionPerAssociation,
}

/// How map-typed associations keyed by strings are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStorageType {
    /// One object keyed by the map key.
    AsDocument,
    /// An array of rows, like any other collection.
    AsList,
}

/// Resolved options of one association type. `None` falls back to the
/// global defaults in [`GridConfig`](crate::config::GridConfig).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationOptions {
    pub storage: Option<AssociationStorageType>,
    pub document_storage: Option<AssociationDocumentStorageType>,
    pub map_storage: Option<MapStorageType>,
}

impl AssociationOptions {
    pub fn with_storage(mut self, storage: AssociationStorageType) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_document_storage(mut self, document_storage: AssociationDocumentStorageType) -> Self {
        self.document_storage = Some(document_storage);
        self
    }

    pub fn with_map_storage(mut self, map_storage: MapStorageType) -> Self {
        self.map_storage = Some(map_storage);
        self
    }
}

/// Resolved options of one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOptions {
    /// Expiry of stored entities. Only honoured by the key-value dialect.
    pub ttl: Option<Duration>,
}
