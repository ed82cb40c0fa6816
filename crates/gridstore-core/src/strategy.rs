//! Decides where the rows of an association physically live.
//!
//! Read and write paths must both go through [`AssociationStorageStrategy::select`]
//! so they agree on the location of the data.

use serde::{Deserialize, Serialize};

use crate::config::GridConfig;
use crate::keys::{AssociationKeyMetadata, AssociationKind};
use crate::options::{AssociationDocumentStorageType, AssociationOptions, AssociationStorageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationStorageStrategy {
    /// Rows are a field of the owner's document or node.
    EmbeddedInOwner,
    /// Rows are a document in a collection dedicated to the association table.
    CollectionPerAssociationType,
    /// Rows are a document in the shared association collection.
    GlobalCollection,
}

impl AssociationStorageStrategy {
    /// Classifies an association of the given kind.
    ///
    /// Embedded collections always stay with their owner. Otherwise the
    /// per-association options win over the configured defaults.
    pub fn select(kind: AssociationKind, options: &AssociationOptions, config: &GridConfig) -> Self {
        if kind == AssociationKind::EmbeddedCollection {
            return AssociationStorageStrategy::EmbeddedInOwner;
        }
        let storage = options.storage.unwrap_or(config.association_storage);
        if storage == AssociationStorageType::InEntity {
            return AssociationStorageStrategy::EmbeddedInOwner;
        }
        let document_storage = options
            .document_storage
            .unwrap_or(config.association_document_storage);
        match document_storage {
            AssociationDocumentStorageType::CollectionPerAssociation => {
                AssociationStorageStrategy::CollectionPerAssociationType
            }
            AssociationDocumentStorageType::GlobalCollection => AssociationStorageStrategy::GlobalCollection,
        }
    }

    pub fn for_metadata(
        metadata: &AssociationKeyMetadata,
        options: &AssociationOptions,
        config: &GridConfig,
    ) -> Self {
        Self::select(metadata.kind(), options, config)
    }

    pub fn is_embedded(self) -> bool {
        self == AssociationStorageStrategy::EmbeddedInOwner
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn kind() -> impl Strategy<Value = AssociationKind> {
        prop_oneof![Just(AssociationKind::Entity), Just(AssociationKind::EmbeddedCollection)]
    }

    fn storage() -> impl Strategy<Value = AssociationStorageType> {
        prop_oneof![
            Just(AssociationStorageType::InEntity),
            Just(AssociationStorageType::AssociationDocument)
        ]
    }

    fn document_storage() -> impl Strategy<Value = AssociationDocumentStorageType> {
        prop_oneof![
            Just(AssociationDocumentStorageType::GlobalCollection),
            Just(AssociationDocumentStorageType::CollectionPerAssociation)
        ]
    }

    fn options() -> impl Strategy<Value = AssociationOptions> {
        (proptest::option::of(storage()), proptest::option::of(document_storage())).prop_map(
            |(storage, document_storage)| AssociationOptions {
                storage,
                document_storage,
                map_storage: None,
            },
        )
    }

    fn config() -> impl Strategy<Value = GridConfig> {
        (storage(), document_storage()).prop_map(|(association_storage, association_document_storage)| {
            GridConfig {
                association_storage,
                association_document_storage,
                ..GridConfig::default()
            }
        })
    }

    #[test]
    fn embedded_collections_ignore_options() {
        let options = AssociationOptions::default()
            .with_storage(AssociationStorageType::AssociationDocument)
            .with_document_storage(AssociationDocumentStorageType::CollectionPerAssociation);
        assert_eq!(
            AssociationStorageStrategy::select(
                AssociationKind::EmbeddedCollection,
                &options,
                &GridConfig::default()
            ),
            AssociationStorageStrategy::EmbeddedInOwner
        );
    }

    #[test]
    fn per_association_option_overrides_default() {
        let config = GridConfig {
            association_storage: AssociationStorageType::InEntity,
            ..GridConfig::default()
        };
        let options = AssociationOptions::default().with_storage(AssociationStorageType::AssociationDocument);
        assert_eq!(
            AssociationStorageStrategy::select(AssociationKind::Entity, &options, &config),
            AssociationStorageStrategy::GlobalCollection
        );
        assert_eq!(
            AssociationStorageStrategy::select(AssociationKind::Entity, &AssociationOptions::default(), &config),
            AssociationStorageStrategy::EmbeddedInOwner
        );
    }

    #[test]
    fn document_storage_falls_back_to_default() {
        let config = GridConfig {
            association_document_storage: AssociationDocumentStorageType::CollectionPerAssociation,
            ..GridConfig::default()
        };
        assert_eq!(
            AssociationStorageStrategy::select(AssociationKind::Entity, &AssociationOptions::default(), &config),
            AssociationStorageStrategy::CollectionPerAssociationType
        );
    }

    proptest! {
        #[test]
        fn selection_is_stable(kind in kind(), options in options(), config in config()) {
            let first = AssociationStorageStrategy::select(kind, &options, &config);
            let second = AssociationStorageStrategy::select(kind, &options, &config);
            prop_assert_eq!(first, second);
            if kind == AssociationKind::EmbeddedCollection {
                prop_assert!(first.is_embedded());
            }
        }
    }
}
