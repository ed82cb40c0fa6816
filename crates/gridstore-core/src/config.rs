//! Global dialect configuration.
//!
//! Values can come from a JSON document ([`GridConfig::from_json`]) or from
//! the process environment ([`GridConfig::from_env`]):
//!
//! - `GRIDSTORE_ASSOCIATION_STORAGE`: `in_entity` or `association_document`
//! - `GRIDSTORE_ASSOCIATION_DOCUMENT_STORAGE`: `global_collection` or
//!   `collection_per_association`
//! - `GRIDSTORE_GLOBAL_COLLECTION`: name of the shared association collection
//! - `GRIDSTORE_SEQUENCE_MAX_ATTEMPTS`: retry bound for optimistic counters
//! - `GRIDSTORE_BATCH_INSERTS`: `true` or `false`
//! - `GRIDSTORE_MAP_STORAGE`: `as_document` or `as_list`

use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::options::{AssociationDocumentStorageType, AssociationStorageType, MapStorageType};

pub const ENV_ASSOCIATION_STORAGE: &str = "GRIDSTORE_ASSOCIATION_STORAGE";
pub const ENV_ASSOCIATION_DOCUMENT_STORAGE: &str = "GRIDSTORE_ASSOCIATION_DOCUMENT_STORAGE";
pub const ENV_GLOBAL_COLLECTION: &str = "GRIDSTORE_GLOBAL_COLLECTION";
pub const ENV_SEQUENCE_MAX_ATTEMPTS: &str = "GRIDSTORE_SEQUENCE_MAX_ATTEMPTS";
pub const ENV_BATCH_INSERTS: &str = "GRIDSTORE_BATCH_INSERTS";
pub const ENV_MAP_STORAGE: &str = "GRIDSTORE_MAP_STORAGE";

/// Defaults shared by every dialect instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Storage used when an association carries no explicit option.
    pub association_storage: AssociationStorageType,

    /// Collection grouping used when an association carries no explicit option.
    pub association_document_storage: AssociationDocumentStorageType,

    /// Name of the shared association collection.
    pub global_association_collection: String,

    /// Prefix of per-association-type collections.
    pub association_collection_prefix: String,

    /// Attempts made by optimistic id generation before giving up.
    pub sequence_max_attempts: u32,

    /// Whether `execute_batch` coalesces inserts into multi-document calls.
    pub batch_inserts: bool,

    /// Layout of string-keyed map associations without an explicit option.
    pub map_storage: MapStorageType,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            association_storage: AssociationStorageType::AssociationDocument,
            association_document_storage: AssociationDocumentStorageType::GlobalCollection,
            global_association_collection: "Associations".to_string(),
            association_collection_prefix: "associations_".to_string(),
            sequence_max_attempts: 5,
            batch_inserts: true,
            map_storage: MapStorageType::AsDocument,
        }
    }
}

impl GridConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, GridError> {
        let config: GridConfig = serde_json::from_str(json).map_err(|e| GridError::Configuration {
            key: "<json>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()
    }

    /// Reads the `GRIDSTORE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, GridError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GridError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = GridConfig::default();
        if let Some(raw) = lookup(ENV_ASSOCIATION_STORAGE) {
            config.association_storage = parse_enum(ENV_ASSOCIATION_STORAGE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ASSOCIATION_DOCUMENT_STORAGE) {
            config.association_document_storage = parse_enum(ENV_ASSOCIATION_DOCUMENT_STORAGE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_GLOBAL_COLLECTION) {
            config.global_association_collection = raw;
        }
        if let Some(raw) = lookup(ENV_SEQUENCE_MAX_ATTEMPTS) {
            config.sequence_max_attempts = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                GridError::Configuration {
                    key: ENV_SEQUENCE_MAX_ATTEMPTS.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(raw) = lookup(ENV_BATCH_INSERTS) {
            config.batch_inserts = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => {
                    return Err(GridError::Configuration {
                        key: ENV_BATCH_INSERTS.to_string(),
                        reason: format!("expected a boolean, got '{other}'"),
                    })
                }
            };
        }
        if let Some(raw) = lookup(ENV_MAP_STORAGE) {
            config.map_storage = parse_enum(ENV_MAP_STORAGE, &raw)?;
        }
        config.validate()
    }

    fn validate(self) -> Result<Self, GridError> {
        if self.sequence_max_attempts == 0 {
            return Err(GridError::Configuration {
                key: "sequence_max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.global_association_collection.is_empty() {
            return Err(GridError::Configuration {
                key: "global_association_collection".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(self)
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, GridError> {
    let normalized = raw.trim().to_ascii_lowercase();
    serde_json::from_value(serde_json::Value::String(normalized)).map_err(|_| GridError::Configuration {
        key: key.to_string(),
        reason: format!("unrecognized value '{raw}'"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = GridConfig::default();
        assert_eq!(config.association_storage, AssociationStorageType::AssociationDocument);
        assert_eq!(config.global_association_collection, "Associations");
        assert_eq!(config.sequence_max_attempts, 5);
        assert!(config.batch_inserts);
    }

    #[test]
    fn from_json_keeps_defaults_for_missing_fields() {
        let config = GridConfig::from_json(
            r#"{"association_storage": "in_entity", "sequence_max_attempts": 9}"#,
        )
        .unwrap();
        assert_eq!(config.association_storage, AssociationStorageType::InEntity);
        assert_eq!(config.sequence_max_attempts, 9);
        assert_eq!(config.association_collection_prefix, "associations_");
    }

    #[test]
    fn from_json_rejects_garbage() {
        let err = GridConfig::from_json(r#"{"batch_inserts": "maybe"}"#).unwrap_err();
        assert!(matches!(err, GridError::Configuration { .. }));
    }

    #[test]
    fn from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = [
            (ENV_ASSOCIATION_DOCUMENT_STORAGE, "COLLECTION_PER_ASSOCIATION"),
            (ENV_GLOBAL_COLLECTION, "Links"),
            (ENV_BATCH_INSERTS, "no"),
            (ENV_MAP_STORAGE, "as_list"),
        ]
        .into_iter()
        .collect();
        let config = GridConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(
            config.association_document_storage,
            AssociationDocumentStorageType::CollectionPerAssociation
        );
        assert_eq!(config.global_association_collection, "Links");
        assert!(!config.batch_inserts);
        assert_eq!(config.map_storage, MapStorageType::AsList);
    }

    #[test]
    fn from_lookup_rejects_bad_values() {
        let err = GridConfig::from_lookup(|k| {
            (k == ENV_SEQUENCE_MAX_ATTEMPTS).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, GridError::Configuration { ref key, .. } if key == ENV_SEQUENCE_MAX_ATTEMPTS));

        let err = GridConfig::from_lookup(|k| (k == ENV_ASSOCIATION_STORAGE).then(|| "nowhere".to_string()))
            .unwrap_err();
        assert!(matches!(err, GridError::Configuration { .. }));
    }
}
