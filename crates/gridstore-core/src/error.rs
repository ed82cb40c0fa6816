//! Error types for gridstore.
//!
//! [`GridError`] covers every failure a dialect can surface. Variants are
//! grouped into the [`ErrorCategory`] taxonomy so callers can decide how to
//! react without matching on each variant.

use thiserror::Error;

/// Broad classification of a [`GridError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or type-inconsistent input. Never retried.
    Validation,
    /// A capability the backend cannot provide.
    Unsupported,
    /// Network, timeout, connection or storage engine failures.
    Transient,
    /// Optimistic id generation exhausted its retry bound.
    ConcurrencyRace,
    /// The store rejected a write because of existing data.
    Integrity,
}

/// Errors produced by dialect operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// Column names and values of a key do not line up.
    #[error("invalid key for '{table}': {column_count} column name(s) but {value_count} value(s)")]
    InvalidKey {
        table: String,
        column_count: usize,
        value_count: usize,
    },

    /// A sequence counter holds something other than an integer.
    #[error("cannot increment non-numeric sequence field '{field}' of '{sequence}'")]
    NonNumericSequence { sequence: String, field: String },

    /// A caller-supplied argument or operation is malformed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration for '{key}': {reason}")]
    Configuration { key: String, reason: String },

    /// A native query named more than one target entity type.
    #[error("native queries support exactly one target entity type, got {0}")]
    MultipleTargetsUnsupported(usize),

    /// The backend has no way to provide this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A native query did not name a collection and none could be derived.
    #[error("unable to determine the collection for query: {0}")]
    UnknownCollection(String),

    /// A failure reported by the backend client.
    #[error("backend error: {0}")]
    Backend(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic concurrency gave up after the configured attempts.
    #[error("gave up on '{key}' after {attempts} concurrent update attempt(s)")]
    ConcurrencyRace { key: String, attempts: u32 },

    /// An insert collided with an existing entry.
    #[error("entity already exists in '{table}': {key}")]
    TupleAlreadyExists { table: String, key: String },

    /// The next value of a sequence would not fit in an `i64`.
    #[error("sequence '{sequence}' is exhausted")]
    SequenceExhausted { sequence: String },

    /// A sequence expected to exist up-front was not found.
    #[error("sequence not found: {0}")]
    SequenceNotFound(String),

    /// An operation was added to or executed on a closed queue.
    #[error("operations queue is closed")]
    QueueClosed,
}

impl GridError {
    /// Returns the taxonomy bucket of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GridError::InvalidKey { .. }
            | GridError::NonNumericSequence { .. }
            | GridError::InvalidOperation(_)
            | GridError::Configuration { .. }
            | GridError::UnknownCollection(_)
            | GridError::Serialization(_)
            | GridError::QueueClosed => ErrorCategory::Validation,
            GridError::MultipleTargetsUnsupported(_) | GridError::Unsupported(_) => {
                ErrorCategory::Unsupported
            }
            GridError::Backend(_) => ErrorCategory::Transient,
            GridError::ConcurrencyRace { .. } => ErrorCategory::ConcurrencyRace,
            GridError::TupleAlreadyExists { .. }
            | GridError::SequenceExhausted { .. }
            | GridError::SequenceNotFound(_) => ErrorCategory::Integrity,
        }
    }

    /// Whether a retry at the connection layer could succeed.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Shorthand for a backend failure.
    pub fn backend(message: impl Into<String>) -> Self {
        GridError::Backend(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        let invalid = GridError::InvalidKey {
            table: "Person".into(),
            column_count: 1,
            value_count: 2,
        };
        assert_eq!(invalid.category(), ErrorCategory::Validation);
        assert_eq!(
            GridError::MultipleTargetsUnsupported(2).category(),
            ErrorCategory::Unsupported
        );
        assert!(GridError::backend("connection reset").is_transient());
        assert_eq!(
            GridError::ConcurrencyRace {
                key: "Identifiers:seq".into(),
                attempts: 5
            }
            .category(),
            ErrorCategory::ConcurrencyRace
        );
        assert_eq!(
            GridError::SequenceExhausted { sequence: "seq".into() }.category(),
            ErrorCategory::Integrity
        );
    }

    #[test]
    fn invalid_key_message_names_the_table() {
        let err = GridError::InvalidKey {
            table: "Person".into(),
            column_count: 1,
            value_count: 0,
        };
        assert_eq!(
            err.to_string(),
            "invalid key for 'Person': 1 column name(s) but 0 value(s)"
        );
    }
}
