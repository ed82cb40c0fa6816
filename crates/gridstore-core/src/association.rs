//! Association state: rows keyed by [`RowKey`] plus a log of pending edits.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::keys::RowKey;
use crate::value::Value;

/// Column values of one association row.
pub type Row = IndexMap<String, Value>;

/// A row-level edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssociationOperation {
    Put(RowKey, Row),
    PutNull(RowKey),
    Remove(RowKey),
    Clear,
}

impl AssociationOperation {
    pub fn row_key(&self) -> Option<&RowKey> {
        match self {
            AssociationOperation::Put(key, _)
            | AssociationOperation::PutNull(key)
            | AssociationOperation::Remove(key) => Some(key),
            AssociationOperation::Clear => None,
        }
    }
}

/// All member rows of one association.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Association {
    snapshot: IndexMap<RowKey, Row>,
    operations: Vec<AssociationOperation>,
}

impl Association {
    pub fn new(snapshot: IndexMap<RowKey, Row>) -> Self {
        Association {
            snapshot,
            operations: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Association::default()
    }

    pub fn snapshot(&self) -> &IndexMap<RowKey, Row> {
        &self.snapshot
    }

    pub fn operations(&self) -> &[AssociationOperation] {
        &self.operations
    }

    pub fn has_pending_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn put(&mut self, key: RowKey, row: Row) {
        self.operations.push(AssociationOperation::Put(key, row));
    }

    pub fn put_null(&mut self, key: RowKey) {
        self.operations.push(AssociationOperation::PutNull(key));
    }

    pub fn remove(&mut self, key: RowKey) {
        self.operations.push(AssociationOperation::Remove(key));
    }

    pub fn clear(&mut self) {
        self.operations.push(AssociationOperation::Clear);
    }

    /// Current content of a row, taking pending edits into account.
    pub fn get(&self, key: &RowKey) -> Option<Row> {
        self.rows().shift_remove(key)
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows().contains_key(key)
    }

    /// Row keys present after the pending edits.
    pub fn keys(&self) -> Vec<RowKey> {
        self.rows().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows after replaying the pending edits over the snapshot.
    pub fn rows(&self) -> IndexMap<RowKey, Row> {
        apply_association_operations(&self.snapshot, &self.operations)
    }

    /// Folds the pending edits into the snapshot.
    pub fn commit(&mut self) {
        self.snapshot = self.rows();
        self.operations.clear();
    }
}

/// Replays `operations` over `snapshot`. A `PutNull` drops the row.
pub fn apply_association_operations(
    snapshot: &IndexMap<RowKey, Row>,
    operations: &[AssociationOperation],
) -> IndexMap<RowKey, Row> {
    let mut rows = snapshot.clone();
    for op in operations {
        match op {
            AssociationOperation::Put(key, row) => {
                rows.insert(key.clone(), row.clone());
            }
            AssociationOperation::PutNull(key) | AssociationOperation::Remove(key) => {
                rows.shift_remove(key);
            }
            AssociationOperation::Clear => rows.clear(),
        }
    }
    rows
}
