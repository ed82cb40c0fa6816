//! Entity column state: an immutable snapshot plus a log of pending edits.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{Document, Value};

static NULL: Value = Value::Null;

/// Whether a snapshot was loaded from the store or is being built for insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotKind {
    Insert,
    Update,
}

/// Column values of one entity as last seen in (or seeded for) the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleSnapshot {
    columns: IndexMap<String, Value>,
    kind: SnapshotKind,
}

impl TupleSnapshot {
    pub fn new(columns: IndexMap<String, Value>, kind: SnapshotKind) -> Self {
        TupleSnapshot { columns, kind }
    }

    pub fn empty(kind: SnapshotKind) -> Self {
        TupleSnapshot {
            columns: IndexMap::new(),
            kind,
        }
    }

    /// Builds an `Update` snapshot from already flattened column pairs.
    pub fn from_columns<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        TupleSnapshot {
            columns: columns.into_iter().collect(),
            kind: SnapshotKind::Update,
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> &IndexMap<String, Value> {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A single column edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TupleOperationKind {
    Put(Value),
    PutNull,
    Remove,
}

/// An edit targeting one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleOperation {
    pub column: String,
    pub kind: TupleOperationKind,
}

impl TupleOperation {
    /// Value the column holds after this edit, `None` when removed.
    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            TupleOperationKind::Put(value) => Some(value),
            TupleOperationKind::PutNull => Some(&NULL),
            TupleOperationKind::Remove => None,
        }
    }
}

/// Column-level state of one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    snapshot: TupleSnapshot,
    operations: Vec<TupleOperation>,
}

impl Tuple {
    pub fn new(snapshot: TupleSnapshot) -> Self {
        Tuple {
            snapshot,
            operations: Vec::new(),
        }
    }

    /// An empty tuple to be inserted.
    pub fn for_insert() -> Self {
        Tuple::new(TupleSnapshot::empty(SnapshotKind::Insert))
    }

    pub fn snapshot(&self) -> &TupleSnapshot {
        &self.snapshot
    }

    pub fn kind(&self) -> SnapshotKind {
        self.snapshot.kind
    }

    pub fn operations(&self) -> &[TupleOperation] {
        &self.operations
    }

    pub fn has_pending_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    /// Current value of a column, taking pending edits into account.
    pub fn get(&self, column: &str) -> Option<&Value> {
        match self.operations.iter().rev().find(|op| op.column == column) {
            Some(op) => op.value(),
            None => self.snapshot.get(column),
        }
    }

    /// Records a new value. `Value::Null` is recorded as a `PutNull`.
    pub fn put(&mut self, column: impl Into<String>, value: Value) {
        let kind = if value.is_null() {
            TupleOperationKind::PutNull
        } else {
            TupleOperationKind::Put(value)
        };
        self.operations.push(TupleOperation {
            column: column.into(),
            kind,
        });
    }

    pub fn remove(&mut self, column: impl Into<String>) {
        self.operations.push(TupleOperation {
            column: column.into(),
            kind: TupleOperationKind::Remove,
        });
    }

    /// Names of every column that currently holds a value.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.snapshot.column_names() {
            if self.get(name).is_some() {
                names.push(name.to_string());
            }
        }
        for op in &self.operations {
            if !names.contains(&op.column) && self.get(&op.column).is_some() {
                names.push(op.column.clone());
            }
        }
        names
    }

    /// Folds the pending edits into a fresh `Update` snapshot.
    pub fn commit(&mut self) {
        let columns = apply_tuple_operations(&self.snapshot.columns, &self.operations);
        self.snapshot = TupleSnapshot::new(columns, SnapshotKind::Update);
        self.operations.clear();
    }

    /// Swaps in a snapshot with one column replaced, used when the store
    /// changed that column outside this tuple's log. `None` drops it.
    pub fn refresh_snapshot_column(&mut self, column: &str, value: Option<Value>) {
        let mut columns = self.snapshot.columns.clone();
        match value {
            Some(value) => {
                columns.insert(column.to_string(), value);
            }
            None => {
                columns.shift_remove(column);
            }
        }
        self.snapshot = TupleSnapshot::new(columns, self.snapshot.kind);
    }

    /// The tuple's current columns as a nested document, dotted names
    /// becoming embedded objects.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        for name in self.column_names() {
            if let Some(value) = self.get(&name) {
                crate::value::set_path(&mut document, &name, value.clone());
            }
        }
        document
    }
}

/// Replays `operations` over `columns`, returning the resulting columns.
pub fn apply_tuple_operations(
    columns: &IndexMap<String, Value>,
    operations: &[TupleOperation],
) -> IndexMap<String, Value> {
    let mut result = columns.clone();
    for op in operations {
        match op.value() {
            Some(value) => {
                result.insert(op.column.clone(), value.clone());
            }
            None => {
                result.shift_remove(&op.column);
            }
        }
    }
    result
}
