//! The seam between the document dialect and a document database.

use gridstore_core::{Cursor, Document, GridError, Value};

/// Options of a `find` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to return besides `_id`. Empty returns every field.
    pub projection: Vec<String>,
    /// `{"field": 1 | -1}` sort specification.
    pub order_by: Document,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn with_projection(projection: &[String]) -> Self {
        FindOptions {
            projection: projection.to_vec(),
            ..FindOptions::default()
        }
    }
}

/// Outcome of an `update_one` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub upserted: bool,
}

/// Options of a `find_one_and_update` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindAndModify {
    pub upsert: bool,
    /// Return the document after the update instead of before it.
    pub return_new: bool,
}

/// Operations the dialect needs from a document database.
///
/// Each call is atomic for the single document it touches. A client is
/// created once per process and shared by every dialect instance.
pub trait DocumentClient: Send + Sync {
    fn find_one(&self, collection: &str, filter: &Document, projection: &[String]) -> Result<Option<Document>, GridError>;

    fn find(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Cursor<Document>, GridError>;

    fn count(&self, collection: &str, filter: &Document) -> Result<u64, GridError>;

    /// Runs an aggregation pipeline over the collection.
    fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Cursor<Document>, GridError>;

    /// Inserts every document in one call. A duplicate `_id` fails the
    /// whole call with [`GridError::TupleAlreadyExists`].
    fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<(), GridError>;

    /// Inserts one document, generating its `_id` when it has none.
    /// Returns the `_id` the document was stored under.
    fn insert_one(&self, collection: &str, document: Document) -> Result<Value, GridError>;

    fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, GridError>;

    /// Applies `update` to every matching document.
    fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, GridError>;

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: FindAndModify,
    ) -> Result<Option<Document>, GridError>;

    /// Returns the number of deleted documents.
    fn delete_one(&self, collection: &str, filter: &Document) -> Result<u64, GridError>;

    /// Returns the number of deleted documents.
    fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64, GridError>;
}
