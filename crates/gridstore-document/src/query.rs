//! Native query descriptors for the document dialect.
//!
//! Queries arrive already translated by the caller's query parser; the
//! dialect only executes them. They can be built in code or parsed from
//! their JSON form:
//!
//! ```json
//! {"collection": "Person", "operation": "find", "criteria": {"age": {"$gt": 30}}, "limit": 10}
//! {"collection": "Person", "operation": "update", "criteria": {"age": {"$gt": 30}},
//!  "update_or_insert": {"$set": {"senior": true}}, "options": {"multi": true}}
//! ```
//!
//! `insert`, `update` and `remove` only run through
//! `execute_backend_update_query`; the other operations only through
//! `execute_backend_query`.

use gridstore_core::{Document, GridError, Value};
use serde::{Deserialize, Serialize};

use crate::client::FindOptions;

/// What a query does with the matching documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperation {
    Find,
    FindOne,
    /// Yields one tuple whose column `n` holds the match count.
    Count,
    /// Pipeline of `$match` on the criteria, `$project`, one `$unwind` per
    /// entry of `unwinds`, then `$sort`, `$skip` and `$limit`.
    Aggregate,
    /// Inserts the document, or each document of the array, in
    /// `update_or_insert`.
    Insert,
    /// Applies `update_or_insert` to the first match, or to every match
    /// with the `multi` option. The `upsert` option creates a document.
    Update,
    /// Deletes every match, or only the first with the `just_one` option.
    Remove,
}

impl QueryOperation {
    /// Whether the operation writes and reports an affected count.
    pub fn is_update(self) -> bool {
        matches!(self, QueryOperation::Insert | QueryOperation::Update | QueryOperation::Remove)
    }
}

/// Flags of a write query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    pub upsert: bool,
    pub multi: bool,
    pub just_one: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    /// Target collection. When absent, the single entity type passed to
    /// the executor decides.
    #[serde(default)]
    pub collection: Option<String>,
    pub operation: QueryOperation,
    #[serde(default)]
    pub criteria: Document,
    #[serde(default)]
    pub projection: Vec<String>,
    #[serde(default)]
    pub order_by: Document,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Array fields unwound by an aggregation, in order.
    #[serde(default)]
    pub unwinds: Vec<String>,
    /// Update document, or document(s) to insert.
    #[serde(default)]
    pub update_or_insert: Option<Value>,
    #[serde(default)]
    pub options: WriteOptions,
}

impl DocumentQuery {
    fn with_operation(operation: QueryOperation, criteria: Document) -> Self {
        DocumentQuery {
            collection: None,
            operation,
            criteria,
            projection: Vec::new(),
            order_by: Document::new(),
            skip: None,
            limit: None,
            unwinds: Vec::new(),
            update_or_insert: None,
            options: WriteOptions::default(),
        }
    }

    pub fn find(criteria: Document) -> Self {
        Self::with_operation(QueryOperation::Find, criteria)
    }

    pub fn find_one(criteria: Document) -> Self {
        Self::with_operation(QueryOperation::FindOne, criteria)
    }

    pub fn count(criteria: Document) -> Self {
        Self::with_operation(QueryOperation::Count, criteria)
    }

    pub fn aggregate(criteria: Document) -> Self {
        Self::with_operation(QueryOperation::Aggregate, criteria)
    }

    pub fn insert(documents: Value) -> Self {
        let mut query = Self::with_operation(QueryOperation::Insert, Document::new());
        query.update_or_insert = Some(documents);
        query
    }

    pub fn update(criteria: Document, update: Document) -> Self {
        let mut query = Self::with_operation(QueryOperation::Update, criteria);
        query.update_or_insert = Some(Value::Object(update));
        query
    }

    pub fn remove(criteria: Document) -> Self {
        Self::with_operation(QueryOperation::Remove, criteria)
    }

    /// Parses the JSON form of a query.
    pub fn parse(json: &str) -> Result<Self, GridError> {
        serde_json::from_str(json)
            .map_err(|e| GridError::InvalidOperation(format!("unsupported native query: {e}")))
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, order_by: Document) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn unwind(mut self, field: impl Into<String>) -> Self {
        self.unwinds.push(field.into());
        self
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// Stages of an `aggregate` query.
    pub(crate) fn pipeline(&self) -> Vec<Document> {
        let mut pipeline = Vec::new();
        let mut stage = |operator: &str, argument: Value| {
            let mut document = Document::new();
            document.insert(operator.to_string(), argument);
            pipeline.push(document);
        };
        stage("$match", Value::Object(self.criteria.clone()));
        if !self.projection.is_empty() {
            let fields = self
                .projection
                .iter()
                .map(|field| (field.clone(), Value::from(1)))
                .collect();
            stage("$project", Value::Object(fields));
        }
        for field in &self.unwinds {
            stage("$unwind", Value::String(format!("${field}")));
        }
        if !self.order_by.is_empty() {
            stage("$sort", Value::Object(self.order_by.clone()));
        }
        if let Some(skip) = self.skip {
            stage("$skip", Value::from(skip));
        }
        if let Some(limit) = self.limit {
            stage("$limit", Value::from(limit));
        }
        pipeline
    }

    /// The update document of an `update` query.
    pub(crate) fn update_document(&self) -> Result<&Document, GridError> {
        self.update_or_insert
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| GridError::InvalidOperation("update query without an update document".to_string()))
    }

    /// The documents of an `insert` query.
    pub(crate) fn insert_documents(&self) -> Result<Vec<Document>, GridError> {
        let invalid = || GridError::InvalidOperation("insert query expects a document or an array of documents".to_string());
        match &self.update_or_insert {
            Some(Value::Object(document)) => Ok(vec![document.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_object().cloned().ok_or_else(invalid))
                .collect(),
            _ => Err(invalid()),
        }
    }

    pub(crate) fn find_options(&self) -> FindOptions {
        FindOptions {
            projection: self.projection.clone(),
            order_by: self.order_by.clone(),
            skip: self.skip,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_json_form() {
        let query = DocumentQuery::parse(
            r#"{"collection": "Person", "operation": "find_one", "criteria": {"name": "Ada"}}"#,
        )
        .unwrap();
        assert_eq!(query.collection.as_deref(), Some("Person"));
        assert_eq!(query.operation, QueryOperation::FindOne);
        assert_eq!(query.criteria.get("name"), Some(&json!("Ada")));
        assert!(query.projection.is_empty());
    }

    #[test]
    fn rejects_unknown_operations() {
        let err = DocumentQuery::parse(r#"{"operation": "map_reduce"}"#).unwrap_err();
        assert!(matches!(err, GridError::InvalidOperation(_)));
    }

    #[test]
    fn parses_write_queries() {
        let query = DocumentQuery::parse(
            r#"{"collection": "Person", "operation": "update", "criteria": {"age": {"$gt": 30}},
                "update_or_insert": {"$set": {"senior": true}}, "options": {"multi": true}}"#,
        )
        .unwrap();
        assert!(query.operation.is_update());
        assert!(query.options.multi);
        assert!(!query.options.upsert);
        assert_eq!(query.update_document().unwrap().get("$set"), Some(&json!({"senior": true})));

        let insert = DocumentQuery::insert(json!([{"name": "Ada"}, {"name": "Grace"}]));
        assert_eq!(insert.insert_documents().unwrap().len(), 2);
        assert!(DocumentQuery::insert(json!(1)).insert_documents().is_err());
        assert!(!QueryOperation::Aggregate.is_update());
    }

    #[test]
    fn aggregate_pipeline_follows_query_fields() {
        let criteria = match json!({"age": {"$gt": 30}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let query = DocumentQuery::aggregate(criteria)
            .with_projection(["tags"])
            .unwind("tags")
            .skip(1)
            .limit(2);
        let stages: Vec<Value> = query.pipeline().into_iter().map(Value::Object).collect();
        assert_eq!(
            stages,
            vec![
                json!({"$match": {"age": {"$gt": 30}}}),
                json!({"$project": {"tags": 1}}),
                json!({"$unwind": "$tags"}),
                json!({"$skip": 1}),
                json!({"$limit": 2}),
            ]
        );
    }
}
