//! Native queries for the graph dialect.
//!
//! A [`GraphQuery`] matches nodes by label and property equality:
//!
//! ```json
//! {"label": "Person", "properties": {"name": "Ada"}, "limit": 10}
//! ```

use serde::{Deserialize, Serialize};

use gridstore_core::{Document, GridError};

use crate::engine::{Graph, NodeId, ENTITY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    /// Label to match. When absent, the table of the single target entity
    /// type is used.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub properties: Document,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl GraphQuery {
    pub fn new() -> Self {
        GraphQuery::default()
    }

    pub fn parse(json: &str) -> Result<Self, GridError> {
        serde_json::from_str(json).map_err(|e| GridError::InvalidOperation(format!("unsupported native query: {e}")))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: gridstore_core::Value) -> Self {
        self.properties.insert(name.into(), value);
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

    /// Entity nodes carrying `label` and matching every property.
    pub(crate) fn matching_nodes(&self, graph: &Graph, label: &str) -> Vec<NodeId> {
        graph
            .find_nodes(label, &self.properties)
            .into_iter()
            .filter(|id| graph.node(*id).is_some_and(|n| n.has_label(ENTITY)))
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_json_form() {
        let query = GraphQuery::parse(r#"{"label": "Person", "properties": {"name": "Ada"}, "skip": 1}"#).unwrap();
        assert_eq!(
            query,
            GraphQuery::new().with_label("Person").with_property("name", json!("Ada")).skip(1)
        );
        assert!(GraphQuery::parse(r#"{"label": 3}"#).is_err());
    }
}
