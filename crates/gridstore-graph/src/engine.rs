//! In-memory property graph engine.
//!
//! [`Graph`] is a `StableGraph` of labeled nodes and typed relationships,
//! both carrying a property document, plus a set of unique constraints on
//! (label, property) pairs. Each constraint keeps a value index, so unique
//! lookups and checks do not scan the graph.
//!
//! [`GraphDatabase`] wraps it in serializable transactions: reads share a
//! lock, writes mutate the graph in place while journaling the inverse of
//! every change. A failed transaction replays the journal backwards.
//!
//! Replaying relies on `StableGraph` handing out freed indices last in,
//! first out: undoing a deletion after every later change has been undone
//! gives the node or relationship back its old index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use indexmap::IndexMap;
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use gridstore_core::{Document, GridError, Value};

/// Label of every entity node.
pub const ENTITY: &str = "ENTITY";
/// Label of embedded value nodes and embedded collection elements.
pub const EMBEDDED: &str = "EMBEDDED";
/// Label of sequence counter nodes.
pub const SEQUENCE: &str = "SEQUENCE";

pub type Labels = SmallVec<[String; 2]>;

/// Stable node identifier. Maps to a petgraph `NodeIndex<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Stable relationship identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelId(pub u32);

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

impl From<EdgeIndex<u32>> for RelId {
    fn from(idx: EdgeIndex<u32>) -> Self {
        RelId(idx.index() as u32)
    }
}

impl From<RelId> for EdgeIndex<u32> {
    fn from(id: RelId) -> Self {
        EdgeIndex::new(id.0 as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub labels: Labels,
    pub properties: Document,
}

impl Node {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub rel_type: String,
    pub properties: Document,
}

/// One row of an embedded traversal: the relationship types walked from
/// the owner and the node reached at the end of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedPath {
    pub rel_types: Vec<String>,
    pub terminal: NodeId,
}

impl EmbeddedPath {
    /// Dotted column prefix of the terminal node (`address.geo`).
    pub fn column_prefix(&self) -> String {
        self.rel_types.join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UniqueConstraint {
    label: String,
    property: String,
}

impl UniqueConstraint {
    fn new(label: &str, property: &str) -> Self {
        UniqueConstraint {
            label: label.to_string(),
            property: property.to_string(),
        }
    }
}

/// Unique values of one constraint and the node holding each.
type ValueIndex = HashMap<String, NodeIndex<u32>>;

fn index_key(value: &Value) -> String {
    value.to_string()
}

/// Inverse of one change made inside a transaction.
#[derive(Debug, Clone)]
enum Undo {
    NodeCreated(NodeIndex<u32>),
    NodeDeleted(NodeIndex<u32>, Node),
    /// Properties of the node before its first change in the transaction.
    PropertiesChanged(NodeIndex<u32>, Document),
    RelationshipCreated(EdgeIndex<u32>),
    RelationshipDeleted {
        index: EdgeIndex<u32>,
        from: NodeIndex<u32>,
        to: NodeIndex<u32>,
        relationship: Relationship,
    },
    ConstraintAdded(UniqueConstraint),
}

#[derive(Debug, Clone, Default)]
struct Journal {
    undo: Vec<Undo>,
    saved_properties: HashSet<NodeIndex<u32>>,
}

/// The property graph itself. All mutations go through its methods so
/// unique constraints hold after every call.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: StableGraph<Node, Relationship, Directed, u32>,
    unique: IndexMap<UniqueConstraint, ValueIndex>,
    journal: Option<Journal>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn relationship_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id.into())
    }

    pub fn relationship(&self, id: RelId) -> Option<&Relationship> {
        self.graph.edge_weight(id.into())
    }

    /// Every node carrying `label`, in index order.
    pub fn nodes_with_label(&self, label: &str) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|idx| self.graph[*idx].has_label(label))
            .map(NodeId::from)
            .collect()
    }

    /// Nodes carrying `label` whose properties equal every entry of `filter`.
    ///
    /// A filter on a unique property is answered from its index.
    pub fn find_nodes(&self, label: &str, filter: &Document) -> Vec<NodeId> {
        let matches = |idx: NodeIndex<u32>| {
            self.graph
                .node_weight(idx)
                .is_some_and(|node| node.has_label(label) && filter.iter().all(|(k, v)| node.property(k) == Some(v)))
        };
        if let Some(candidate) = self.unique_lookup(label, filter) {
            return candidate.filter(|idx| matches(*idx)).map(NodeId::from).into_iter().collect();
        }
        self.graph
            .node_indices()
            .filter(|idx| matches(*idx))
            .map(NodeId::from)
            .collect()
    }

    pub fn find_node(&self, label: &str, filter: &Document) -> Option<NodeId> {
        self.find_nodes(label, filter).into_iter().next()
    }

    /// `Some` when `filter` names a unique property of `label`: the node
    /// holding that value, if any.
    fn unique_lookup(&self, label: &str, filter: &Document) -> Option<Option<NodeIndex<u32>>> {
        filter.iter().find_map(|(property, value)| {
            let entries = self.unique.get(&UniqueConstraint::new(label, property))?;
            Some(entries.get(&index_key(value)).copied())
        })
    }

    // -----------------------------------------------------------------------
    // Constraints
    // -----------------------------------------------------------------------

    /// Declares `property` unique among nodes labeled `label`. Idempotent.
    ///
    /// Existing nodes are indexed but not validated; of two existing nodes
    /// sharing a value, the first one is indexed.
    pub fn add_unique_constraint(&mut self, label: &str, property: &str) {
        let constraint = UniqueConstraint::new(label, property);
        if self.unique.contains_key(&constraint) {
            return;
        }
        tracing::debug!(label, property, "adding unique constraint");
        let mut entries = ValueIndex::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            if !node.has_label(label) {
                continue;
            }
            if let Some(value) = node.property(property) {
                entries.entry(index_key(value)).or_insert(idx);
            }
        }
        self.unique.insert(constraint.clone(), entries);
        self.record(Undo::ConstraintAdded(constraint));
    }

    pub fn has_unique_constraint(&self, label: &str, property: &str) -> bool {
        self.unique.contains_key(&UniqueConstraint::new(label, property))
    }

    fn check_unique(&self, labels: &[String], property: &str, value: &Value, except: Option<NodeId>) -> Result<(), GridError> {
        let key = index_key(value);
        for (constraint, entries) in &self.unique {
            if constraint.property != property || !labels.contains(&constraint.label) {
                continue;
            }
            if entries.get(&key).is_some_and(|idx| Some(NodeId::from(*idx)) != except) {
                return Err(GridError::TupleAlreadyExists {
                    table: constraint.label.clone(),
                    key: format!("{property}={value}"),
                });
            }
        }
        Ok(())
    }

    fn index_node(&mut self, idx: NodeIndex<u32>) {
        let Some(node) = self.graph.node_weight(idx) else {
            return;
        };
        for (constraint, entries) in self.unique.iter_mut() {
            if !node.has_label(&constraint.label) {
                continue;
            }
            if let Some(value) = node.property(&constraint.property) {
                entries.insert(index_key(value), idx);
            }
        }
    }

    fn unindex_node(&mut self, idx: NodeIndex<u32>) {
        let Some(node) = self.graph.node_weight(idx) else {
            return;
        };
        for (constraint, entries) in self.unique.iter_mut() {
            if !node.has_label(&constraint.label) {
                continue;
            }
            if let Some(value) = node.property(&constraint.property) {
                let key = index_key(value);
                if entries.get(&key) == Some(&idx) {
                    entries.remove(&key);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    fn begin(&mut self) {
        self.journal = Some(Journal::default());
    }

    fn commit(&mut self) -> usize {
        self.journal.take().map_or(0, |journal| journal.undo.len())
    }

    /// Undoes every change since `begin`, newest first. Returns how many
    /// changes were undone.
    fn rollback(&mut self) -> usize {
        let Some(journal) = self.journal.take() else {
            return 0;
        };
        let undone = journal.undo.len();
        for undo in journal.undo.into_iter().rev() {
            self.apply_undo(undo);
        }
        undone
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.undo.push(undo);
        }
    }

    /// Journals the properties of `idx` before its first change.
    fn save_properties(&mut self, idx: NodeIndex<u32>) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if !journal.saved_properties.insert(idx) {
            return;
        }
        if let Some(node) = self.graph.node_weight(idx) {
            journal.undo.push(Undo::PropertiesChanged(idx, node.properties.clone()));
        }
    }

    fn apply_undo(&mut self, undo: Undo) {
        match undo {
            Undo::NodeCreated(idx) => {
                self.unindex_node(idx);
                self.graph.remove_node(idx);
            }
            Undo::NodeDeleted(idx, node) => {
                let restored = self.graph.add_node(node);
                debug_assert_eq!(restored, idx, "node restored at a different index");
                self.index_node(restored);
            }
            Undo::PropertiesChanged(idx, properties) => {
                self.unindex_node(idx);
                if let Some(node) = self.graph.node_weight_mut(idx) {
                    node.properties = properties;
                }
                self.index_node(idx);
            }
            Undo::RelationshipCreated(index) => {
                self.graph.remove_edge(index);
            }
            Undo::RelationshipDeleted {
                index,
                from,
                to,
                relationship,
            } => {
                let restored = self.graph.add_edge(from, to, relationship);
                debug_assert_eq!(restored, index, "relationship restored at a different index");
            }
            Undo::ConstraintAdded(constraint) => {
                self.unique.shift_remove(&constraint);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn create_node(&mut self, labels: Labels, properties: Document) -> Result<NodeId, GridError> {
        for (name, value) in &properties {
            self.check_unique(&labels, name, value, None)?;
        }
        let idx = self.graph.add_node(Node { labels, properties });
        self.index_node(idx);
        self.record(Undo::NodeCreated(idx));
        Ok(idx.into())
    }

    pub fn set_property(&mut self, id: NodeId, name: &str, value: Value) -> Result<(), GridError> {
        let labels = self.require(id)?.labels.clone();
        self.check_unique(&labels, name, &value, Some(id))?;
        let idx = id.into();
        self.save_properties(idx);
        self.unindex_node(idx);
        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.properties.insert(name.to_string(), value);
        }
        self.index_node(idx);
        Ok(())
    }

    pub fn remove_property(&mut self, id: NodeId, name: &str) -> Option<Value> {
        let idx = id.into();
        if self.node(id)?.property(name).is_none() {
            return None;
        }
        self.save_properties(idx);
        self.unindex_node(idx);
        let removed = self
            .graph
            .node_weight_mut(idx)
            .and_then(|node| node.properties.shift_remove(name));
        self.index_node(idx);
        removed
    }

    pub fn create_relationship(
        &mut self,
        from: NodeId,
        to: NodeId,
        rel_type: &str,
        properties: Document,
    ) -> Result<RelId, GridError> {
        self.require(from)?;
        self.require(to)?;
        let relationship = Relationship {
            rel_type: rel_type.to_string(),
            properties,
        };
        let index = self.graph.add_edge(from.into(), to.into(), relationship);
        self.record(Undo::RelationshipCreated(index));
        Ok(index.into())
    }

    pub fn delete_relationship(&mut self, id: RelId) -> bool {
        let index = id.into();
        let Some((from, to)) = self.graph.edge_endpoints(index) else {
            return false;
        };
        let Some(relationship) = self.graph.remove_edge(index) else {
            return false;
        };
        self.record(Undo::RelationshipDeleted {
            index,
            from,
            to,
            relationship,
        });
        true
    }

    /// Removes a node together with every relationship touching it.
    pub fn delete_node(&mut self, id: NodeId) -> bool {
        let idx: NodeIndex<u32> = id.into();
        if self.graph.node_weight(idx).is_none() {
            return false;
        }
        // Relationships go one by one so each is journaled.
        let mut touching: Vec<EdgeIndex<u32>> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .chain(self.graph.edges_directed(idx, Direction::Incoming))
            .map(|edge| edge.id())
            .collect();
        touching.sort();
        touching.dedup();
        for index in touching {
            self.delete_relationship(index.into());
        }
        self.unindex_node(idx);
        match self.graph.remove_node(idx) {
            Some(node) => {
                self.record(Undo::NodeDeleted(idx, node));
                true
            }
            None => false,
        }
    }

    fn require(&self, id: NodeId) -> Result<&Node, GridError> {
        self.node(id)
            .ok_or_else(|| GridError::InvalidOperation(format!("node {} does not exist", id.0)))
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Outgoing relationships of `from`, optionally restricted to one type,
    /// with their end nodes. Oldest first.
    pub fn outgoing(&self, from: NodeId, rel_type: Option<&str>) -> Vec<(RelId, NodeId)> {
        let mut found: Vec<(RelId, NodeId)> = self
            .graph
            .edges_directed(from.into(), Direction::Outgoing)
            .filter(|edge| rel_type.map_or(true, |t| edge.weight().rel_type == t))
            .map(|edge| (RelId::from(edge.id()), NodeId::from(edge.target())))
            .collect();
        found.sort_by_key(|(rel, _)| rel.0);
        found
    }

    pub fn has_outgoing(&self, from: NodeId) -> bool {
        self.graph
            .edges_directed(from.into(), Direction::Outgoing)
            .next()
            .is_some()
    }

    /// Walks the embedded value nodes hanging off `owner`.
    ///
    /// Each reached node yields one row: the first relationship and node,
    /// then any deeper chain down to the terminal node. Only nodes whose
    /// sole label is [`EMBEDDED`] are followed, so association elements
    /// and other entities are left out.
    pub fn traverse_embedded(&self, owner: NodeId) -> Vec<EmbeddedPath> {
        let mut rows = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<(NodeId, Vec<String>)> = vec![(owner, Vec::new())];
        while let Some((current, path)) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for (rel, target) in self.outgoing(current, None) {
                if !self.node(target).is_some_and(is_embedded_value) {
                    continue;
                }
                let Some(relationship) = self.relationship(rel) else {
                    continue;
                };
                let mut rel_types = path.clone();
                rel_types.push(relationship.rel_type.clone());
                rows.push(EmbeddedPath {
                    rel_types: rel_types.clone(),
                    terminal: target,
                });
                stack.push((target, rel_types));
            }
        }
        rows
    }

    /// Every `EMBEDDED` node reachable from `owner` through outgoing
    /// relationships, values and collection elements alike.
    pub fn embedded_subtree(&self, owner: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack = vec![owner];
        let mut visited: HashSet<NodeId> = HashSet::new();
        while let Some(current) = stack.pop() {
            for (_, target) in self.outgoing(current, None) {
                if visited.insert(target) && self.node(target).is_some_and(|n| n.has_label(EMBEDDED)) {
                    found.push(target);
                    stack.push(target);
                }
            }
        }
        found
    }
}

/// An embedded value node, as opposed to a collection element which also
/// carries its association table as a label.
pub fn is_embedded_value(node: &Node) -> bool {
    node.labels.len() == 1 && node.has_label(EMBEDDED)
}

/// Counters of transactions run against a [`GraphDatabase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub reads: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

/// A [`Graph`] shared between threads, accessed through transactions.
#[derive(Debug, Default)]
pub struct GraphDatabase {
    graph: RwLock<Graph>,
    reads: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl GraphDatabase {
    pub fn new() -> Self {
        GraphDatabase::default()
    }

    /// Runs `f` against the committed graph. Reads see no uncommitted state.
    pub fn read<T>(&self, f: impl FnOnce(&Graph) -> T) -> T {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        f(&graph)
    }

    /// Runs `f` in a write transaction.
    ///
    /// Write transactions are serialized. Changes made by `f` stay when it
    /// returns `Ok` and are undone otherwise.
    pub fn write<T>(&self, f: impl FnOnce(&mut Graph) -> Result<T, GridError>) -> Result<T, GridError> {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        // Left behind by a transaction that panicked.
        let abandoned = graph.rollback();
        if abandoned > 0 {
            tracing::warn!(changes = abandoned, "rolled back abandoned transaction");
        }
        graph.begin();
        match f(&mut graph) {
            Ok(value) => {
                let changes = graph.commit();
                self.commits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(changes, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                let undone = graph.rollback();
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, undone, "transaction rolled back");
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            reads: self.reads.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Builds a label set.
pub fn labels<I, S>(names: I) -> Labels
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}
