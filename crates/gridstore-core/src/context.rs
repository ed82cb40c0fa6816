//! Per-call contexts handed to dialect operations.
//!
//! Type contexts are owned and cheap to clone; they travel with queued
//! operations. Call contexts borrow the caller's unit-of-work state.

use serde::{Deserialize, Serialize};

use crate::options::{AssociationOptions, EntityOptions};
use crate::queue::OperationsQueue;
use crate::tuple::Tuple;

/// Information about one entity type relevant to reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleTypeContext {
    /// Columns a read should fetch. Empty means every column.
    pub selectable_columns: Vec<String>,
    pub options: EntityOptions,
}

impl TupleTypeContext {
    pub fn new<I, S>(selectable_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TupleTypeContext {
            selectable_columns: selectable_columns.into_iter().map(Into::into).collect(),
            options: EntityOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }
}

/// Context of a single tuple operation.
#[derive(Debug, Clone, Copy)]
pub struct TupleContext<'a> {
    pub type_context: &'a TupleTypeContext,
    /// Pending writes of the current unit of work, if any.
    pub operations_queue: Option<&'a OperationsQueue>,
}

impl<'a> TupleContext<'a> {
    pub fn new(type_context: &'a TupleTypeContext) -> Self {
        TupleContext {
            type_context,
            operations_queue: None,
        }
    }

    pub fn with_queue(mut self, queue: &'a OperationsQueue) -> Self {
        self.operations_queue = Some(queue);
        self
    }

    pub fn selectable_columns(&self) -> &'a [String] {
        &self.type_context.selectable_columns
    }

    pub fn options(&self) -> &'a EntityOptions {
        &self.type_context.options
    }
}

/// Information about one association type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationTypeContext {
    pub options: AssociationOptions,
}

impl AssociationTypeContext {
    pub fn new(options: AssociationOptions) -> Self {
        AssociationTypeContext { options }
    }
}

/// Context of a single association operation.
#[derive(Debug)]
pub struct AssociationContext<'a> {
    pub type_context: AssociationTypeContext,
    /// Tuple of the owning entity, when the caller holds it.
    pub entity_tuple: Option<&'a mut Tuple>,
    /// Pending writes of the current unit of work, executed before reads.
    pub operations_queue: Option<&'a mut OperationsQueue>,
}

impl<'a> AssociationContext<'a> {
    pub fn new(type_context: AssociationTypeContext) -> Self {
        AssociationContext {
            type_context,
            entity_tuple: None,
            operations_queue: None,
        }
    }

    pub fn with_entity_tuple(mut self, tuple: &'a mut Tuple) -> Self {
        self.entity_tuple = Some(tuple);
        self
    }

    pub fn with_queue(mut self, queue: &'a mut OperationsQueue) -> Self {
        self.operations_queue = Some(queue);
        self
    }

    pub fn options(&self) -> &AssociationOptions {
        &self.type_context.options
    }
}
