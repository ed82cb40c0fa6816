//! Evaluation of query criteria and update operators over documents.
//!
//! Criteria support equality on dotted paths plus `$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$and` and `$or`.
//! Updates support `$set`, `$unset`, `$inc` and `$setOnInsert`; an update
//! without operators replaces the document. Aggregation pipelines support
//! the `$match`, `$project`, `$unwind`, `$sort`, `$skip` and `$limit` stages.

use std::cmp::Ordering;

use gridstore_core::value::{get_path, remove_path, set_path};
use gridstore_core::{Document, GridError, Value};

use crate::mapping::ID_FIELD;

/// Whether `document` satisfies `filter`.
pub fn matches(document: &Document, filter: &Document) -> Result<bool, GridError> {
    for (field, condition) in filter {
        let ok = match field.as_str() {
            "$and" => {
                let mut all = true;
                for sub in subfilters(field, condition)? {
                    if !matches(document, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in subfilters(field, condition)? {
                    if matches(document, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            other if other.starts_with('$') => {
                return Err(GridError::InvalidOperation(format!(
                    "unsupported query operator '{other}'"
                )))
            }
            path => field_matches(get_path(document, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn subfilters<'a>(operator: &str, condition: &'a Value) -> Result<Vec<&'a Document>, GridError> {
    let invalid = || GridError::InvalidOperation(format!("'{operator}' expects an array of documents"));
    condition
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|item| item.as_object().ok_or_else(invalid))
        .collect()
}

/// Returns the condition as an operator document (`{"$gt": 3}`), if it is one.
fn operator_document(condition: &Value) -> Option<&Document> {
    match condition {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => Some(map),
        _ => None,
    }
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> Result<bool, GridError> {
    let Some(operators) = operator_document(condition) else {
        return Ok(equals(actual, condition));
    };
    for (operator, argument) in operators {
        let ok = match operator.as_str() {
            "$eq" => equals(actual, argument),
            "$ne" => !equals(actual, argument),
            "$gt" => compares(actual, argument, |o| o == Ordering::Greater),
            "$gte" => compares(actual, argument, |o| o != Ordering::Less),
            "$lt" => compares(actual, argument, |o| o == Ordering::Less),
            "$lte" => compares(actual, argument, |o| o != Ordering::Greater),
            "$in" => in_list(operator, actual, argument)?,
            "$nin" => !in_list(operator, actual, argument)?,
            "$exists" => actual.is_some() == argument.as_bool().unwrap_or(true),
            other => {
                return Err(GridError::InvalidOperation(format!(
                    "unsupported query operator '{other}'"
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(operator: &str, actual: Option<&Value>, argument: &Value) -> Result<bool, GridError> {
    let candidates = argument
        .as_array()
        .ok_or_else(|| GridError::InvalidOperation(format!("'{operator}' expects an array")))?;
    Ok(candidates.iter().any(|candidate| equals(actual, candidate)))
}

/// Equality with array membership: a field holding an array matches any
/// of its elements. A missing field equals `null`.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|item| values_equal(item, expected)),
        Some(value) => values_equal(value, expected),
    }
}

/// Structural equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn compares(actual: Option<&Value>, argument: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|value| partial_compare(value, argument))
        .is_some_and(accept)
}

/// Ordering between two values of the same kind.
fn partial_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: values of different kinds order by kind.
pub fn total_compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => partial_compare(x, y).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sorts by `order_by` (`{"field": 1 | -1, ...}`), keeping ties stable.
pub fn sort_documents(documents: &mut [Document], order_by: &Document) {
    if order_by.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        for (field, direction) in order_by {
            let ordering = total_compare(get_path(a, field), get_path(b, field));
            let ordering = if direction.as_i64().unwrap_or(1) < 0 {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Keeps `_id` and the listed fields. An empty list keeps everything.
pub fn project(document: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return document.clone();
    }
    let mut projected = Document::new();
    if let Some(id) = document.get(ID_FIELD) {
        projected.insert(ID_FIELD.to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = get_path(document, field) {
            set_path(&mut projected, field, value.clone());
        }
    }
    projected
}

/// Whether `update` is a replacement document rather than operators.
pub fn is_replacement(update: &Document) -> bool {
    !update.is_empty() && update.keys().all(|k| !k.starts_with('$'))
}

/// Document created by an upsert before the update is applied: the
/// equality fields of the filter.
pub fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (field, condition) in filter {
        if field.starts_with('$') || operator_document(condition).is_some() {
            continue;
        }
        set_path(&mut seed, field, condition.clone());
    }
    seed
}

/// Applies `update` to `document`. `inserting` enables `$setOnInsert`.
pub fn apply_update(document: &mut Document, update: &Document, inserting: bool) -> Result<(), GridError> {
    if is_replacement(update) {
        let id = document.get(ID_FIELD).cloned();
        *document = update.clone();
        if let Some(id) = id {
            document.insert(ID_FIELD.to_string(), id);
        }
        return Ok(());
    }
    for (operator, fields) in update {
        let fields = fields
            .as_object()
            .ok_or_else(|| GridError::InvalidOperation(format!("'{operator}' expects a document")))?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(document, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(document, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let incremented = increment(get_path(document, path), delta, path)?;
                    set_path(document, path, incremented);
                }
            }
            other => {
                return Err(GridError::InvalidOperation(format!(
                    "unsupported update operator '{other}'"
                )))
            }
        }
    }
    Ok(())
}

/// Runs an aggregation pipeline over `documents`, stage by stage.
pub fn run_pipeline(mut documents: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>, GridError> {
    for stage in pipeline {
        let mut operators = stage.iter();
        let (Some((operator, argument)), None) = (operators.next(), operators.next()) else {
            return Err(GridError::InvalidOperation(
                "a pipeline stage must hold exactly one operator".to_string(),
            ));
        };
        documents = match operator.as_str() {
            "$match" => {
                let filter = stage_document(operator, argument)?;
                let mut kept = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            "$project" => {
                let spec = stage_document(operator, argument)?;
                documents.iter().map(|document| project_stage(document, spec)).collect()
            }
            "$unwind" => {
                let path = argument
                    .as_str()
                    .and_then(|p| p.strip_prefix('$'))
                    .ok_or_else(|| GridError::InvalidOperation("'$unwind' expects a '$field' path".to_string()))?;
                documents.into_iter().flat_map(|document| unwind(document, path)).collect()
            }
            "$sort" => {
                sort_documents(&mut documents, stage_document(operator, argument)?);
                documents
            }
            "$skip" => {
                let n = stage_count(operator, argument)?;
                documents.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = stage_count(operator, argument)?;
                documents.into_iter().take(n).collect()
            }
            other => {
                return Err(GridError::InvalidOperation(format!(
                    "unsupported pipeline stage '{other}'"
                )))
            }
        };
    }
    Ok(documents)
}

fn stage_document<'a>(operator: &str, argument: &'a Value) -> Result<&'a Document, GridError> {
    argument
        .as_object()
        .ok_or_else(|| GridError::InvalidOperation(format!("'{operator}' expects a document")))
}

fn stage_count(operator: &str, argument: &Value) -> Result<usize, GridError> {
    argument
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| GridError::InvalidOperation(format!("'{operator}' expects a non-negative integer")))
}

/// Inclusion projection. `_id` is kept unless excluded with `0` or `false`.
fn project_stage(document: &Document, spec: &Document) -> Document {
    let excluded = |value: &Value| matches!(value, Value::Bool(false)) || value.as_i64() == Some(0);
    let mut projected = Document::new();
    if !spec.get(ID_FIELD).is_some_and(excluded) {
        if let Some(id) = document.get(ID_FIELD) {
            projected.insert(ID_FIELD.to_string(), id.clone());
        }
    }
    for (field, value) in spec {
        if field == ID_FIELD || excluded(value) {
            continue;
        }
        if let Some(found) = get_path(document, field) {
            set_path(&mut projected, field, found.clone());
        }
    }
    projected
}

/// One document per element of the array at `path`. Missing or empty
/// arrays drop the document; scalars pass through unchanged.
fn unwind(document: Document, path: &str) -> Vec<Document> {
    let items = match get_path(&document, path) {
        Some(Value::Array(items)) => Some(items.clone()),
        Some(Value::Null) | None => Some(Vec::new()),
        Some(_) => None,
    };
    let Some(items) = items else {
        return vec![document];
    };
    items
        .into_iter()
        .map(|item| {
            let mut copy = document.clone();
            set_path(&mut copy, path, item);
            copy
        })
        .collect()
}

fn increment(current: Option<&Value>, delta: &Value, path: &str) -> Result<Value, GridError> {
    let non_numeric = || GridError::InvalidOperation(format!("cannot apply $inc to non-numeric field '{path}'"));
    let Value::Number(delta) = delta else {
        return Err(non_numeric());
    };
    let current = match current {
        None => return Ok(Value::Number(delta.clone())),
        Some(Value::Number(n)) => n,
        Some(_) => return Err(non_numeric()),
    };
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }
    match (current.as_f64(), delta.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::from(a + b)),
        _ => Err(non_numeric()),
    }
}
