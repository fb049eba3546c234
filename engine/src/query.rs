//! Query evaluation: predicates, free-text search, sorting and paging.
//!
//! Execution order is fixed:
//!
//! 1. candidate selection ([`plan`] picks an index or a full scan)
//! 2. predicates (all of them, including the one the index served)
//! 3. free-text search
//! 4. `total_count` is captured here, before sorting and paging
//! 5. stable multi-key sort
//! 6. `skip`, then `take`
//!
//! String comparisons are case-insensitive throughout.

use crate::{index::compare_numbers, CollectionName, IndexDef, IndexKey, Item};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A comparison applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum Comparison {
    Equals(Value),
    In(Vec<Value>),
    Not(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    /// Substring for strings, membership for arrays
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
}

/// `field <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub field: String,
    pub op: Comparison,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Comparison) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        let value = item.field(&self.field);
        evaluate(value.as_deref(), &self.op)
    }
}

/// Case-insensitive substring search over a set of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Search {
    pub text: String,
    /// Fields to search. Empty means every top-level field of the data.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Search {
    pub fn matches(&self, item: &Item) -> bool {
        let needle = self.text.to_lowercase();
        if needle.is_empty() {
            return true;
        }
        if self.fields.is_empty() {
            return item
                .data
                .as_object()
                .map(|map| map.values().any(|v| text_contains(v, &needle)))
                .unwrap_or(false);
        }
        self.fields.iter().any(|field| {
            item.field(field)
                .map(|v| text_contains(v.as_ref(), &needle))
                .unwrap_or(false)
        })
    }
}

fn text_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Number(n) => n.to_string().contains(needle),
        Value::Array(items) => items.iter().any(|v| text_contains(v, needle)),
        _ => false,
    }
}

/// Sort direction for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// A complete query over one collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub collection: CollectionName,
    #[serde(default)]
    pub filter: Vec<Predicate>,
    #[serde(default)]
    pub search: Option<Search>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub take: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl QuerySpec {
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: Comparison) -> Self {
        self.filter.push(Predicate::new(field, op));
        self
    }

    pub fn search(mut self, text: impl Into<String>, fields: &[&str]) -> Self {
        self.search = Some(Search {
            text: text.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn accepts(&self, item: &Item) -> bool {
        (self.include_deleted || item.is_active())
            && self.filter.iter().all(|p| p.matches(item))
            && self.search.as_ref().map_or(true, |s| s.matches(item))
    }
}

/// Items of one page plus the number of matches before paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub items: Vec<Item>,
    pub total_count: usize,
}

/// How candidates are fetched from storage.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Fetch only items whose `index` holds `key`.
    IndexLookup { index: String, key: IndexKey },
    /// Fetch every item of the collection.
    FullScan,
}

/// Choose an index: used only when exactly one plain equality predicate
/// targets a declared index with an indexable value.
pub fn plan(spec: &QuerySpec, indexes: &[IndexDef]) -> QueryPlan {
    let mut usable = spec.filter.iter().filter_map(|predicate| {
        let Comparison::Equals(value) = &predicate.op else {
            return None;
        };
        let def = indexes.iter().find(|d| d.key_path == predicate.field)?;
        let key = IndexKey::from_value(value)?;
        Some((def.name.clone(), key))
    });

    match (usable.next(), usable.next()) {
        (Some((index, key)), None) => QueryPlan::IndexLookup { index, key },
        _ => QueryPlan::FullScan,
    }
}

/// Run steps 2–6 over candidates fetched according to [`plan`].
pub fn execute(candidates: Vec<Item>, spec: &QuerySpec) -> QueryResult {
    let mut matched: Vec<Item> = candidates
        .into_iter()
        .filter(|item| spec.accepts(item))
        .collect();
    let total_count = matched.len();

    sort_items(&mut matched, &spec.sort);

    let skip = spec.skip.unwrap_or(0);
    let items: Vec<Item> = match spec.take {
        Some(take) => matched.into_iter().skip(skip).take(take).collect(),
        None => matched.into_iter().skip(skip).collect(),
    };

    QueryResult { items, total_count }
}

/// Stable multi-key sort. Missing and null values go last when ascending
/// and first when descending.
pub fn sort_items(items: &mut [Item], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    items.sort_by(|a, b| {
        for key in sort {
            let va = a.field(&key.field);
            let vb = b.field(&key.field);
            let cmp = compare_sort_values(va.as_deref(), vb.as_deref());
            if cmp != Ordering::Equal {
                return match key.direction {
                    SortDirection::Asc => cmp,
                    SortDirection::Desc => cmp.reverse(),
                };
            }
        }
        Ordering::Equal
    });
}

fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

/// Total order over JSON values used for sorting.
///
/// Numbers compare numerically, strings case-insensitively, booleans `false < true`; across types the rank is
/// bool < number < string < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Equality with the query semantics: case-insensitive strings, numeric
/// numbers, missing equals null, deep equality otherwise.
pub fn values_equal(field: Option<&Value>, operand: &Value) -> bool {
    let field = field.unwrap_or(&Value::Null);
    match (field, operand) {
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b) == Ordering::Equal,
        _ => field == operand,
    }
}

/// Ordering for range operators; `None` when the values are not comparable.
fn order(field: &Value, operand: &Value) -> Option<Ordering> {
    match (field, operand) {
        (Value::Number(_), Value::Number(_)) | (Value::Bool(_), Value::Bool(_)) => {
            Some(compare_values(field, operand))
        }
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => None,
    }
}

fn evaluate(field: Option<&Value>, op: &Comparison) -> bool {
    match op {
        Comparison::Equals(v) => values_equal(field, v),
        Comparison::Not(v) => !values_equal(field, v),
        Comparison::In(values) => values.iter().any(|v| values_equal(field, v)),
        Comparison::Lt(v) => field.and_then(|f| order(f, v)) == Some(Ordering::Less),
        Comparison::Lte(v) => matches!(
            field.and_then(|f| order(f, v)),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Comparison::Gt(v) => field.and_then(|f| order(f, v)) == Some(Ordering::Greater),
        Comparison::Gte(v) => matches!(
            field.and_then(|f| order(f, v)),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Comparison::Contains(v) => match (field, v) {
            (Some(Value::String(s)), Value::String(needle)) => {
                s.to_lowercase().contains(&needle.to_lowercase())
            }
            (Some(Value::Array(items)), needle) => {
                items.iter().any(|item| values_equal(Some(item), needle))
            }
            _ => false,
        },
        Comparison::StartsWith(prefix) => lowered(field)
            .map(|s| s.starts_with(&prefix.to_lowercase()))
            .unwrap_or(false),
        Comparison::EndsWith(suffix) => lowered(field)
            .map(|s| s.ends_with(&suffix.to_lowercase()))
            .unwrap_or(false),
    }
}

fn lowered(field: Option<&Value>) -> Option<String> {
    field.and_then(Value::as_str).map(str::to_lowercase)
}
