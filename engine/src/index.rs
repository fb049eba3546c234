//! Secondary indexes over item fields.
//!
//! Only scalar values are indexed. Strings are case-folded on the way in so
//! that an index lookup returns a superset of what the case-insensitive query
//! operators accept.

use crate::{error::Result, Error, IndexDef, Item, ItemId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// A normalized, totally ordered index key.
///
/// Ordering: booleans < numbers < strings, then by value within a type.
/// Numbers compare by exact value across the integer and float variants, so
/// `0`, `0.0` and `-0.0` are one key while integers beyond 2^53 stay apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum IndexKey {
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`
    UInt(u64),
    Number(f64),
    Text(String),
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

impl IndexKey {
    /// Normalize a JSON value. Null, arrays, objects and NaN are not indexable.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Number(n) => Self::from_number(n),
            Value::String(s) => Some(IndexKey::Text(s.to_lowercase())),
            _ => None,
        }
    }

    /// Exact key for a JSON number.
    pub fn from_number(n: &serde_json::Number) -> Option<Self> {
        if let Some(i) = n.as_i64() {
            return Some(IndexKey::Int(i));
        }
        if let Some(u) = n.as_u64() {
            return Some(IndexKey::UInt(u));
        }
        n.as_f64()
            .filter(|f| !f.is_nan())
            .map(|f| IndexKey::Number(f).canonical())
    }

    /// Key of `item` under `key_path`, if the value there is indexable.
    pub fn for_item(item: &Item, key_path: &str) -> Option<Self> {
        item.field(key_path)
            .and_then(|value| IndexKey::from_value(value.as_ref()))
    }

    /// Integral floats that fit an integer variant become that variant, so
    /// equal numbers always have one representation.
    pub fn canonical(self) -> Self {
        match self {
            IndexKey::Number(f) if f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f) => {
                IndexKey::Int(f as i64)
            }
            IndexKey::Number(f) if f.fract() == 0.0 && (TWO_POW_63..TWO_POW_64).contains(&f) => {
                IndexKey::UInt(f as u64)
            }
            other => other,
        }
    }

    /// Stable rank of the key's type, used by storage backends that encode
    /// keys into columns.
    pub fn rank(&self) -> u8 {
        match self {
            IndexKey::Bool(_) => 1,
            IndexKey::Int(_) | IndexKey::UInt(_) | IndexKey::Number(_) => 2,
            IndexKey::Text(_) => 3,
        }
    }

    /// The `(rank, number, text)` column triple used by SQL backends. The
    /// triple sorts exactly like the key itself and equal keys share one
    /// triple. Integers carry their exact value as offset, zero-padded text
    /// to split values the float column cannot tell apart.
    pub fn columns(&self) -> (u8, f64, String) {
        match self.clone().canonical() {
            IndexKey::Bool(b) => (1, if b { 1.0 } else { 0.0 }, String::new()),
            IndexKey::Int(i) => (2, i as f64, offset_digits(i128::from(i))),
            IndexKey::UInt(u) => (2, u as f64, offset_digits(i128::from(u))),
            // Never equal to an integer; only 2^64 and up shares a float with one
            IndexKey::Number(f) => (2, f, "~".to_string()),
            IndexKey::Text(s) => (3, 0.0, s),
        }
    }

    fn integer(&self) -> Option<i128> {
        match self {
            IndexKey::Int(i) => Some(i128::from(*i)),
            IndexKey::UInt(u) => Some(i128::from(*u)),
            _ => None,
        }
    }
}

fn offset_digits(value: i128) -> String {
    format!("{:020}", value + (1_i128 << 63))
}

/// Exact comparison of an integer with a float.
fn cmp_integer_float(i: i128, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    if f >= TWO_POW_64 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i128)).then_with(|| {
        if f > whole {
            Ordering::Less
        } else if f < whole {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

fn cmp_numbers(a: &IndexKey, b: &IndexKey) -> Ordering {
    match (a.integer(), b.integer(), a, b) {
        (Some(x), Some(y), _, _) => x.cmp(&y),
        (Some(x), None, _, IndexKey::Number(g)) => cmp_integer_float(x, *g),
        (None, Some(y), IndexKey::Number(f), _) => cmp_integer_float(y, *f).reverse(),
        (None, None, IndexKey::Number(f), IndexKey::Number(g)) => {
            f.partial_cmp(g).unwrap_or_else(|| f.total_cmp(g))
        }
        _ => a.rank().cmp(&b.rank()),
    }
}

/// Exact numeric order of two JSON numbers, shared by index keys and query
/// operators.
pub fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    match (IndexKey::from_number(a), IndexKey::from_number(b)) {
        (Some(x), Some(y)) => cmp_numbers(&x, &y),
        (x, y) => x.is_some().cmp(&y.is_some()),
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            _ if self.rank() == 2 && other.rank() == 2 => cmp_numbers(self, other),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKey::Bool(b) => write!(f, "{b}"),
            IndexKey::Int(n) => write!(f, "{n}"),
            IndexKey::UInt(n) => write!(f, "{n}"),
            IndexKey::Number(n) => write!(f, "{n}"),
            IndexKey::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBound {
    pub key: IndexKey,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(key: IndexKey) -> Self {
        Self {
            key,
            inclusive: true,
        }
    }

    pub fn exclusive(key: IndexKey) -> Self {
        Self {
            key,
            inclusive: false,
        }
    }

    fn as_bound(&self) -> Bound<&IndexKey> {
        if self.inclusive {
            Bound::Included(&self.key)
        } else {
            Bound::Excluded(&self.key)
        }
    }
}

/// A possibly open interval of index keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
}

impl KeyRange {
    pub fn new(lower: Option<RangeBound>, upper: Option<RangeBound>) -> Self {
        Self { lower, upper }
    }

    /// Only `key` itself.
    pub fn exact(key: IndexKey) -> Self {
        Self::between(key.clone(), key)
    }

    /// `lower <= key <= upper`.
    pub fn between(lower: IndexKey, upper: IndexKey) -> Self {
        Self::new(
            Some(RangeBound::inclusive(lower)),
            Some(RangeBound::inclusive(upper)),
        )
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) if b.inclusive => key >= &b.key,
            Some(b) => key > &b.key,
        };
        let below = match &self.upper {
            None => true,
            Some(b) if b.inclusive => key <= &b.key,
            Some(b) => key < &b.key,
        };
        above && below
    }

    /// True when no key can satisfy the range.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) => match lo.key.cmp(&hi.key) {
                Ordering::Greater => true,
                Ordering::Equal => !(lo.inclusive && hi.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }
}

/// An in-memory secondary index: key -> ids of items holding that key.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    def: IndexDef,
    entries: BTreeMap<IndexKey, BTreeSet<ItemId>>,
}

impl SecondaryIndex {
    pub fn new(def: IndexDef) -> Self {
        Self {
            def,
            entries: BTreeMap::new(),
        }
    }

    /// Build an index over existing items. Fails if a unique index would be
    /// violated by the data already stored.
    pub fn build<'a>(def: IndexDef, items: impl IntoIterator<Item = &'a Item>) -> Result<Self> {
        let mut index = Self::new(def);
        for item in items {
            index.insert(item)?;
        }
        Ok(index)
    }

    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Check whether `item` could be inserted without breaking uniqueness.
    pub fn check_unique(&self, item: &Item) -> Result<()> {
        if !self.def.unique {
            return Ok(());
        }
        let Some(key) = IndexKey::for_item(item, &self.def.key_path) else {
            return Ok(());
        };
        match self.entries.get(&key) {
            Some(ids) if ids.iter().any(|id| id != &item.id) => Err(Error::UniqueViolation {
                index: self.def.name.clone(),
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, item: &Item) -> Result<()> {
        self.check_unique(item)?;
        if let Some(key) = IndexKey::for_item(item, &self.def.key_path) {
            self.entries.entry(key).or_default().insert(item.id.clone());
        }
        Ok(())
    }

    pub fn remove(&mut self, item: &Item) {
        if let Some(key) = IndexKey::for_item(item, &self.def.key_path) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&item.id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Ids stored under exactly `key`, in id order.
    pub fn lookup(&self, key: &IndexKey) -> Vec<ItemId> {
        self.entries
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids whose key falls in `range`, in key order.
    pub fn range(&self, range: &KeyRange) -> Vec<ItemId> {
        if range.is_empty() {
            return Vec::new();
        }
        let lower = range
            .lower
            .as_ref()
            .map_or(Bound::Unbounded, RangeBound::as_bound);
        let upper = range
            .upper
            .as_ref()
            .map_or(Bound::Unbounded, RangeBound::as_bound);
        self.entries
            .range::<IndexKey, _>((lower, upper))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, data: Value) -> Item {
        Item::new(id, "users", data, "t", 1)
    }

    #[test]
    fn key_ordering_across_types() {
        let t = IndexKey::Bool(true);
        let n = IndexKey::Number(-3.5);
        let s = IndexKey::Text("a".into());
        assert!(t < n);
        assert!(n < s);
        assert!(IndexKey::Number(1.0) < IndexKey::Number(2.0));
        assert_eq!(IndexKey::Number(2.0), IndexKey::from_value(&json!(2)).unwrap());
    }

    #[test]
    fn strings_are_case_folded() {
        assert_eq!(
            IndexKey::from_value(&json!("Oslo")),
            IndexKey::from_value(&json!("OSLO"))
        );
        assert!(IndexKey::from_value(&json!(null)).is_none());
        assert!(IndexKey::from_value(&json!([1])).is_none());
    }

    #[test]
    fn columns_sort_like_keys() {
        let mut keys = vec![
            IndexKey::Text("b".into()),
            IndexKey::Number(10.0),
            IndexKey::Bool(false),
            IndexKey::Number(-1.0),
            IndexKey::Text("a".into()),
        ];
        let mut by_columns = keys.clone();
        keys.sort();
        by_columns.sort_by(|a, b| {
            let (ra, na, sa) = a.columns();
            let (rb, nb, sb) = b.columns();
            ra.cmp(&rb).then(na.total_cmp(&nb)).then(sa.cmp(&sb))
        });
        assert_eq!(keys, by_columns);
    }

    #[test]
    fn equal_numbers_share_one_key() {
        let zero = IndexKey::from_value(&json!(0)).unwrap();
        let negative_zero = IndexKey::from_value(&json!(-0.0)).unwrap();
        assert_eq!(zero, negative_zero);
        assert_eq!(zero.columns(), negative_zero.columns());
        assert_eq!(zero.columns(), IndexKey::Number(0.0).columns());
        assert_eq!(IndexKey::Int(2), IndexKey::Number(2.0));
        assert!(IndexKey::Int(2) < IndexKey::Number(2.5));
        assert!(IndexKey::Number(-0.5) < IndexKey::Int(0));
    }

    #[test]
    fn large_integers_stay_distinct() {
        let a = IndexKey::from_value(&json!(9_007_199_254_740_992_i64)).unwrap();
        let b = IndexKey::from_value(&json!(9_007_199_254_740_993_i64)).unwrap();
        assert!(a < b);
        assert_eq!(a.columns().1, b.columns().1);
        assert!(a.columns().2 < b.columns().2);

        let max = IndexKey::from_value(&json!(u64::MAX)).unwrap();
        assert_eq!(max, IndexKey::UInt(u64::MAX));
        assert!(IndexKey::Int(i64::MAX) < max);
        assert!(max < IndexKey::Number(TWO_POW_64));

        let mut keys = vec![IndexKey::Number(TWO_POW_64), max.clone(), b.clone(), a.clone()];
        let mut by_columns = keys.clone();
        keys.sort();
        by_columns.sort_by(|x, y| {
            let (rx, nx, sx) = x.columns();
            let (ry, ny, sy) = y.columns();
            rx.cmp(&ry).then(nx.total_cmp(&ny)).then(sx.cmp(&sy))
        });
        assert_eq!(keys, by_columns);
        assert_eq!(keys, vec![a, b, max, IndexKey::Number(TWO_POW_64)]);
    }

    #[test]
    fn large_integers_do_not_collide_in_unique_index() {
        let mut index = SecondaryIndex::new(IndexDef::unique("serial"));
        index
            .insert(&item("a", json!({ "serial": 9_007_199_254_740_992_i64 })))
            .unwrap();
        index
            .insert(&item("b", json!({ "serial": 9_007_199_254_740_993_i64 })))
            .unwrap();
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn lookup_and_remove() {
        let mut index = SecondaryIndex::new(IndexDef::new("city"));
        let a = item("a", json!({"city": "Oslo"}));
        let b = item("b", json!({"city": "oslo"}));
        let c = item("c", json!({"city": "Bergen"}));
        for i in [&a, &b, &c] {
            index.insert(i).unwrap();
        }

        let key = IndexKey::Text("oslo".into());
        assert_eq!(index.lookup(&key), vec!["a".to_string(), "b".to_string()]);

        index.remove(&a);
        assert_eq!(index.lookup(&key), vec!["b".to_string()]);
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn unique_violation() {
        let mut index = SecondaryIndex::new(IndexDef::unique("email"));
        index.insert(&item("a", json!({"email": "x@y"}))).unwrap();

        // Re-inserting the same item is fine.
        index.insert(&item("a", json!({"email": "x@y"}))).unwrap();

        let err = index.insert(&item("b", json!({"email": "X@Y"}))).unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { index, .. } if index == "email"));
    }

    #[test]
    fn build_fails_on_existing_duplicates() {
        let items = [
            item("a", json!({"email": "x@y"})),
            item("b", json!({"email": "x@y"})),
        ];
        assert!(SecondaryIndex::build(IndexDef::unique("email"), items.iter()).is_err());
        assert!(SecondaryIndex::build(IndexDef::new("email"), items.iter()).is_ok());
    }

    #[test]
    fn range_bounds() {
        let mut index = SecondaryIndex::new(IndexDef::new("age"));
        for (id, age) in [("a", 10), ("b", 20), ("c", 30), ("d", 40)] {
            index.insert(&item(id, json!({ "age": age }))).unwrap();
        }

        let all = index.range(&KeyRange::default());
        assert_eq!(all.len(), 4);

        let inclusive = index.range(&KeyRange::between(
            IndexKey::Number(20.0),
            IndexKey::Number(30.0),
        ));
        assert_eq!(inclusive, vec!["b".to_string(), "c".to_string()]);

        let exclusive = index.range(&KeyRange::new(
            Some(RangeBound::exclusive(IndexKey::Number(20.0))),
            Some(RangeBound::exclusive(IndexKey::Number(40.0))),
        ));
        assert_eq!(exclusive, vec!["c".to_string()]);

        let empty = KeyRange::new(
            Some(RangeBound::exclusive(IndexKey::Number(20.0))),
            Some(RangeBound::inclusive(IndexKey::Number(20.0))),
        );
        assert!(empty.is_empty());
        assert!(index.range(&empty).is_empty());

        let inverted = KeyRange::between(IndexKey::Number(30.0), IndexKey::Number(10.0));
        assert!(index.range(&inverted).is_empty());
    }

    #[test]
    fn range_contains() {
        let range = KeyRange::new(Some(RangeBound::exclusive(IndexKey::Number(1.0))), None);
        assert!(!range.contains(&IndexKey::Number(1.0)));
        assert!(range.contains(&IndexKey::Number(1.5)));
        assert!(range.contains(&IndexKey::Text("z".into())));
    }
}
