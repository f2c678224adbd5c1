//! # Value Model
//!
//! The document/value domain shared by every stage: a small closed set of
//! variants (null, boolean, number, string, timestamp, array, document),
//! structural equality, and the total ordering MongoDB-style aggregation
//! pipelines rely on for `$sort`, `$min`/`$max`, and comparison operators.
//!
//! Documents are ordered maps — field order is preserved the way a JSON
//! object's is — backed by `indexmap` rather than `BTreeMap` or `HashMap`.

pub mod path;
pub mod row_id;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::fmt;

pub use row_id::RowId;

/// A document: an ordered mapping from string keys to values.
pub type Document = IndexMap<String, Value>;

/// The value domain evaluated expressions and stored documents live in.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    pub fn doc(pairs: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Document(pairs.into_iter().collect())
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(items.into_iter().collect())
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Truthiness per spec.md §4.1: false for null, false, 0, empty
    /// string, empty array; true otherwise.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Document(_) | Value::Timestamp(_) => true,
        }
    }

    /// Numeric coercion used by arithmetic operators (spec.md §4.1):
    /// strings parse as float (`NaN` on failure becomes `0`), bools
    /// become `0`/`1`, timestamps become epoch-millis, null becomes `0`.
    pub fn coerce_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
            Value::Timestamp(t) => t.timestamp_millis() as f64,
            Value::Null => 0.0,
            Value::Array(_) | Value::Document(_) => f64::NAN,
        }
    }

    /// The field-path resolution used by `"$a.b.c"` expressions: missing
    /// keys (or indexing through a non-document/non-array) yield null,
    /// never an error.
    pub fn get_path(&self, path: &str) -> Value {
        path::get_path(self, path)
    }

    /// Converts a parsed JSON document into this crate's value domain.
    /// `serde_json::Number` always becomes `Value::Number` (an IEEE-754
    /// double per spec.md §3's value domain, even for integers that don't
    /// round-trip exactly through `f64`); there is no separate integer
    /// variant to preserve. Object key order is preserved, matching
    /// `serde_json`'s own `preserve_order`-independent `Map` iteration
    /// order for the common case of documents parsed fresh from text.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => {
                Value::Document(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Converts this value back into `serde_json::Value` for interop with
    /// JSON-speaking collaborators (the public façade, external event
    /// sources). `Timestamp` is rendered as its RFC 3339 string, since
    /// JSON has no native instant type.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(doc) => {
                serde_json::Value::Object(doc.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    fn type_rank(&self) -> u8 {
        // spec.md §4.1: null < number < string < document < array < boolean < timestamp
        match self {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Document(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
            Value::Timestamp(_) => 6,
        }
    }

    /// The canonical total ordering over the value domain (spec.md §4.1).
    pub fn compare(&self, other: &Value) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Document(a), Value::Document(b)) => compare_documents(a, b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.compare(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => unreachable!("type_rank equality implies matching variant"),
        }
    }

    /// Structural equality over the value domain (used by `$eq`,
    /// `$addToSet`, and the set operators).
    pub fn structural_eq(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Feeds a hash of this value into `state`, consistent with
    /// [`Value::structural_eq`]: document hashes are combined
    /// commutatively so field order never changes the hash, matching
    /// `compare_documents`'s order-insensitive key-set comparison.
    /// Used by [`OrdValue`]'s `Hash` impl so group keys (spec.md §4.3,
    /// "Group") can live in a hash-indexed map.
    fn hash_into<H: std::hash::Hasher>(&self, state: &mut H) {
        use std::hash::Hash;
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                // -0.0 and 0.0 compare equal; normalize so they hash equal too.
                let norm = if *n == 0.0 { 0.0 } else { *n };
                norm.to_bits().hash(state);
            }
            Value::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::Timestamp(t) => {
                state.write_u8(4);
                t.timestamp_millis().hash(state);
            }
            Value::Array(items) => {
                state.write_u8(5);
                items.len().hash(state);
                for item in items {
                    item.hash_into(state);
                }
            }
            Value::Document(doc) => {
                state.write_u8(6);
                let mut combined: u64 = 0;
                for (k, v) in doc {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    k.hash(&mut h);
                    v.hash_into(&mut h);
                    combined ^= h.finish();
                }
                combined.hash(state);
            }
        }
    }
}

/// A `Value` ordered by [`Value::compare`] rather than `PartialOrd`, for
/// use as a key in `Ord`-bound collections (`BTreeMap`, the order-stat
/// tree) that need a total order the bare enum doesn't provide on its own
/// (`f64` has no `Ord` impl).
#[derive(Debug, Clone)]
pub struct OrdValue(pub Value);

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.structural_eq(&other.0)
    }
}

impl Eq for OrdValue {}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.compare(&other.0)
    }
}

impl std::hash::Hash for OrdValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash_into(state);
    }
}

fn compare_documents(a: &Document, b: &Document) -> Ordering {
    // "documents by recursive key order": compare in the shorter
    // document's key order, field by field, then break ties by arity.
    for (k, v) in a {
        match b.get(k) {
            Some(bv) => {
                let c = v.compare(bv);
                if c != Ordering::Equal {
                    return c;
                }
            }
            None => return Ordering::Greater,
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Array(_) | Value::Document(_) => write!(f, "{self:?}"),
        }
    }
}
