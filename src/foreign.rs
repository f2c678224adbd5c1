//! Foreign-collection lookup source for `$lookup` (spec.md §4.3, "Lookup").
//!
//! `$lookup` is the one stage that reaches outside its own collection.
//! Rather than give every executor a direct reference to sibling
//! [`crate::collection::StreamingCollection`]s (which would tangle
//! ownership and break the "foreign collection is immutable for the
//! plan's lifetime" assumption IVM lookup relies on), both executors
//! take a narrow [`ForeignSource`] capability — a named snapshot lookup,
//! nothing more.

use crate::value::Value;
use std::collections::HashMap;

/// Supplies a snapshot of a named foreign collection. An unknown name
/// yields an empty collection (matching `$lookup`'s behavior against a
/// nonexistent collection: the `as` field comes back `[]`, not an error).
pub trait ForeignSource {
    fn documents(&self, name: &str) -> Vec<Value>;
}

/// No foreign collections registered; every `$lookup` joins against `[]`.
pub struct NoForeign;

impl ForeignSource for NoForeign {
    fn documents(&self, _name: &str) -> Vec<Value> {
        Vec::new()
    }
}

/// A fixed table of named document snapshots, the common case for
/// `$lookup` against a collection that does not mutate during the
/// plan's lifetime.
#[derive(Default, Clone)]
pub struct StaticForeign(pub HashMap<String, Vec<Value>>);

impl StaticForeign {
    pub fn new() -> Self {
        StaticForeign(HashMap::new())
    }

    pub fn register(&mut self, name: impl Into<String>, docs: Vec<Value>) {
        self.0.insert(name.into(), docs);
    }
}

impl ForeignSource for StaticForeign {
    fn documents(&self, name: &str) -> Vec<Value> {
        self.0.get(name).cloned().unwrap_or_default()
    }
}
