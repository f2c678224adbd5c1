//! The columnar substrate every incremental stage operates over: a
//! row-id-addressed document store, a live-set bitset, and a registry of
//! per-field dimensions (spec.md §3, "Data model").
//!
//! Row ids are stable for the lifetime of a row (spec.md §3): a base row
//! keeps its id for as long as it's live, and an `$unwind`-fanned virtual
//! row's id is derived deterministically from its parent so a later
//! removal of the same array element finds the same id again.

pub mod dimension;
pub mod multiset;
pub mod order_stat_tree;

pub use dimension::Dimension;
pub use multiset::RefCountedMultiSet;
pub use order_stat_tree::OrderStatTree;

use crate::value::{path, RowId, Value};
use fixedbitset::FixedBitSet;
use std::collections::HashMap;

/// The set of currently-live row ids, backed by a dense bitset so
/// membership and count are `O(1)`. Slots are reused once freed so the
/// bitset doesn't grow unbounded under sustained churn.
pub struct LiveSet {
    bits: FixedBitSet,
    slot_of: HashMap<RowId, usize>,
    row_of_slot: Vec<Option<RowId>>,
    free_slots: Vec<usize>,
}

impl Default for LiveSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveSet {
    pub fn new() -> Self {
        LiveSet {
            bits: FixedBitSet::with_capacity(0),
            slot_of: HashMap::new(),
            row_of_slot: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn insert(&mut self, row_id: RowId) -> usize {
        let slot = self.free_slots.pop().unwrap_or_else(|| {
            let slot = self.row_of_slot.len();
            self.row_of_slot.push(None);
            if slot >= self.bits.len() {
                self.bits.grow(slot + 1);
            }
            slot
        });
        self.row_of_slot[slot] = Some(row_id.clone());
        self.slot_of.insert(row_id, slot);
        self.bits.insert(slot);
        slot
    }

    pub fn remove(&mut self, row_id: &RowId) -> Option<usize> {
        let slot = self.slot_of.remove(row_id)?;
        self.bits.set(slot, false);
        self.row_of_slot[slot] = None;
        self.free_slots.push(slot);
        Some(slot)
    }

    pub fn contains(&self, row_id: &RowId) -> bool {
        self.slot_of.contains_key(row_id)
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot_of(&self, row_id: &RowId) -> Option<usize> {
        self.slot_of.get(row_id).copied()
    }
}

/// Which field paths a collection keeps [`Dimension`] indexes for. The
/// planner populates this from the fields a compiled pipeline actually
/// reads (spec.md §6, "field dependency analysis") so we never pay to
/// index a field nothing queries.
pub struct ColumnStore {
    documents: HashMap<RowId, Value>,
    live: LiveSet,
    dimensions: HashMap<String, Dimension>,
    next_base_id: u64,
}

impl Default for ColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnStore {
    pub fn new() -> Self {
        ColumnStore {
            documents: HashMap::new(),
            live: LiveSet::new(),
            dimensions: HashMap::new(),
            next_base_id: 0,
        }
    }

    /// Allocates a fresh base row id, monotonically increasing so ids
    /// are never reused even after the original row is removed.
    pub fn next_base_id(&mut self) -> RowId {
        let id = self.next_base_id;
        self.next_base_id += 1;
        RowId::base(id)
    }

    pub fn ensure_dimension(&mut self, field_path: &str) -> &mut Dimension {
        self.dimensions
            .entry(field_path.to_string())
            .or_insert_with(|| Dimension::new(field_path))
    }

    pub fn dimension(&self, field_path: &str) -> Option<&Dimension> {
        self.dimensions.get(field_path)
    }

    pub fn indexed_fields(&self) -> impl Iterator<Item = &str> {
        self.dimensions.keys().map(String::as_str)
    }

    /// Inserts `doc` under `row_id`, marking it live and updating every
    /// registered dimension with the document's value at that path.
    pub fn insert(&mut self, row_id: RowId, doc: Value) {
        for (field_path, dim) in &mut self.dimensions {
            let value = path::get_path(&doc, field_path);
            dim.insert(row_id.clone(), value);
        }
        self.live.insert(row_id.clone());
        self.documents.insert(row_id, doc);
    }

    /// Removes the row, pruning it from the live set, every dimension
    /// bucket, and the document table. Returns the removed document, if
    /// it was present.
    pub fn remove(&mut self, row_id: &RowId) -> Option<Value> {
        let doc = self.documents.remove(row_id)?;
        for dim in self.dimensions.values_mut() {
            let value = path::get_path(&doc, dim.field_path());
            dim.remove(row_id, &value);
        }
        self.live.remove(row_id);
        Some(doc)
    }

    pub fn get(&self, row_id: &RowId) -> Option<&Value> {
        self.documents.get(row_id)
    }

    pub fn contains(&self, row_id: &RowId) -> bool {
        self.live.contains(row_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowId, &Value)> {
        self.documents.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_set_reuses_freed_slots() {
        let mut live = LiveSet::new();
        let a = live.insert(RowId::base(1));
        live.remove(&RowId::base(1));
        let b = live.insert(RowId::base(2));
        assert_eq!(a, b);
        assert!(live.contains(&RowId::base(2)));
        assert!(!live.contains(&RowId::base(1)));
    }

    #[test]
    fn store_updates_dimensions_on_insert_and_remove() {
        let mut store = ColumnStore::new();
        store.ensure_dimension("status");
        let id = store.next_base_id();
        store.insert(id.clone(), Value::doc([("status".into(), Value::string("active"))]));
        assert_eq!(store.dimension("status").unwrap().cardinality(), 1);
        store.remove(&id);
        assert_eq!(store.dimension("status").unwrap().cardinality(), 0);
        assert!(!store.contains(&id));
    }

    #[test]
    fn base_ids_never_repeat() {
        let mut store = ColumnStore::new();
        let a = store.next_base_id();
        let b = store.next_base_id();
        assert_ne!(a, b);
    }
}
