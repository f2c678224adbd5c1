//! A dimension: the value of one field path, indexed from value to the
//! set of row ids currently holding it (spec.md §3, "per-field
//! dimensions"). Backs `$match` equality lookups, `$group` bucket
//! membership, and cardinality estimates the planner uses to decide
//! between a vectorized group-by and a row-at-a-time fallback.

use crate::value::{OrdValue, RowId, Value};
use std::collections::{BTreeMap, BTreeSet};

pub struct Dimension {
    field_path: String,
    index: BTreeMap<OrdValue, BTreeSet<RowId>>,
}

impl Dimension {
    pub fn new(field_path: impl Into<String>) -> Self {
        Dimension {
            field_path: field_path.into(),
            index: BTreeMap::new(),
        }
    }

    pub fn field_path(&self) -> &str {
        &self.field_path
    }

    pub fn insert(&mut self, row_id: RowId, value: Value) {
        self.index.entry(OrdValue(value)).or_default().insert(row_id);
    }

    /// Removes `row_id` from the bucket for `value`, pruning the bucket
    /// once it's empty so cardinality reflects live values only.
    pub fn remove(&mut self, row_id: &RowId, value: &Value) {
        let key = OrdValue(value.clone());
        if let Some(bucket) = self.index.get_mut(&key) {
            bucket.remove(row_id);
            if bucket.is_empty() {
                self.index.remove(&key);
            }
        }
    }

    pub fn rows_for(&self, value: &Value) -> impl Iterator<Item = &RowId> {
        self.index
            .get(&OrdValue(value.clone()))
            .into_iter()
            .flat_map(BTreeSet::iter)
    }

    /// Rows whose value at this dimension compares less than `value`,
    /// in ascending value order — the access pattern `$sort` and range
    /// `$match` conditions need.
    pub fn rows_less_than(&self, value: &Value) -> impl Iterator<Item = &RowId> {
        let bound = OrdValue(value.clone());
        self.index
            .range(..bound)
            .flat_map(|(_, bucket)| bucket.iter())
    }

    /// The number of distinct values currently held, used by the planner
    /// to decide whether a group-by is low enough cardinality to
    /// vectorize (spec.md §6).
    pub fn cardinality(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.index.keys().map(|k| &k.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_by_value() {
        let mut dim = Dimension::new("status");
        dim.insert(RowId::base(1), Value::string("active"));
        dim.insert(RowId::base(2), Value::string("active"));
        dim.insert(RowId::base(3), Value::string("inactive"));
        assert_eq!(dim.rows_for(&Value::string("active")).count(), 2);
        assert_eq!(dim.cardinality(), 2);
    }

    #[test]
    fn remove_prunes_empty_buckets() {
        let mut dim = Dimension::new("status");
        dim.insert(RowId::base(1), Value::string("active"));
        dim.remove(&RowId::base(1), &Value::string("active"));
        assert_eq!(dim.cardinality(), 0);
        assert!(dim.is_empty());
    }

    #[test]
    fn rows_less_than_respects_value_order() {
        let mut dim = Dimension::new("age");
        dim.insert(RowId::base(1), Value::Number(10.0));
        dim.insert(RowId::base(2), Value::Number(20.0));
        dim.insert(RowId::base(3), Value::Number(30.0));
        let below: Vec<&RowId> = dim.rows_less_than(&Value::Number(25.0)).collect();
        assert_eq!(below, vec![&RowId::base(1), &RowId::base(2)]);
    }
}
