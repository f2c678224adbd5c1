//! `$sort` IVM operator (spec.md §4.3, "Sort").
//!
//! Maintains an [`OrderStatTree`] of composite sort keys so insertion,
//! removal, and "give me the current order" are all `O(log n)` or
//! better instead of a full re-sort per delta. When the planner detects
//! a trailing `$limit` (spec.md §4.2, `hasSortLimit`), the tree is capped
//! at `cap` entries: any insertion past the bound evicts the current
//! largest key, so the tree never holds more than the rows that could
//! possibly matter.

use super::Delta;
use crate::store::OrderStatTree;
use crate::value::{RowId, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A composite sort key: one value per `$sort` field, each field's
/// comparison reversed when that field's direction is descending, with
/// `row_id` as the final tie-break so two structurally-equal keys still
/// have a total order (required for the tree to treat them as distinct
/// entries rather than collapsing them).
#[derive(Clone)]
struct SortKey {
    values: Vec<Value>,
    dirs: std::rc::Rc<Vec<i32>>,
    row_id: RowId,
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a, b), dir) in self.values.iter().zip(other.values.iter()).zip(self.dirs.iter()) {
            let c = a.compare(b);
            let c = if *dir < 0 { c.reverse() } else { c };
            if c != Ordering::Equal {
                return c;
            }
        }
        self.row_id.cmp(&other.row_id)
    }
}

pub struct SortState {
    fields: Vec<(String, i32)>,
    dirs: std::rc::Rc<Vec<i32>>,
    tree: OrderStatTree<SortKey>,
    keys_by_row: HashMap<RowId, SortKey>,
    docs_by_row: HashMap<RowId, Value>,
    cap: Option<usize>,
}

impl SortState {
    pub fn new(fields: Vec<(String, i32)>, cap: Option<usize>) -> Self {
        let dirs = std::rc::Rc::new(fields.iter().map(|(_, d)| *d).collect());
        SortState {
            fields,
            dirs,
            tree: OrderStatTree::new(),
            keys_by_row: HashMap::new(),
            docs_by_row: HashMap::new(),
            cap,
        }
    }

    fn key_for(&self, row_id: RowId, doc: &Value) -> SortKey {
        let values = self.fields.iter().map(|(f, _)| doc.get_path(f)).collect();
        SortKey {
            values,
            dirs: self.dirs.clone(),
            row_id,
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Vec<Delta> {
        if delta.sign > 0 {
            let key = self.key_for(delta.row_id.clone(), &delta.doc);
            self.tree.insert(key.clone());
            self.keys_by_row.insert(delta.row_id.clone(), key.clone());
            self.docs_by_row.insert(delta.row_id.clone(), delta.doc.clone());

            let mut emitted = vec![Delta {
                row_id: delta.row_id.clone(),
                sign: 1,
                doc: delta.doc.clone(),
            }];

            if let Some(cap) = self.cap {
                while self.tree.len() > cap {
                    let evicted_key = self.tree.last().expect("len > cap >= 0 implies non-empty").clone();
                    self.tree.remove(&evicted_key);
                    self.keys_by_row.remove(&evicted_key.row_id);
                    self.docs_by_row.remove(&evicted_key.row_id);
                    emitted.push(Delta::retract(evicted_key.row_id));
                }
            }
            emitted
        } else if let Some(key) = self.keys_by_row.remove(&delta.row_id) {
            self.tree.remove(&key);
            self.docs_by_row.remove(&delta.row_id);
            vec![Delta::retract(delta.row_id.clone())]
        } else {
            vec![]
        }
    }

    pub fn ordered_rows(&self) -> Vec<(RowId, Value)> {
        self.tree
            .iter()
            .map(|key| (key.row_id.clone(), self.docs_by_row[&key.row_id].clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(row: u64, n: f64) -> Delta {
        Delta {
            row_id: RowId::base(row),
            sign: 1,
            doc: Value::doc([("n".into(), Value::Number(n))]),
        }
    }

    #[test]
    fn unbounded_sort_tracks_insertion_order_ascending() {
        let mut state = SortState::new(vec![("n".to_string(), 1)], None);
        for (row, n) in [(0, 3.0), (1, 1.0), (2, 2.0)] {
            state.on_delta(&add(row, n));
        }
        let ns: Vec<f64> = state.ordered_rows().iter().map(|(_, d)| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn descending_direction_reverses_order() {
        let mut state = SortState::new(vec![("n".to_string(), -1)], None);
        for (row, n) in [(0, 3.0), (1, 1.0), (2, 2.0)] {
            state.on_delta(&add(row, n));
        }
        let ns: Vec<f64> = state.ordered_rows().iter().map(|(_, d)| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn capped_tree_evicts_largest_on_overflow() {
        let mut state = SortState::new(vec![("n".to_string(), 1)], Some(2));
        state.on_delta(&add(0, 5.0));
        state.on_delta(&add(1, 1.0));
        let emitted = state.on_delta(&add(2, 3.0));
        // 5.0 was the largest of {5,1,3}; inserting 3.0 pushes it out.
        assert!(emitted.iter().any(|d| d.sign == -1 && d.row_id == RowId::base(0)));
        let ns: Vec<f64> = state.ordered_rows().iter().map(|(_, d)| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![1.0, 3.0]);
    }

    #[test]
    fn removal_drops_row_from_ordered_output() {
        let mut state = SortState::new(vec![("n".to_string(), 1)], None);
        state.on_delta(&add(0, 1.0));
        state.on_delta(&add(1, 2.0));
        state.on_delta(&Delta::retract(RowId::base(0)));
        let ns: Vec<f64> = state.ordered_rows().iter().map(|(_, d)| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![2.0]);
    }
}
