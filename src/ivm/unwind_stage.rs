//! `$unwind` IVM operator (spec.md §4.3, "Unwind").
//!
//! One parent row fans out into zero or more virtual child rows, each
//! addressed by [`RowId::child`] so a later removal of the same parent
//! finds exactly the children it created (spec.md §3, §9). Retraction
//! reads back the recorded child list rather than recomputing it from
//! the (now possibly gone) parent document.

use super::Delta;
use crate::stage::UnwindSpec;
use crate::value::{path, RowId, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

pub struct UnwindState {
    spec: UnwindSpec,
    children_by_parent: HashMap<RowId, Vec<RowId>>,
    docs: IndexMap<RowId, Value>,
}

impl UnwindState {
    pub fn new(spec: UnwindSpec) -> Self {
        UnwindState {
            spec,
            children_by_parent: HashMap::new(),
            docs: IndexMap::new(),
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Vec<Delta> {
        if delta.sign > 0 {
            self.on_add(delta.row_id.clone(), &delta.doc)
        } else {
            self.on_remove(&delta.row_id)
        }
    }

    fn on_add(&mut self, parent: RowId, doc: &Value) -> Vec<Delta> {
        let array_val = doc.get_path(&self.spec.path);
        let mut children = Vec::new();
        let mut emitted = Vec::new();

        match array_val {
            Value::Array(items) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let child_id = parent.clone().child(i as u32);
                    let child_doc = unwind_child(doc, &self.spec, Some(item), Some(i));
                    self.docs.insert(child_id.clone(), child_doc.clone());
                    children.push(child_id.clone());
                    emitted.push(Delta {
                        row_id: child_id,
                        sign: 1,
                        doc: child_doc,
                    });
                }
            }
            _ => {
                if self.spec.preserve_null_and_empty_arrays {
                    let child_id = parent.clone().child(0);
                    let child_doc = unwind_child(doc, &self.spec, None, None);
                    self.docs.insert(child_id.clone(), child_doc.clone());
                    children.push(child_id.clone());
                    emitted.push(Delta {
                        row_id: child_id,
                        sign: 1,
                        doc: child_doc,
                    });
                }
            }
        }

        self.children_by_parent.insert(parent, children);
        emitted
    }

    fn on_remove(&mut self, parent: &RowId) -> Vec<Delta> {
        let Some(children) = self.children_by_parent.remove(parent) else {
            return vec![];
        };
        children
            .into_iter()
            .map(|child_id| {
                self.docs.shift_remove(&child_id);
                Delta::retract(child_id)
            })
            .collect()
    }

    /// Walks `upstream` (the parent rows in the order the stage before
    /// this one produced them) and expands each still-live parent into
    /// its recorded children, in array-index order. A parent no longer
    /// in `children_by_parent` (removed, or never matched) contributes
    /// nothing — mirroring the passthrough stages, `$unwind` has no
    /// ordering of its own to fall back on.
    pub fn ordered_rows(&self, upstream: &[(RowId, Value)]) -> Vec<(RowId, Value)> {
        let mut out = Vec::new();
        for (parent_id, _) in upstream {
            let Some(children) = self.children_by_parent.get(parent_id) else { continue };
            for child_id in children {
                if let Some(doc) = self.docs.get(child_id) {
                    out.push((child_id.clone(), doc.clone()));
                }
            }
        }
        out
    }
}

fn unwind_child(doc: &Value, spec: &UnwindSpec, element: Option<Value>, index: Option<usize>) -> Value {
    let mut out = doc.clone();
    let value = element.unwrap_or(Value::Null);
    path::set_path(&mut out, &spec.path, value);
    if let Some(idx_field) = &spec.include_array_index {
        let idx_value = index.map(|i| Value::Number(i as f64)).unwrap_or(Value::Null);
        path::set_path(&mut out, idx_field, idx_value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UnwindSpec {
        UnwindSpec {
            path: "tags".to_string(),
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        }
    }

    #[test]
    fn fans_out_one_child_per_array_element() {
        let mut state = UnwindState::new(spec());
        let doc = Value::doc([("tags".into(), Value::array([Value::string("a"), Value::string("b")]))]);
        let emitted = state.on_delta(&Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc,
        });
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].row_id, RowId::base(1).child(0));
        assert_eq!(emitted[1].row_id, RowId::base(1).child(1));
    }

    #[test]
    fn removing_parent_retracts_exactly_its_children() {
        let mut state = UnwindState::new(spec());
        let doc = Value::doc([("tags".into(), Value::array([Value::string("a"), Value::string("b")]))]);
        state.on_delta(&Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc,
        });
        let emitted = state.on_delta(&Delta::retract(RowId::base(1)));
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|d| d.sign == -1));
        let upstream = vec![(RowId::base(1), Value::Null)];
        assert!(state.ordered_rows(&upstream).is_empty());
    }

    #[test]
    fn empty_array_without_preserve_emits_nothing() {
        let mut state = UnwindState::new(spec());
        let doc = Value::doc([("tags".into(), Value::array([]))]);
        let emitted = state.on_delta(&Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc,
        });
        assert!(emitted.is_empty());
    }
}
