//! `$project`/`$addFields` IVM operators (spec.md §4.3, "Project").
//!
//! Both are pure per-row transforms with no cross-row state: `onAdd`
//! recomputes the output document and caches it; `onRemove` just drops
//! the cache entry and forwards the retraction. The two differ only in
//! how the output document is built — `$project` replaces the document
//! shape entirely (via [`crate::expr::object_shape::project`]),
//! `$addFields` merges the computed fields onto the original.

use super::{Delta, PassthroughCache};
use crate::error::Result;
use crate::expr::EvalContext;
use crate::value::Document;

pub struct ProjectState {
    spec: Document,
    cache: PassthroughCache,
}

impl ProjectState {
    pub fn new(spec: Document) -> Self {
        ProjectState {
            spec,
            cache: PassthroughCache::default(),
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Result<Vec<Delta>> {
        if delta.sign > 0 {
            let mut ctx = EvalContext::new(&delta.doc);
            let effective = crate::expr::object_shape::project(&delta.doc, &self.spec, &mut ctx)?;
            self.cache.insert(delta.row_id.clone(), effective.clone());
            Ok(vec![Delta {
                row_id: delta.row_id.clone(),
                sign: 1,
                doc: effective,
            }])
        } else if self.cache.remove(&delta.row_id) {
            Ok(vec![Delta {
                row_id: delta.row_id.clone(),
                sign: -1,
                doc: crate::value::Value::Null,
            }])
        } else {
            Ok(vec![])
        }
    }
}

pub struct AddFieldsState {
    spec: Document,
    cache: PassthroughCache,
}

impl AddFieldsState {
    pub fn new(spec: Document) -> Self {
        AddFieldsState {
            spec,
            cache: PassthroughCache::default(),
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Result<Vec<Delta>> {
        if delta.sign > 0 {
            let mut ctx = EvalContext::new(&delta.doc);
            let computed = crate::expr::object_shape::project(&delta.doc, &self.spec, &mut ctx)?;
            let effective = merge_fields(delta.doc.clone(), computed);
            self.cache.insert(delta.row_id.clone(), effective.clone());
            Ok(vec![Delta {
                row_id: delta.row_id.clone(),
                sign: 1,
                doc: effective,
            }])
        } else if self.cache.remove(&delta.row_id) {
            Ok(vec![Delta {
                row_id: delta.row_id.clone(),
                sign: -1,
                doc: crate::value::Value::Null,
            }])
        } else {
            Ok(vec![])
        }
    }
}

fn merge_fields(base: crate::value::Value, computed: crate::value::Value) -> crate::value::Value {
    let crate::value::Value::Document(mut base_map) = base else {
        return base;
    };
    let crate::value::Value::Document(computed_map) = computed else {
        return crate::value::Value::Document(base_map);
    };
    for (k, v) in computed_map {
        base_map.insert(k, v);
    }
    crate::value::Value::Document(base_map)
}
