//! `$lookup` IVM operator (spec.md §4.3, "Lookup"), restricted to the
//! `localField`/`foreignField` equality-join form (no sub-pipeline, no
//! `let` bindings — rejected at parse time in [`crate::stage`]).
//!
//! The foreign side is snapshotted once, at plan-build time, into a hash
//! index keyed by `foreignField`'s value (see [`crate::foreign`] for why
//! this crate treats the foreign collection as immutable for the plan's
//! lifetime). Only the local side is incremental: each local row's join
//! result is recomputed on `onAdd` against that fixed index and cached,
//! same shape as `$project`/`$addFields`.

use super::{Delta, PassthroughCache};
use crate::stage::LookupSpec;
use crate::value::{OrdValue, Value};
use std::collections::HashMap;

pub struct LookupState {
    spec: LookupSpec,
    foreign_index: HashMap<OrdValue, Vec<Value>>,
    cache: PassthroughCache,
}

impl LookupState {
    pub fn new(spec: LookupSpec, foreign_docs: Vec<Value>) -> Self {
        let mut foreign_index: HashMap<OrdValue, Vec<Value>> = HashMap::new();
        for fdoc in foreign_docs {
            let key = fdoc.get_path(&spec.foreign_field);
            foreign_index.entry(OrdValue(key)).or_default().push(fdoc);
        }
        LookupState {
            spec,
            foreign_index,
            cache: PassthroughCache::default(),
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Vec<Delta> {
        if delta.sign > 0 {
            let effective = self.join(&delta.doc);
            self.cache.insert(delta.row_id.clone(), effective.clone());
            vec![Delta {
                row_id: delta.row_id.clone(),
                sign: 1,
                doc: effective,
            }]
        } else if self.cache.remove(&delta.row_id) {
            vec![Delta::retract(delta.row_id.clone())]
        } else {
            vec![]
        }
    }

    fn join(&self, doc: &Value) -> Value {
        let local_val = doc.get_path(&self.spec.local_field);
        let matches = match &local_val {
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    if let Some(v) = self.foreign_index.get(&OrdValue(item.clone())) {
                        out.extend(v.iter().cloned());
                    }
                }
                out
            }
            other => self.foreign_index.get(&OrdValue(other.clone())).cloned().unwrap_or_default(),
        };
        let Value::Document(mut map) = doc.clone() else {
            return Value::Null;
        };
        map.insert(self.spec.as_field.clone(), Value::Array(matches));
        Value::Document(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RowId;

    fn spec() -> LookupSpec {
        LookupSpec {
            from: "users".to_string(),
            local_field: "uid".to_string(),
            foreign_field: "id".to_string(),
            as_field: "joined".to_string(),
        }
    }

    #[test]
    fn joins_local_field_against_fixed_foreign_snapshot() {
        let foreign = vec![
            Value::doc([("id".into(), Value::Number(1.0)), ("name".into(), Value::string("alice"))]),
            Value::doc([("id".into(), Value::Number(2.0)), ("name".into(), Value::string("bob"))]),
        ];
        let mut state = LookupState::new(spec(), foreign);
        let emitted = state.on_delta(&Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc: Value::doc([("uid".into(), Value::Number(1.0))]),
        });
        let Value::Array(joined) = emitted[0].doc.get_path("joined") else {
            panic!("expected array");
        };
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].get_path("name"), Value::string("alice"));
    }

    #[test]
    fn removal_retracts_cached_joined_row() {
        let mut state = LookupState::new(spec(), vec![]);
        state.on_delta(&Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc: Value::doc([("uid".into(), Value::Number(1.0))]),
        });
        let emitted = state.on_delta(&Delta::retract(RowId::base(1)));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].sign, -1);
    }
}
