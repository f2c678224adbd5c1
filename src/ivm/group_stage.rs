//! `$group` IVM operator (spec.md §4.3, "Group").
//!
//! Each contributing row is remembered (by row id) alongside the group
//! key it fell into and the document it contributed, so a later removal
//! can retract exactly the right value from exactly the right
//! [`GroupState`] without rescanning anything. A group's own identity
//! downstream is a synthetic row id, allocated the first time its key is
//! seen and reused for as long as the group has members; an update to an
//! existing group is modeled as retract-then-insert of that same id, so
//! a `$sort` stage placed after `$group` can find and replace the old
//! entry rather than appending a duplicate.

use super::Delta;
use crate::error::Result;
use crate::expr::{self, EvalContext};
use crate::group::{build_group_doc, GroupState};
use crate::stage::GroupSpec;
use crate::value::{OrdValue, RowId, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

pub struct GroupStageState {
    spec: GroupSpec,
    groups: IndexMap<OrdValue, (RowId, Value, GroupState)>,
    contributions: HashMap<RowId, (OrdValue, Value)>,
    next_group_seq: u64,
}

impl GroupStageState {
    pub fn new(spec: GroupSpec) -> Self {
        GroupStageState {
            spec,
            groups: IndexMap::new(),
            contributions: HashMap::new(),
            next_group_seq: 0,
        }
    }

    pub fn on_delta(&mut self, delta: &Delta) -> Result<Vec<Delta>> {
        if delta.sign > 0 {
            self.on_add(delta.row_id.clone(), &delta.doc)
        } else {
            self.on_remove(&delta.row_id)
        }
    }

    fn on_add(&mut self, row_id: RowId, doc: &Value) -> Result<Vec<Delta>> {
        let mut ctx = EvalContext::new(doc);
        let id_value = expr::eval(doc, &self.spec.id_expr, &mut ctx)?;
        let key = OrdValue(id_value.clone());

        let mut emitted = Vec::new();
        let is_new_key = !self.groups.contains_key(&key);
        let group_row_id = if is_new_key {
            let id = RowId::base(self.next_group_seq);
            self.next_group_seq += 1;
            self.groups.insert(
                key.clone(),
                (id.clone(), id_value.clone(), GroupState::new(self.spec.accumulators.clone())),
            );
            id
        } else {
            emitted.push(Delta::retract(self.groups[&key].0.clone()));
            self.groups[&key].0.clone()
        };

        let (_, _, group_state) = self.groups.get_mut(&key).expect("just inserted or already present");
        group_state.on_add(&row_id, doc, &mut ctx)?;
        self.contributions.insert(row_id, (key.clone(), doc.clone()));

        let (_, id_value, group_state) = &self.groups[&key];
        emitted.push(Delta {
            row_id: group_row_id,
            sign: 1,
            doc: build_group_doc(id_value.clone(), group_state.snapshot()),
        });
        Ok(emitted)
    }

    fn on_remove(&mut self, row_id: &RowId) -> Result<Vec<Delta>> {
        let Some((key, original_doc)) = self.contributions.remove(row_id) else {
            return Ok(vec![]);
        };
        let mut ctx = EvalContext::new(&original_doc);
        let (group_row_id, id_value, group_state) = self.groups.get_mut(&key).expect("contribution implies live group");
        group_state.on_remove(row_id, &original_doc, &mut ctx)?;

        if group_state.is_empty() {
            let row_id = group_row_id.clone();
            self.groups.shift_remove(&key);
            Ok(vec![Delta::retract(row_id)])
        } else {
            let row_id = group_row_id.clone();
            let snapshot = build_group_doc(id_value.clone(), group_state.snapshot());
            Ok(vec![Delta::retract(row_id.clone()), Delta { row_id, sign: 1, doc: snapshot }])
        }
    }

    pub fn ordered_rows(&self) -> Vec<(RowId, Value)> {
        self.groups
            .values()
            .map(|(row_id, id_value, state)| (row_id.clone(), build_group_doc(id_value.clone(), state.snapshot())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::AccumulatorSpec;

    fn spec() -> GroupSpec {
        GroupSpec {
            id_expr: Value::string("$k"),
            accumulators: vec![("total".to_string(), AccumulatorSpec::Sum(Value::string("$v")))],
        }
    }

    #[test]
    fn accumulates_per_key_and_emits_update_as_retract_then_insert() {
        let mut state = GroupStageState::new(spec());
        let a = Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc: Value::doc([("k".into(), Value::string("x")), ("v".into(), Value::Number(1.0))]),
        };
        let emitted_a = state.on_delta(&a).unwrap();
        assert_eq!(emitted_a.len(), 1);
        assert_eq!(emitted_a[0].doc.get_path("total"), Value::Number(1.0));

        let b = Delta {
            row_id: RowId::base(2),
            sign: 1,
            doc: Value::doc([("k".into(), Value::string("x")), ("v".into(), Value::Number(2.0))]),
        };
        let emitted_b = state.on_delta(&b).unwrap();
        assert_eq!(emitted_b.len(), 2);
        assert_eq!(emitted_b[0].sign, -1);
        assert_eq!(emitted_b[1].sign, 1);
        assert_eq!(emitted_b[1].row_id, emitted_b[0].row_id);
        assert_eq!(emitted_b[1].doc.get_path("total"), Value::Number(3.0));
    }

    #[test]
    fn removing_last_member_retracts_the_group() {
        let mut state = GroupStageState::new(spec());
        let a = Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc: Value::doc([("k".into(), Value::string("x")), ("v".into(), Value::Number(1.0))]),
        };
        state.on_delta(&a).unwrap();
        let emitted = state.on_delta(&Delta::retract(RowId::base(1))).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].sign, -1);
        assert!(state.ordered_rows().is_empty());
    }

    #[test]
    fn group_row_id_is_reused_across_updates() {
        let mut state = GroupStageState::new(spec());
        let a = Delta {
            row_id: RowId::base(1),
            sign: 1,
            doc: Value::doc([("k".into(), Value::string("x")), ("v".into(), Value::Number(1.0))]),
        };
        let first_emit = state.on_delta(&a).unwrap();
        let first_group_id = first_emit[0].row_id.clone();

        let b = Delta {
            row_id: RowId::base(2),
            sign: 1,
            doc: Value::doc([("k".into(), Value::string("x")), ("v".into(), Value::Number(5.0))]),
        };
        let second_emit = state.on_delta(&b).unwrap();
        assert_eq!(second_emit[1].row_id, first_group_id);
    }
}
