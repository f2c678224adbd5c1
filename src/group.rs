//! `$group` accumulators (spec.md §4.4, "Accumulators").
//!
//! Every accumulator supports both `onAdd` and true `onRemove` — no
//! accumulator here ever falls back to rescanning the group's members,
//! per the open question in spec.md §9 resolved in favor of decremental
//! updates (see DESIGN.md). `$sum`/`$avg` use Neumaier-compensated
//! summation so repeated add/remove churn doesn't drift the running
//! total; `$min`/`$max` ride a [`RefCountedMultiSet`]; `$first`/`$last`
//! ride an [`OrderStatTree`] keyed by arrival sequence so the "first/last
//! document to join the group" survives removal of everything in
//! between.

use crate::error::Result;
use crate::expr::{self, EvalContext};
use crate::store::{OrderStatTree, RefCountedMultiSet};
use crate::value::{OrdValue, RowId, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// An accumulator expression, as named in a `$group` stage's field spec,
/// e.g. `{ total: { $sum: "$amount" } }`.
#[derive(Debug, Clone)]
pub enum AccumulatorSpec {
    Sum(Value),
    Avg(Value),
    Min(Value),
    Max(Value),
    Push(Value),
    AddToSet(Value),
    Count,
    First(Value),
    Last(Value),
}

/// Compensated running sum (Neumaier's variant of Kahan summation),
/// supporting removal as the addition of a negated term.
#[derive(Debug, Clone, Default)]
struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    fn add(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    fn remove(&mut self, x: f64) {
        self.add(-x);
    }

    fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Tracks which document (by row id) arrived first/last into a group,
/// surviving removal of rows in between. Sequence numbers only ever
/// increase, so "first" and "last" are rank 0 and rank `len - 1` of the
/// live sequence set.
#[derive(Debug, Clone, Default)]
struct SequencedValues {
    live_seqs: OrderStatTree<u64>,
    values_by_seq: HashMap<u64, Value>,
    seq_by_row: HashMap<RowId, u64>,
    next_seq: u64,
}

impl SequencedValues {
    fn insert(&mut self, row_id: RowId, value: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live_seqs.insert(seq);
        self.values_by_seq.insert(seq, value);
        self.seq_by_row.insert(row_id, seq);
    }

    fn remove(&mut self, row_id: &RowId) {
        let Some(seq) = self.seq_by_row.remove(row_id) else {
            return;
        };
        self.live_seqs.remove(&seq);
        self.values_by_seq.remove(&seq);
    }

    fn first(&self) -> Value {
        self.live_seqs
            .first()
            .and_then(|seq| self.values_by_seq.get(seq))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn last(&self) -> Value {
        self.live_seqs
            .last()
            .and_then(|seq| self.values_by_seq.get(seq))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
enum AccumulatorState {
    Sum(KahanSum),
    Avg { sum: KahanSum, count: u64 },
    Min(RefCountedMultiSet<OrdValue>),
    Max(RefCountedMultiSet<OrdValue>),
    Push(IndexMap<RowId, Value>),
    AddToSet(IndexMap<RowId, Value>),
    Count(u64),
    First(SequencedValues),
    Last(SequencedValues),
}

struct Accumulator {
    spec: AccumulatorSpec,
    state: AccumulatorState,
}

impl Accumulator {
    fn new(spec: AccumulatorSpec) -> Self {
        let state = match &spec {
            AccumulatorSpec::Sum(_) => AccumulatorState::Sum(KahanSum::default()),
            AccumulatorSpec::Avg(_) => AccumulatorState::Avg {
                sum: KahanSum::default(),
                count: 0,
            },
            AccumulatorSpec::Min(_) => AccumulatorState::Min(RefCountedMultiSet::new()),
            AccumulatorSpec::Max(_) => AccumulatorState::Max(RefCountedMultiSet::new()),
            AccumulatorSpec::Push(_) => AccumulatorState::Push(IndexMap::new()),
            AccumulatorSpec::AddToSet(_) => AccumulatorState::AddToSet(IndexMap::new()),
            AccumulatorSpec::Count => AccumulatorState::Count(0),
            AccumulatorSpec::First(_) => AccumulatorState::First(SequencedValues::default()),
            AccumulatorSpec::Last(_) => AccumulatorState::Last(SequencedValues::default()),
        };
        Accumulator { spec, state }
    }

    fn expr(&self) -> Option<&Value> {
        match &self.spec {
            AccumulatorSpec::Sum(e)
            | AccumulatorSpec::Avg(e)
            | AccumulatorSpec::Min(e)
            | AccumulatorSpec::Max(e)
            | AccumulatorSpec::Push(e)
            | AccumulatorSpec::AddToSet(e)
            | AccumulatorSpec::First(e)
            | AccumulatorSpec::Last(e) => Some(e),
            AccumulatorSpec::Count => None,
        }
    }

    fn on_add(&mut self, row_id: &RowId, value: Option<Value>) {
        match &mut self.state {
            AccumulatorState::Sum(s) => s.add(value.unwrap().coerce_number()),
            AccumulatorState::Avg { sum, count } => {
                sum.add(value.unwrap().coerce_number());
                *count += 1;
            }
            AccumulatorState::Min(set) => set.insert(OrdValue(value.unwrap())),
            AccumulatorState::Max(set) => set.insert(OrdValue(value.unwrap())),
            AccumulatorState::Push(map) => {
                map.insert(row_id.clone(), value.unwrap());
            }
            AccumulatorState::AddToSet(contributions) => {
                contributions.insert(row_id.clone(), value.unwrap());
            }
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::First(seq) | AccumulatorState::Last(seq) => {
                seq.insert(row_id.clone(), value.unwrap());
            }
        }
    }

    fn on_remove(&mut self, row_id: &RowId, value: Option<&Value>) {
        match &mut self.state {
            AccumulatorState::Sum(s) => s.remove(value.unwrap().coerce_number()),
            AccumulatorState::Avg { sum, count } => {
                sum.remove(value.unwrap().coerce_number());
                *count -= 1;
            }
            AccumulatorState::Min(set) => {
                set.remove(&OrdValue(value.unwrap().clone()));
            }
            AccumulatorState::Max(set) => {
                set.remove(&OrdValue(value.unwrap().clone()));
            }
            AccumulatorState::Push(map) => {
                map.shift_remove(row_id);
            }
            AccumulatorState::AddToSet(contributions) => {
                contributions.shift_remove(row_id);
            }
            AccumulatorState::Count(n) => *n = n.saturating_sub(1),
            AccumulatorState::First(seq) | AccumulatorState::Last(seq) => seq.remove(row_id),
        }
    }

    fn snapshot(&self) -> Value {
        match &self.state {
            AccumulatorState::Sum(s) => Value::Number(s.value()),
            AccumulatorState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Number(0.0)
                } else {
                    Value::Number(sum.value() / *count as f64)
                }
            }
            AccumulatorState::Min(set) => set.min().map(|v| v.0.clone()).unwrap_or(Value::Null),
            AccumulatorState::Max(set) => set.max().map(|v| v.0.clone()).unwrap_or(Value::Null),
            AccumulatorState::Push(map) => Value::Array(map.values().cloned().collect()),
            AccumulatorState::AddToSet(contributions) => Value::Array(dedup_values(contributions.values())),
            AccumulatorState::Count(n) => Value::Number(*n as f64),
            AccumulatorState::First(seq) => seq.first(),
            AccumulatorState::Last(seq) => seq.last(),
        }
    }

}

/// Assembles a `$group` output document: `_id` first, then the group's
/// finalized accumulator fields, matching the field order every
/// executor (batch and IVM) must agree on.
pub fn build_group_doc(id_value: Value, fields: Value) -> Value {
    let mut out = crate::value::Document::new();
    out.insert("_id".to_string(), id_value);
    if let Value::Document(map) = fields {
        out.extend(map);
    }
    Value::Document(out)
}

fn dedup_values<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for v in values {
        if !out.iter().any(|seen| seen.structural_eq(v)) {
            out.push(v.clone());
        }
    }
    out
}

/// The full set of accumulators for one `$group` stage, keyed by output
/// field name in declaration order.
pub struct GroupState {
    accumulators: IndexMap<String, Accumulator>,
    member_count: u64,
}

impl GroupState {
    pub fn new(specs: Vec<(String, AccumulatorSpec)>) -> Self {
        let accumulators = specs
            .into_iter()
            .map(|(name, spec)| (name, Accumulator::new(spec)))
            .collect();
        GroupState {
            accumulators,
            member_count: 0,
        }
    }

    /// Adds `doc` (identified by `row_id`) to the group, evaluating each
    /// accumulator's expression against it.
    pub fn on_add(&mut self, row_id: &RowId, doc: &Value, ctx: &mut EvalContext) -> Result<()> {
        for acc in self.accumulators.values_mut() {
            let value = match acc.expr() {
                Some(e) => Some(expr::eval(doc, e, ctx)?),
                None => None,
            };
            acc.on_add(row_id, value);
        }
        self.member_count += 1;
        Ok(())
    }

    /// Removes `row_id` from the group. `doc` must be the same document
    /// passed to the matching `on_add`, since some accumulators need the
    /// original evaluated value to retract (e.g. `$min`'s multiset).
    pub fn on_remove(&mut self, row_id: &RowId, doc: &Value, ctx: &mut EvalContext) -> Result<()> {
        for acc in self.accumulators.values_mut() {
            let value = match acc.expr() {
                Some(e) => Some(expr::eval(doc, e, ctx)?),
                None => None,
            };
            acc.on_remove(row_id, value.as_ref());
        }
        self.member_count = self.member_count.saturating_sub(1);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.member_count == 0
    }

    pub fn member_count(&self) -> u64 {
        self.member_count
    }

    /// Materializes the current accumulator values as a result document.
    pub fn snapshot(&self) -> Value {
        Value::doc(
            self.accumulators
                .iter()
                .map(|(name, acc)| (name.clone(), acc.snapshot())),
        )
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.accumulators.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn sum_and_avg_survive_add_remove_churn() {
        let mut group = GroupState::new(vec![
            ("total".into(), AccumulatorSpec::Sum(Value::string("$amount"))),
            ("avg".into(), AccumulatorSpec::Avg(Value::string("$amount"))),
        ]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        let docs = [
            (RowId::base(1), Value::doc([("amount".into(), Value::Number(10.0))])),
            (RowId::base(2), Value::doc([("amount".into(), Value::Number(20.0))])),
            (RowId::base(3), Value::doc([("amount".into(), Value::Number(30.0))])),
        ];
        for (id, doc) in &docs {
            group.on_add(id, doc, &mut c).unwrap();
        }
        assert_eq!(group.snapshot().get_path("total"), Value::Number(60.0));
        group.on_remove(&docs[1].0, &docs[1].1, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("total"), Value::Number(40.0));
        assert_eq!(group.snapshot().get_path("avg"), Value::Number(20.0));
    }

    #[test]
    fn min_tracks_new_extremum_after_removal() {
        let mut group = GroupState::new(vec![("lowest".into(), AccumulatorSpec::Min(Value::string("$v")))]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        let a = (RowId::base(1), Value::doc([("v".into(), Value::Number(5.0))]));
        let b = (RowId::base(2), Value::doc([("v".into(), Value::Number(1.0))]));
        group.on_add(&a.0, &a.1, &mut c).unwrap();
        group.on_add(&b.0, &b.1, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("lowest"), Value::Number(1.0));
        group.on_remove(&b.0, &b.1, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("lowest"), Value::Number(5.0));
    }

    #[test]
    fn first_and_last_track_arrival_order_not_value_order() {
        let mut group = GroupState::new(vec![
            ("first_v".into(), AccumulatorSpec::First(Value::string("$v"))),
            ("last_v".into(), AccumulatorSpec::Last(Value::string("$v"))),
        ]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        let a = (RowId::base(1), Value::doc([("v".into(), Value::Number(100.0))]));
        let b = (RowId::base(2), Value::doc([("v".into(), Value::Number(1.0))]));
        group.on_add(&a.0, &a.1, &mut c).unwrap();
        group.on_add(&b.0, &b.1, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("first_v"), Value::Number(100.0));
        assert_eq!(group.snapshot().get_path("last_v"), Value::Number(1.0));
        group.on_remove(&b.0, &b.1, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("last_v"), Value::Number(100.0));
    }

    #[test]
    fn push_preserves_arrival_order_after_interior_removal() {
        let mut group = GroupState::new(vec![("vals".into(), AccumulatorSpec::Push(Value::string("$v")))]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        let rows = [
            (RowId::base(1), Value::doc([("v".into(), Value::Number(1.0))])),
            (RowId::base(2), Value::doc([("v".into(), Value::Number(2.0))])),
            (RowId::base(3), Value::doc([("v".into(), Value::Number(3.0))])),
        ];
        for (id, doc) in &rows {
            group.on_add(id, doc, &mut c).unwrap();
        }
        group.on_remove(&rows[1].0, &rows[1].1, &mut c).unwrap();
        assert_eq!(
            group.snapshot().get_path("vals"),
            Value::array([Value::Number(1.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn add_to_set_dedups_and_survives_partial_removal() {
        let mut group = GroupState::new(vec![("tags".into(), AccumulatorSpec::AddToSet(Value::string("$t")))]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        let rows = [
            (RowId::base(1), Value::doc([("t".into(), Value::string("x"))])),
            (RowId::base(2), Value::doc([("t".into(), Value::string("x"))])),
            (RowId::base(3), Value::doc([("t".into(), Value::string("y"))])),
        ];
        for (id, doc) in &rows {
            group.on_add(id, doc, &mut c).unwrap();
        }
        group.on_remove(&rows[0].0, &rows[0].1, &mut c).unwrap();
        let snapshot = group.snapshot();
        let Value::Array(tags) = snapshot.get_path("tags") else {
            panic!("expected array");
        };
        assert!(tags.iter().any(|v| v.structural_eq(&Value::string("x"))));
        assert!(tags.iter().any(|v| v.structural_eq(&Value::string("y"))));
    }

    #[test]
    fn count_ignores_expression() {
        let mut group = GroupState::new(vec![("n".into(), AccumulatorSpec::Count)]);
        let root = Value::Null;
        let mut c = EvalContext::new(&root);
        group.on_add(&RowId::base(1), &Value::Null, &mut c).unwrap();
        group.on_add(&RowId::base(2), &Value::Null, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("n"), Value::Number(2.0));
        group.on_remove(&RowId::base(1), &Value::Null, &mut c).unwrap();
        assert_eq!(group.snapshot().get_path("n"), Value::Number(1.0));
    }
}
