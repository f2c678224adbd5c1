//! Incremental view maintenance: per-stage operators and the chain that
//! strings them together (spec.md §4.3, "IVM Operator Contracts").
//!
//! Every stage operator implements the same small contract: `on_delta`
//! consumes a `(rowId, sign, doc)` event from the stage before it and
//! emits zero or more events for the stage after it; `ordered_rows`
//! materializes the stage's current output in order, on demand, from
//! whatever incremental structure the operator already maintains (a
//! [`crate::store::OrderStatTree`] for `$sort`, group insertion order for
//! `$group`, arrival order everywhere else). Nothing here rescans the
//! live set to answer a query — that's what makes this "incremental"
//! rather than "batch, called often."
//!
//! A base-row delta enters at the first stage; `IvmChain::on_add`/
//! `on_remove` fan it through every stage in turn, threading each
//! stage's emitted deltas into the next. `IvmChain::materialize` instead
//! reconstructs the final ordered result by asking each stage, in turn,
//! to transform the ordered output of the one before it — this is how
//! `$limit`/`$skip` work, since they hold no delta-time state at all
//! (spec.md §4.3: "State: none").

mod group_stage;
mod lookup_stage;
mod project_stage;
mod sort_stage;
mod unwind_stage;

use crate::error::Result;
use crate::foreign::ForeignSource;
use crate::stage::Stage;
use crate::value::{RowId, Value};
use indexmap::IndexMap;

pub use sort_stage::SortState;

/// A single-row change propagating through a plan: `sign: 1` is an
/// insertion, `sign: -1` a retraction. `doc` is the effective document
/// at this point in the chain — only meaningful (and only read by
/// operators) when `sign` is `1`; every operator reconstructs what it
/// needs to retract from its own cache, so a removal event carries no
/// payload.
#[derive(Debug, Clone)]
pub struct Delta {
    pub row_id: RowId,
    pub sign: i8,
    pub doc: Value,
}

impl Delta {
    fn insert(row_id: RowId, doc: Value) -> Self {
        Delta { row_id, sign: 1, doc }
    }

    fn retract(row_id: RowId) -> Self {
        Delta {
            row_id,
            sign: -1,
            doc: Value::Null,
        }
    }
}

/// A cache of "what did I last emit for this upstream row", shared by
/// the stages that pass rows through 1:1 (`$match`, `$project`/
/// `$addFields`, `$lookup`): answers "is this upstream row still active
/// here, and if so what's its current effective document" in O(1),
/// without dictating any order of its own — `ordered_rows` below
/// defers entirely to whatever order the upstream stage produced.
#[derive(Default)]
struct PassthroughCache {
    docs: IndexMap<RowId, Value>,
}

impl PassthroughCache {
    fn insert(&mut self, row_id: RowId, doc: Value) {
        self.docs.insert(row_id, doc);
    }

    fn remove(&mut self, row_id: &RowId) -> bool {
        self.docs.shift_remove(row_id).is_some()
    }

    /// Walks `upstream` in its given order, keeping only the rows still
    /// present in this cache and substituting each one's cached
    /// effective document. A passthrough stage has no ordering of its
    /// own — it must defer to whatever order the stage before it
    /// produced (e.g. a `$sort` upstream of a `$match`/`$project`), not
    /// its own arrival-order cache.
    fn ordered_rows(&self, upstream: &[(RowId, Value)]) -> Vec<(RowId, Value)> {
        upstream
            .iter()
            .filter_map(|(id, _)| self.docs.get(id).map(|doc| (id.clone(), doc.clone())))
            .collect()
    }
}

struct MatchState {
    predicate: crate::value::Document,
    cache: PassthroughCache,
}

impl MatchState {
    fn on_delta(&mut self, delta: &Delta) -> Result<Vec<Delta>> {
        if delta.sign > 0 {
            if crate::match_predicate::matches(&delta.doc, &self.predicate)? {
                self.cache.insert(delta.row_id.clone(), delta.doc.clone());
                Ok(vec![Delta::insert(delta.row_id.clone(), delta.doc.clone())])
            } else {
                Ok(vec![])
            }
        } else if self.cache.remove(&delta.row_id) {
            Ok(vec![Delta::retract(delta.row_id.clone())])
        } else {
            Ok(vec![])
        }
    }
}

/// `$limit`/`$skip` hold no per-delta state (spec.md §4.3): every delta
/// passes through unchanged, and the actual bound is applied only when
/// materializing the ordered result.
#[derive(Clone, Copy)]
enum Bound {
    Limit(usize),
    Skip(usize),
}

impl Bound {
    fn apply(self, upstream: &[(RowId, Value)]) -> Vec<(RowId, Value)> {
        match self {
            Bound::Limit(n) => upstream.iter().take(n).cloned().collect(),
            Bound::Skip(n) => upstream.iter().skip(n).cloned().collect(),
        }
    }
}

enum StageRuntime {
    Match(MatchState),
    Project(project_stage::ProjectState),
    AddFields(project_stage::AddFieldsState),
    Sort(sort_stage::SortState),
    Bound(Bound),
    Unwind(unwind_stage::UnwindState),
    Group(group_stage::GroupStageState),
    Lookup(lookup_stage::LookupState),
}

impl StageRuntime {
    fn on_delta(&mut self, delta: &Delta) -> Result<Vec<Delta>> {
        match self {
            StageRuntime::Match(s) => s.on_delta(delta),
            StageRuntime::Project(s) => s.on_delta(delta),
            StageRuntime::AddFields(s) => s.on_delta(delta),
            StageRuntime::Sort(s) => Ok(s.on_delta(delta)),
            StageRuntime::Bound(_) => Ok(vec![delta.clone()]),
            StageRuntime::Unwind(s) => Ok(s.on_delta(delta)),
            StageRuntime::Group(s) => s.on_delta(delta),
            StageRuntime::Lookup(s) => Ok(s.on_delta(delta)),
        }
    }

    fn ordered_rows(&self, upstream: &[(RowId, Value)]) -> Vec<(RowId, Value)> {
        match self {
            StageRuntime::Match(s) => s.cache.ordered_rows(upstream),
            StageRuntime::Project(s) => s.cache.ordered_rows(upstream),
            StageRuntime::AddFields(s) => s.cache.ordered_rows(upstream),
            StageRuntime::Sort(s) => s.ordered_rows(),
            StageRuntime::Bound(b) => b.apply(upstream),
            StageRuntime::Unwind(s) => s.ordered_rows(upstream),
            StageRuntime::Group(s) => s.ordered_rows(),
            StageRuntime::Lookup(s) => s.cache.ordered_rows(upstream),
        }
    }
}

/// A compiled, incrementally-maintained pipeline. Holds one runtime
/// operator per stage and drives deltas through them in order.
pub struct IvmChain {
    stages: Vec<StageRuntime>,
}

impl IvmChain {
    /// Builds the runtime chain for `stages`. `top_k_bound` is the
    /// planner's `ExecutionPlan::top_k_bound` — when set, the last
    /// `$sort` immediately before a trailing `$limit` is built in
    /// bounded top-k mode instead of an unbounded order-stat tree.
    /// `foreign` supplies `$lookup`'s joined collection once, up front,
    /// per this module's "foreign collection is immutable for the
    /// plan's lifetime" assumption (spec.md §4.3, "Lookup").
    pub fn build(stages: &[Stage], foreign: &dyn ForeignSource, top_k_bound: Option<usize>) -> Result<IvmChain> {
        let mut runtimes = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            let is_bounded_sort_tail = top_k_bound.is_some()
                && i + 1 == stages.len().saturating_sub(1)
                && matches!(stages.get(i + 1), Some(Stage::Limit(_)));
            let runtime = match stage {
                Stage::Match(pred) => StageRuntime::Match(MatchState {
                    predicate: pred.clone(),
                    cache: PassthroughCache::default(),
                }),
                Stage::Project(spec) => StageRuntime::Project(project_stage::ProjectState::new(spec.clone())),
                Stage::AddFields(spec) => StageRuntime::AddFields(project_stage::AddFieldsState::new(spec.clone())),
                Stage::Sort(fields) => {
                    let cap = if is_bounded_sort_tail { top_k_bound } else { None };
                    StageRuntime::Sort(sort_stage::SortState::new(fields.clone(), cap))
                }
                Stage::Limit(n) => StageRuntime::Bound(Bound::Limit(*n)),
                Stage::Skip(n) => StageRuntime::Bound(Bound::Skip(*n)),
                Stage::Unwind(spec) => StageRuntime::Unwind(unwind_stage::UnwindState::new(spec.clone())),
                Stage::Group(spec) => StageRuntime::Group(group_stage::GroupStageState::new(spec.clone())),
                Stage::Lookup(spec) => {
                    let foreign_docs = foreign.documents(&spec.from);
                    StageRuntime::Lookup(lookup_stage::LookupState::new(spec.clone(), foreign_docs))
                }
            };
            runtimes.push(runtime);
        }
        Ok(IvmChain { stages: runtimes })
    }

    /// Feeds one base-row insertion through every stage.
    pub fn on_add(&mut self, row_id: RowId, doc: Value) -> Result<()> {
        self.propagate(Delta::insert(row_id, doc))
    }

    /// Feeds one base-row retraction through every stage. `doc` is not
    /// needed: every operator reconstructs what it must undo from its
    /// own cache, keyed by `row_id`.
    pub fn on_remove(&mut self, row_id: RowId) -> Result<()> {
        self.propagate(Delta::retract(row_id))
    }

    fn propagate(&mut self, seed: Delta) -> Result<()> {
        let mut deltas = vec![seed];
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(deltas.len());
            for d in &deltas {
                next.extend(stage.on_delta(d)?);
            }
            deltas = next;
        }
        Ok(())
    }

    /// Materializes the plan's current result in order, given the base
    /// collection's currently-live rows in arrival order.
    pub fn materialize(&self, base_ordered: Vec<(RowId, Value)>) -> Vec<Value> {
        let mut rows = base_ordered;
        for stage in &self.stages {
            rows = stage.ordered_rows(&rows);
        }
        rows.into_iter().map(|(_, doc)| doc).collect()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::NoForeign;
    use crate::stage::parse_pipeline;

    fn build(pipeline: Value) -> IvmChain {
        let stages = parse_pipeline(&pipeline).unwrap();
        IvmChain::build(&stages, &NoForeign, None).unwrap()
    }

    #[test]
    fn match_then_group_matches_batch_ground_truth() {
        let pipeline = Value::array([
            Value::doc([("$match".into(), Value::doc([("a".into(), Value::doc([("$gte".into(), Value::Number(2.0))]))]))]),
            Value::doc([(
                "$group".into(),
                Value::doc([
                    ("_id".into(), Value::Null),
                    ("s".into(), Value::doc([("$sum".into(), Value::string("$a"))])),
                ]),
            )]),
        ]);
        let mut chain = build(pipeline);
        for (i, v) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            chain.on_add(RowId::base(i as u64), Value::doc([("a".into(), Value::Number(v))])).unwrap();
        }
        let result = chain.materialize(vec![]);
        assert_eq!(result, vec![Value::doc([("_id".into(), Value::Null), ("s".into(), Value::Number(5.0))])]);

        chain.on_remove(RowId::base(2)).unwrap();
        let result = chain.materialize(vec![]);
        assert_eq!(result, vec![Value::doc([("_id".into(), Value::Null), ("s".into(), Value::Number(2.0))])]);
    }

    #[test]
    fn sort_limit_keeps_k_smallest_under_churn() {
        let pipeline = Value::array([
            Value::doc([("$sort".into(), Value::doc([("n".into(), Value::Number(1.0))]))]),
            Value::doc([("$limit".into(), Value::Number(3.0))]),
        ]);
        let stages = parse_pipeline(&pipeline).unwrap();
        let mut chain = IvmChain::build(&stages, &NoForeign, Some(3)).unwrap();
        for (i, v) in [5.0, 1.0, 4.0, 2.0, 3.0].into_iter().enumerate() {
            chain.on_add(RowId::base(i as u64), Value::doc([("n".into(), Value::Number(v))])).unwrap();
        }
        let result = chain.materialize(vec![]);
        let ns: Vec<f64> = result.iter().map(|d| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![1.0, 2.0, 3.0]);
    }

    /// A reshaping stage placed after a reordering stage must preserve
    /// the reordering stage's order, not its own arrival-order cache
    /// (spec.md §8's "Equivalence under IVM").
    #[test]
    fn add_fields_after_sort_preserves_sort_order() {
        let pipeline = Value::array([
            Value::doc([("$sort".into(), Value::doc([("n".into(), Value::Number(-1.0))]))]),
            Value::doc([(
                "$addFields".into(),
                Value::doc([("m".into(), Value::doc([("$add".into(), Value::array([Value::string("$n"), Value::Number(1.0)]))]))]),
            )]),
        ]);
        let mut chain = build(pipeline);
        for (i, v) in [1.0, 3.0, 2.0].into_iter().enumerate() {
            chain.on_add(RowId::base(i as u64), Value::doc([("n".into(), Value::Number(v))])).unwrap();
        }
        let base_ordered: Vec<(RowId, Value)> = (0..3).map(|i| (RowId::base(i), Value::Null)).collect();
        let result = chain.materialize(base_ordered);
        let ns: Vec<f64> = result.iter().map(|d| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![3.0, 2.0, 1.0]);
    }

    /// A leading `$limit`/`$skip` holds no delta-time state at all; it
    /// must see the live base rows when materializing, not an empty seed.
    #[test]
    fn leading_limit_sees_live_rows_when_seeded_with_them() {
        let pipeline = Value::array([Value::doc([("$limit".into(), Value::Number(2.0))])]);
        let mut chain = build(pipeline);
        let base_ordered: Vec<(RowId, Value)> = (0..4)
            .map(|i| (RowId::base(i), Value::doc([("n".into(), Value::Number(i as f64))])))
            .collect();
        for (id, doc) in &base_ordered {
            chain.on_add(id.clone(), doc.clone()).unwrap();
        }
        let result = chain.materialize(base_ordered);
        let ns: Vec<f64> = result.iter().map(|d| d.get_path("n").as_f64().unwrap()).collect();
        assert_eq!(ns, vec![0.0, 1.0]);
    }
}
