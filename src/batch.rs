//! The batch executor (spec.md §4.4): non-incremental ground truth.
//!
//! Runs an arbitrary compiled pipeline over a snapshot sequence of
//! documents, stage by stage. The IVM path (`src/ivm/*`) must agree with
//! this executor's output for any live-set snapshot — that equivalence
//! is spec.md §8's first testable property. This is also the fallback
//! path used when a plan's incremental state is discarded after an
//! operator error (spec.md §4.3, "Failure semantics"), and the only path
//! for stages outside IVM's capability table (full lookups with a
//! mutable foreign source, etc.).

use crate::error::Result;
use crate::expr::{self, EvalContext};
use crate::foreign::ForeignSource;
use crate::group::GroupState;
use crate::match_predicate;
use crate::stage::{Stage, UnwindSpec};
use crate::value::{Document, OrdValue, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Runs `stages` over `docs`, in order, returning the materialized result.
pub fn run(stages: &[Stage], docs: Vec<Value>, foreign: &dyn ForeignSource) -> Result<Vec<Value>> {
    let mut current = docs;
    for stage in stages {
        current = run_stage(stage, current, foreign)?;
    }
    Ok(current)
}

fn run_stage(stage: &Stage, docs: Vec<Value>, foreign: &dyn ForeignSource) -> Result<Vec<Value>> {
    match stage {
        Stage::Match(pred) => run_match(pred, docs),
        Stage::Project(spec) => run_project(spec, docs),
        Stage::AddFields(spec) => run_add_fields(spec, docs),
        Stage::Sort(keys) => Ok(run_sort(keys, docs)),
        Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Unwind(spec) => Ok(run_unwind(spec, docs)),
        Stage::Group(spec) => run_group(spec, docs),
        Stage::Lookup(spec) => Ok(run_lookup(spec, docs, foreign)),
    }
}

fn run_match(pred: &Document, docs: Vec<Value>) -> Result<Vec<Value>> {
    docs.into_iter()
        .map(|d| match_predicate::matches(&d, pred).map(|keep| (keep, d)))
        .collect::<Result<Vec<_>>>()
        .map(|pairs| pairs.into_iter().filter(|(keep, _)| *keep).map(|(_, d)| d).collect())
}

fn run_project(spec: &Document, docs: Vec<Value>) -> Result<Vec<Value>> {
    docs.into_iter()
        .map(|d| {
            let mut ctx = EvalContext::new(&d);
            crate::expr::object_shape::project(&d, spec, &mut ctx)
        })
        .collect()
}

fn run_add_fields(spec: &Document, docs: Vec<Value>) -> Result<Vec<Value>> {
    docs.into_iter()
        .map(|d| {
            let mut ctx = EvalContext::new(&d);
            let computed = crate::expr::object_shape::project(&d, spec, &mut ctx)?;
            Ok(merge_fields(d, computed))
        })
        .collect()
}

/// Merges `computed`'s top-level fields onto `base`, overwriting any
/// field of the same name; fields `$$REMOVE`d during projection are
/// already absent from `computed`.
fn merge_fields(base: Value, computed: Value) -> Value {
    let Value::Document(mut base_map) = base else {
        return base;
    };
    let Value::Document(computed_map) = computed else {
        return Value::Document(base_map);
    };
    for (k, v) in computed_map {
        base_map.insert(k, v);
    }
    Value::Document(base_map)
}

/// The composite sort key for one document: one value per `$sort` field,
/// each pre-negated-by-direction via [`crate::value::OrdValue`] plus an
/// explicit reversal flag so `Ord` alone can't be used — we fold the
/// direction into the comparison instead.
fn sort_key(doc: &Value, fields: &[(String, i32)]) -> Vec<Value> {
    fields.iter().map(|(f, _)| doc.get_path(f)).collect()
}

fn compare_sort_keys(a: &[Value], b: &[Value], fields: &[(String, i32)]) -> std::cmp::Ordering {
    for ((av, bv), (_, dir)) in a.iter().zip(b.iter()).zip(fields.iter()) {
        let c = av.compare(bv);
        let c = if *dir < 0 { c.reverse() } else { c };
        if c != std::cmp::Ordering::Equal {
            return c;
        }
    }
    std::cmp::Ordering::Equal
}

fn run_sort(fields: &[(String, i32)], docs: Vec<Value>) -> Vec<Value> {
    let mut keyed: Vec<(Vec<Value>, Value)> = docs.into_iter().map(|d| (sort_key(&d, fields), d)).collect();
    keyed.sort_by(|(ka, _), (kb, _)| compare_sort_keys(ka, kb, fields));
    keyed.into_iter().map(|(_, d)| d).collect()
}

fn run_unwind(spec: &UnwindSpec, docs: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let array_val = doc.get_path(&spec.path);
        match array_val {
            Value::Array(items) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    out.push(unwind_child(&doc, spec, Some(item), Some(i)));
                }
            }
            _ => {
                if spec.preserve_null_and_empty_arrays {
                    out.push(unwind_child(&doc, spec, None, None));
                }
            }
        }
    }
    out
}

fn unwind_child(doc: &Value, spec: &UnwindSpec, element: Option<Value>, index: Option<usize>) -> Value {
    let mut out = doc.clone();
    let value = element.unwrap_or(Value::Null);
    crate::value::path::set_path(&mut out, &spec.path, value);
    if let Some(idx_field) = &spec.include_array_index {
        let idx_value = index.map(|i| Value::Number(i as f64)).unwrap_or(Value::Null);
        crate::value::path::set_path(&mut out, idx_field, idx_value);
    }
    out
}

fn run_group(spec: &crate::stage::GroupSpec, docs: Vec<Value>) -> Result<Vec<Value>> {
    let mut groups: IndexMap<OrdValue, (Value, GroupState)> = IndexMap::new();
    let mut seq: u64 = 0;
    for doc in &docs {
        let mut ctx = EvalContext::new(doc);
        let id_value = expr::eval(doc, &spec.id_expr, &mut ctx)?;
        let key = OrdValue(id_value.clone());
        let entry = groups
            .entry(key)
            .or_insert_with(|| (id_value, GroupState::new(spec.accumulators.clone())));
        let row_id = crate::value::RowId::base(seq);
        seq += 1;
        entry.1.on_add(&row_id, doc, &mut ctx)?;
    }
    Ok(groups
        .into_values()
        .map(|(id_value, state)| {
            let mut out = Document::new();
            out.insert("_id".to_string(), id_value);
            if let Value::Document(fields) = state.snapshot() {
                out.extend(fields);
            }
            Value::Document(out)
        })
        .collect())
}

fn run_lookup(spec: &crate::stage::LookupSpec, docs: Vec<Value>, foreign: &dyn ForeignSource) -> Vec<Value> {
    let foreign_docs = foreign.documents(&spec.from);
    let mut index: HashMap<OrdValue, Vec<Value>> = HashMap::new();
    for fdoc in &foreign_docs {
        let key = fdoc.get_path(&spec.foreign_field);
        index.entry(OrdValue(key)).or_default().push(fdoc.clone());
    }
    docs.into_iter()
        .map(|doc| {
            let local_val = doc.get_path(&spec.local_field);
            let matches = match &local_val {
                Value::Array(items) => {
                    let mut out = Vec::new();
                    for item in items {
                        if let Some(v) = index.get(&OrdValue(item.clone())) {
                            out.extend(v.iter().cloned());
                        }
                    }
                    out
                }
                other => index.get(&OrdValue(other.clone())).cloned().unwrap_or_default(),
            };
            let Value::Document(mut map) = doc else {
                return Value::Null;
            };
            map.insert(spec.as_field.clone(), Value::Array(matches));
            Value::Document(map)
        })
        .collect()
}
