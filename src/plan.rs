//! The pipeline planner/compiler (spec.md §4.2, "Pipeline Planner").
//!
//! Turns a raw pipeline `Value` into a [`Stage`] list (via [`crate::stage`])
//! plus the capability flags and optimization hints the IVM path and the
//! streaming collection consult: can this pipeline be driven incrementally
//! at all, does it qualify for bounded top-k sorting, which fields need a
//! [`crate::store::Dimension`] built for them.

use crate::config::Config;
use crate::error::Result;
use crate::stage::Stage;
use crate::value::Value;
use std::collections::HashSet;

/// A compiled pipeline: the typed stage list plus everything the planner
/// could determine about it ahead of execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub stages: Vec<Stage>,

    /// Every stage in this plan supports `onAdd` (spec.md §4.3's
    /// operator contract). True for every stage type this crate parses —
    /// the truly incompatible stages (`$function`, `$merge`, `$lookup`
    /// with a sub-pipeline) are rejected by [`crate::stage::parse_pipeline`]
    /// before a plan is ever built, so this is always `true` today. Kept
    /// as an explicit flag because it is a per-plan property in the
    /// design, not a crate-wide constant, and future stages may narrow it.
    pub can_increment: bool,

    /// Every stage also supports true `onRemove` (decremental retraction)
    /// rather than falling back to a full rebuild. Same reasoning as
    /// `can_increment`: currently always `true`, computed per-plan so a
    /// future stage that can only grow (never shrink) has somewhere to
    /// report that.
    pub can_decrement: bool,

    /// The plan ends in `$sort` immediately followed by `$limit(n)` with
    /// `n < config.planner.top_k_threshold` (spec.md §4.2: "`$sort` then
    /// `$limit` with constant < threshold"), so the sort stage can run in
    /// bounded top-k mode instead of maintaining a full order-stat tree
    /// over every live row. A trailing sort+limit whose `n` is at or
    /// above the threshold still runs, just without the bounded-tree
    /// optimization — rebuilding a full tree is cheaper than the
    /// eviction bookkeeping once `n` gets large.
    pub has_sort_limit: bool,

    /// When `has_sort_limit` is set, the `$limit` bound — the sort
    /// stage's tree never holds more than this many entries.
    pub top_k_bound: Option<usize>,

    /// Every `$group` stage accumulates over a plain field-path
    /// expression for every accumulator (no derived/computed accumulator
    /// inputs) and `config.planner.vectorize_group_by` is enabled — a
    /// hint that a columnar fast path could skip per-document expression
    /// evaluation. This crate's `$group` executor does not currently act
    /// on the hint; it is surfaced for callers that want to reason about
    /// plan shape.
    pub can_vectorize: bool,

    /// Every field path read anywhere in the pipeline (by `$match`,
    /// any expression, `$sort`, `$unwind`, or `$lookup`'s `localField`),
    /// so a caller can decide which [`crate::store::Dimension`]s are
    /// worth building before registering the plan.
    pub referenced_fields: Vec<String>,
}

/// Compiles a raw pipeline document into an [`ExecutionPlan`].
pub fn compile(pipeline: &Value, config: &Config) -> Result<ExecutionPlan> {
    let stages = crate::stage::parse_pipeline(pipeline)?;

    let top_k_bound = sort_limit_tail(&stages).filter(|n| *n < config.planner.top_k_threshold);
    let has_sort_limit = top_k_bound.is_some();

    let can_vectorize = config.planner.vectorize_group_by
        && stages.iter().all(|s| match s {
            Stage::Group(spec) => spec
                .accumulators
                .iter()
                .all(|(_, acc)| accumulator_reads_plain_field(acc)),
            _ => true,
        });

    let referenced_fields = collect_referenced_fields(&stages);

    Ok(ExecutionPlan {
        stages,
        can_increment: true,
        can_decrement: true,
        has_sort_limit,
        top_k_bound,
        can_vectorize,
        referenced_fields,
    })
}

/// If the plan's last two stages are `$sort` then `$limit(n)`, returns
/// `n` — the bound a top-k sort should enforce.
fn sort_limit_tail(stages: &[Stage]) -> Option<usize> {
    let last_two = stages.len().checked_sub(2)?;
    match (&stages[last_two], &stages[last_two + 1]) {
        (Stage::Sort(_), Stage::Limit(n)) => Some(*n),
        _ => None,
    }
}

fn accumulator_reads_plain_field(spec: &crate::group::AccumulatorSpec) -> bool {
    use crate::group::AccumulatorSpec::*;
    let expr = match spec {
        Sum(e) | Avg(e) | Min(e) | Max(e) | Push(e) | AddToSet(e) | First(e) | Last(e) => e,
        Count => return true,
    };
    matches!(expr, Value::String(s) if s.starts_with('$') && !s.starts_with("$$") && !s[1..].contains('$'))
}

fn collect_referenced_fields(stages: &[Stage]) -> Vec<String> {
    let mut fields = HashSet::new();
    for stage in stages {
        match stage {
            Stage::Match(doc) => collect_field_paths_from_value(&Value::Document(doc.clone()), &mut fields),
            Stage::Project(doc) | Stage::AddFields(doc) => {
                collect_field_paths_from_value(&Value::Document(doc.clone()), &mut fields)
            }
            Stage::Sort(keys) => {
                for (field, _) in keys {
                    fields.insert(field.clone());
                }
            }
            Stage::Unwind(spec) => {
                fields.insert(spec.path.clone());
            }
            Stage::Group(spec) => {
                collect_field_paths_from_value(&spec.id_expr, &mut fields);
                for (_, acc) in &spec.accumulators {
                    if let Some(e) = accumulator_expr(acc) {
                        collect_field_paths_from_value(e, &mut fields);
                    }
                }
            }
            Stage::Lookup(spec) => {
                fields.insert(spec.local_field.clone());
            }
            Stage::Limit(_) | Stage::Skip(_) => {}
        }
    }
    let mut out: Vec<String> = fields.into_iter().collect();
    out.sort();
    out
}

fn accumulator_expr(spec: &crate::group::AccumulatorSpec) -> Option<&Value> {
    use crate::group::AccumulatorSpec::*;
    match spec {
        Sum(e) | Avg(e) | Min(e) | Max(e) | Push(e) | AddToSet(e) | First(e) | Last(e) => Some(e),
        Count => None,
    }
}

/// Walks an expression/spec value looking for `"$field.path"` string
/// literals (field references) and collects the referenced paths. This
/// is a conservative, syntactic scan — good enough for dimension
/// pre-warming, not a substitute for real expression evaluation.
fn collect_field_paths_from_value(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(path) = s.strip_prefix('$') {
                if !path.starts_with('$') && !path.is_empty() {
                    out.insert(path.to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_field_paths_from_value(item, out);
            }
        }
        Value::Document(doc) => {
            for (k, v) in doc {
                if !k.starts_with('$') {
                    out.insert(k.clone());
                }
                collect_field_paths_from_value(v, out);
            }
        }
        _ => {}
    }
}
