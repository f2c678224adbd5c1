//! Pipeline stage grammar (spec.md §6, "Pipeline format").
//!
//! A pipeline is an ordered sequence of single-key stage documents. This
//! module turns that raw `Value` shape into a typed [`Stage`] the planner
//! and both executors (batch and IVM) share, so stage semantics are
//! defined exactly once.

use crate::error::{AggError, Result};
use crate::group::AccumulatorSpec;
use crate::value::{Document, Value};

/// `1` for ascending, `-1` for descending — a `$sort` spec field.
pub type SortDirection = i32;

#[derive(Debug, Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id_expr: Value,
    /// Output field name -> accumulator, in declaration order.
    pub accumulators: Vec<(String, AccumulatorSpec)>,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    AddFields(Document),
    Sort(Vec<(String, SortDirection)>),
    Limit(usize),
    Skip(usize),
    Unwind(UnwindSpec),
    Group(GroupSpec),
    Lookup(LookupSpec),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Unwind(_) => "$unwind",
            Stage::Group(_) => "$group",
            Stage::Lookup(_) => "$lookup",
        }
    }
}

const UNSUPPORTED_STAGES: &[&str] = &["$function", "$where", "$merge", "$out"];

/// Parses a full pipeline: an array of single-key stage documents.
pub fn parse_pipeline(pipeline: &Value) -> Result<Vec<Stage>> {
    let Value::Array(stages) = pipeline else {
        return Err(AggError::invalid_pipeline("pipeline must be an array of stage documents"));
    };
    stages.iter().map(parse_stage).collect()
}

fn parse_stage(raw: &Value) -> Result<Stage> {
    let Value::Document(doc) = raw else {
        return Err(AggError::invalid_pipeline("each pipeline stage must be a document"));
    };
    if doc.len() != 1 {
        return Err(AggError::invalid_pipeline("each pipeline stage must have exactly one key"));
    }
    let (key, value) = doc.iter().next().expect("checked len == 1");
    if UNSUPPORTED_STAGES.contains(&key.as_str()) {
        return Err(AggError::invalid_pipeline(format!(
            "{key} is not supported: arbitrary user code / durable-output stages are out of scope"
        )));
    }
    match key.as_str() {
        "$match" => {
            let Value::Document(pred) = value else {
                return Err(AggError::invalid_pipeline("$match expects a document"));
            };
            Ok(Stage::Match(pred.clone()))
        }
        "$project" => {
            let Value::Document(spec) = value else {
                return Err(AggError::invalid_pipeline("$project expects a document"));
            };
            Ok(Stage::Project(spec.clone()))
        }
        "$addFields" | "$set" => {
            let Value::Document(spec) = value else {
                return Err(AggError::invalid_pipeline("$addFields/$set expects a document"));
            };
            Ok(Stage::AddFields(spec.clone()))
        }
        "$sort" => parse_sort(value),
        "$limit" => Ok(Stage::Limit(parse_nonneg_int(value, "$limit")?)),
        "$skip" => Ok(Stage::Skip(parse_nonneg_int(value, "$skip")?)),
        "$unwind" => parse_unwind(value),
        "$group" => parse_group(value),
        "$lookup" => parse_lookup(value),
        other => Err(AggError::invalid_pipeline(format!("unrecognized stage: {other}"))),
    }
}

fn parse_nonneg_int(value: &Value, stage: &str) -> Result<usize> {
    match value {
        Value::Number(n) if *n >= 0.0 => Ok(*n as usize),
        _ => Err(AggError::invalid_pipeline(format!("{stage} expects a non-negative number"))),
    }
}

fn parse_sort(value: &Value) -> Result<Stage> {
    let Value::Document(spec) = value else {
        return Err(AggError::invalid_pipeline("$sort expects a document"));
    };
    let mut keys = Vec::with_capacity(spec.len());
    for (field, dir) in spec {
        let dir = match dir {
            Value::Number(n) if *n == 1.0 => 1,
            Value::Number(n) if *n == -1.0 => -1,
            _ => return Err(AggError::invalid_pipeline("$sort direction must be 1 or -1")),
        };
        keys.push((field.clone(), dir));
    }
    Ok(Stage::Sort(keys))
}

fn parse_unwind(value: &Value) -> Result<Stage> {
    match value {
        Value::String(path_str) => {
            let path = path_str
                .strip_prefix('$')
                .ok_or_else(|| AggError::invalid_pipeline("$unwind path must start with '$'"))?
                .to_string();
            Ok(Stage::Unwind(UnwindSpec {
                path,
                include_array_index: None,
                preserve_null_and_empty_arrays: false,
            }))
        }
        Value::Document(spec) => {
            let path_str = match spec.get("path") {
                Some(Value::String(s)) => s.clone(),
                _ => return Err(AggError::invalid_pipeline("$unwind requires a string 'path'")),
            };
            let path = path_str
                .strip_prefix('$')
                .ok_or_else(|| AggError::invalid_pipeline("$unwind path must start with '$'"))?
                .to_string();
            let include_array_index = match spec.get("includeArrayIndex") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                _ => return Err(AggError::invalid_pipeline("includeArrayIndex must be a string")),
            };
            let preserve_null_and_empty_arrays = spec
                .get("preserveNullAndEmptyArrays")
                .map(Value::is_truthy)
                .unwrap_or(false);
            Ok(Stage::Unwind(UnwindSpec {
                path,
                include_array_index,
                preserve_null_and_empty_arrays,
            }))
        }
        _ => Err(AggError::invalid_pipeline("$unwind expects a string or document")),
    }
}

fn parse_group(value: &Value) -> Result<Stage> {
    let Value::Document(spec) = value else {
        return Err(AggError::invalid_pipeline("$group expects a document"));
    };
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| AggError::invalid_pipeline("$group requires an _id"))?
        .clone();
    let mut accumulators = Vec::with_capacity(spec.len().saturating_sub(1));
    for (field, field_spec) in spec {
        if field == "_id" {
            continue;
        }
        let Value::Document(acc_doc) = field_spec else {
            return Err(AggError::invalid_pipeline(format!(
                "$group field '{field}' must be an accumulator document"
            )));
        };
        if acc_doc.len() != 1 {
            return Err(AggError::invalid_pipeline(format!(
                "$group field '{field}' must name exactly one accumulator"
            )));
        }
        let (acc_name, acc_expr) = acc_doc.iter().next().expect("checked len == 1");
        let spec = parse_accumulator(acc_name, acc_expr)?;
        accumulators.push((field.clone(), spec));
    }
    Ok(Stage::Group(GroupSpec { id_expr, accumulators }))
}

fn parse_accumulator(name: &str, expr: &Value) -> Result<AccumulatorSpec> {
    Ok(match name {
        "$sum" => AccumulatorSpec::Sum(expr.clone()),
        "$avg" => AccumulatorSpec::Avg(expr.clone()),
        "$min" => AccumulatorSpec::Min(expr.clone()),
        "$max" => AccumulatorSpec::Max(expr.clone()),
        "$push" => AccumulatorSpec::Push(expr.clone()),
        "$addToSet" => AccumulatorSpec::AddToSet(expr.clone()),
        "$first" => AccumulatorSpec::First(expr.clone()),
        "$last" => AccumulatorSpec::Last(expr.clone()),
        "$count" => AccumulatorSpec::Count,
        other => {
            return Err(AggError::unknown_operator(format!(
                "{other} is not a supported $group accumulator"
            )))
        }
    })
}

fn parse_lookup(value: &Value) -> Result<Stage> {
    let Value::Document(spec) = value else {
        return Err(AggError::invalid_pipeline("$lookup expects a document"));
    };
    if spec.contains_key("pipeline") || spec.contains_key("let") {
        return Err(AggError::invalid_pipeline(
            "$lookup with a sub-pipeline/let bindings is not supported; use localField/foreignField",
        ));
    }
    let get_str = |key: &str| -> Result<String> {
        match spec.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(AggError::invalid_pipeline(format!("$lookup requires a string '{key}'"))),
        }
    };
    Ok(Stage::Lookup(LookupSpec {
        from: get_str("from")?,
        local_field: get_str("localField")?,
        foreign_field: get_str("foreignField")?,
        as_field: get_str("as")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_match_project_sort_limit() {
        let pipeline = Value::array([
            Value::doc([("$match".into(), Value::doc([("a".into(), Value::Number(1.0))]))]),
            Value::doc([("$sort".into(), Value::doc([("a".into(), Value::Number(1.0))]))]),
            Value::doc([("$limit".into(), Value::Number(5.0))]),
        ]);
        let stages = parse_pipeline(&pipeline).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].name(), "$match");
        assert_eq!(stages[1].name(), "$sort");
        assert_eq!(stages[2].name(), "$limit");
    }

    #[test]
    fn rejects_unsupported_stage() {
        let pipeline = Value::array([Value::doc([("$function".into(), Value::Null)])]);
        let err = parse_pipeline(&pipeline).unwrap_err();
        assert!(matches!(err, AggError::InvalidPipeline(_)));
    }

    #[test]
    fn rejects_lookup_with_subpipeline() {
        let pipeline = Value::array([Value::doc([(
            "$lookup".into(),
            Value::doc([
                ("from".into(), Value::string("other")),
                ("pipeline".into(), Value::array([])),
                ("as".into(), Value::string("joined")),
            ]),
        )])]);
        let err = parse_pipeline(&pipeline).unwrap_err();
        assert!(matches!(err, AggError::InvalidPipeline(_)));
    }

    #[test]
    fn parses_unwind_shorthand_and_object_form() {
        let shorthand = Value::array([Value::doc([("$unwind".into(), Value::string("$tags"))])]);
        let Stage::Unwind(spec) = &parse_pipeline(&shorthand).unwrap()[0] else {
            panic!("expected unwind");
        };
        assert_eq!(spec.path, "tags");
        assert!(!spec.preserve_null_and_empty_arrays);

        let object_form = Value::array([Value::doc([(
            "$unwind".into(),
            Value::doc([
                ("path".into(), Value::string("$tags")),
                ("includeArrayIndex".into(), Value::string("idx")),
                ("preserveNullAndEmptyArrays".into(), Value::Bool(true)),
            ]),
        )])]);
        let Stage::Unwind(spec2) = &parse_pipeline(&object_form).unwrap()[0] else {
            panic!("expected unwind");
        };
        assert_eq!(spec2.include_array_index.as_deref(), Some("idx"));
        assert!(spec2.preserve_null_and_empty_arrays);
    }

    #[test]
    fn parses_group_accumulators() {
        let pipeline = Value::array([Value::doc([(
            "$group".into(),
            Value::doc([
                ("_id".into(), Value::string("$x")),
                ("total".into(), Value::doc([("$sum".into(), Value::string("$v"))])),
            ]),
        )])]);
        let Stage::Group(spec) = &parse_pipeline(&pipeline).unwrap()[0] else {
            panic!("expected group");
        };
        assert_eq!(spec.accumulators.len(), 1);
        assert_eq!(spec.accumulators[0].0, "total");
    }
}
