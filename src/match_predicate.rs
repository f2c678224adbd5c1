//! `$match` predicate grammar (spec.md §4.2, "Match predicate").
//!
//! A predicate document composes per-field conditions — implicit equality,
//! or an operator document like `{"$gt": 5}` — with the top-level logical
//! combinators `$and`/`$or`/`$nor`. A condition against an array field also
//! matches when any element of the array satisfies it, mirroring
//! MongoDB's query-language behavior rather than the expression engine's
//! stricter structural equality.

use crate::error::{AggError, Result};
use crate::value::{path, Document, Value};
use regex::RegexBuilder;
use std::cmp::Ordering;

pub fn matches(doc: &Value, predicate: &Document) -> Result<bool> {
    for (key, cond) in predicate {
        let ok = match key.as_str() {
            "$and" => all_subpredicates(doc, cond)?,
            "$or" => any_subpredicate(doc, cond)?,
            "$nor" => !any_subpredicate(doc, cond)?,
            _ => field_matches(doc, key, cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_subpredicates(cond: &Value) -> Result<&[Value]> {
    match cond {
        Value::Array(items) => Ok(items),
        _ => Err(AggError::invalid_pipeline(
            "$and/$or/$nor expect an array of predicate documents",
        )),
    }
}

fn all_subpredicates(doc: &Value, cond: &Value) -> Result<bool> {
    for item in as_subpredicates(cond)? {
        let Value::Document(sub) = item else {
            return Err(AggError::invalid_pipeline("predicate array element must be a document"));
        };
        if !matches(doc, sub)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_subpredicate(doc: &Value, cond: &Value) -> Result<bool> {
    for item in as_subpredicates(cond)? {
        let Value::Document(sub) = item else {
            return Err(AggError::invalid_pipeline("predicate array element must be a document"));
        };
        if matches(doc, sub)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn field_matches(doc: &Value, field_path: &str, cond: &Value) -> Result<bool> {
    let resolved = path::get_path(doc, field_path);
    match cond {
        Value::Document(ops) if is_operator_document(ops) => {
            for (op, arg) in ops {
                if op.as_str() == "$options" {
                    continue; // consumed alongside $regex below
                }
                if !eval_field_operator(doc, field_path, &resolved, op, arg, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(matches_value_or_elements(&resolved, |v| v.structural_eq(literal))),
    }
}

fn is_operator_document(ops: &Document) -> bool {
    !ops.is_empty() && ops.keys().all(|k| k.starts_with('$'))
}

fn matches_value_or_elements(resolved: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    if pred(resolved) {
        return true;
    }
    match resolved {
        Value::Array(items) => items.iter().any(pred),
        _ => false,
    }
}

fn eval_field_operator(
    doc: &Value,
    field_path: &str,
    resolved: &Value,
    op: &str,
    arg: &Value,
    siblings: &Document,
) -> Result<bool> {
    match op {
        "$eq" => Ok(matches_value_or_elements(resolved, |v| v.structural_eq(arg))),
        "$ne" => Ok(!matches_value_or_elements(resolved, |v| v.structural_eq(arg))),
        "$gt" => Ok(matches_value_or_elements(resolved, |v| {
            v.compare(arg) == Ordering::Greater
        })),
        "$gte" => Ok(matches_value_or_elements(resolved, |v| {
            v.compare(arg) != Ordering::Less
        })),
        "$lt" => Ok(matches_value_or_elements(resolved, |v| {
            v.compare(arg) == Ordering::Less
        })),
        "$lte" => Ok(matches_value_or_elements(resolved, |v| {
            v.compare(arg) != Ordering::Greater
        })),
        "$in" => {
            let Value::Array(options) = arg else {
                return Err(AggError::invalid_pipeline("$in expects an array"));
            };
            Ok(matches_value_or_elements(resolved, |v| {
                options.iter().any(|o| o.structural_eq(v))
            }))
        }
        "$nin" => {
            let Value::Array(options) = arg else {
                return Err(AggError::invalid_pipeline("$nin expects an array"));
            };
            Ok(!matches_value_or_elements(resolved, |v| {
                options.iter().any(|o| o.structural_eq(v))
            }))
        }
        "$exists" => {
            let want = arg.is_truthy();
            Ok(path_exists(doc, field_path) == want)
        }
        "$regex" => {
            let pattern = match arg {
                Value::String(s) => s.as_str(),
                _ => return Err(AggError::invalid_pipeline("$regex expects a string pattern")),
            };
            let case_insensitive =
                matches!(siblings.get("$options"), Some(Value::String(o)) if o.contains('i'));
            let re = RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| AggError::invalid_pipeline(format!("invalid $regex pattern: {e}")))?;
            Ok(matches_value_or_elements(resolved, |v| match v {
                Value::String(s) => re.is_match(s),
                _ => false,
            }))
        }
        "$all" => {
            let Value::Array(wanted) = arg else {
                return Err(AggError::invalid_pipeline("$all expects an array"));
            };
            let Value::Array(items) = resolved else {
                return Ok(wanted.is_empty());
            };
            Ok(wanted.iter().all(|w| items.iter().any(|it| it.structural_eq(w))))
        }
        "$size" => {
            let Value::Array(items) = resolved else {
                return Ok(false);
            };
            Ok(items.len() == arg.coerce_number() as usize)
        }
        "$elemMatch" => {
            let Value::Array(items) = resolved else {
                return Ok(false);
            };
            match arg {
                Value::Document(sub) if is_operator_document(sub) => Ok(items.iter().any(|item| {
                    sub.iter()
                        .all(|(op, a)| eval_field_operator(doc, field_path, item, op, a, sub).unwrap_or(false))
                })),
                Value::Document(sub) => Ok(items.iter().any(|item| matches(item, sub).unwrap_or(false))),
                _ => Err(AggError::invalid_pipeline("$elemMatch expects a document")),
            }
        }
        other => Err(AggError::invalid_pipeline(format!("unknown match operator: {other}"))),
    }
}

/// Distinguishes "key absent" from "key present with a null value", which
/// `path::get_path`'s missing-is-null collapse cannot.
fn path_exists(doc: &Value, field_path: &str) -> bool {
    let segments: Vec<&str> = field_path.split('.').collect();
    exists_segments(doc, &segments)
}

fn exists_segments(current: &Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    match current {
        Value::Document(map) => match map.get(*first) {
            Some(v) => exists_segments(v, rest),
            None => false,
        },
        Value::Array(items) => items.iter().any(|item| exists_segments(item, segments)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Document {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn implicit_equality() {
        let doc = Value::doc([("status".into(), Value::string("active"))]);
        let p = pred([("status", Value::string("active"))]);
        assert!(matches(&doc, &p).unwrap());
        let p2 = pred([("status", Value::string("inactive"))]);
        assert!(!matches(&doc, &p2).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let doc = Value::doc([("age".into(), Value::Number(30.0))]);
        let p = pred([("age", Value::doc([("$gte".into(), Value::Number(18.0))]))]);
        assert!(matches(&doc, &p).unwrap());
        let p2 = pred([("age", Value::doc([("$lt".into(), Value::Number(18.0))]))]);
        assert!(!matches(&doc, &p2).unwrap());
    }

    #[test]
    fn array_field_matches_any_element() {
        let doc = Value::doc([(
            "tags".into(),
            Value::array([Value::string("a"), Value::string("b")]),
        )]);
        let p = pred([("tags", Value::string("b"))]);
        assert!(matches(&doc, &p).unwrap());
        let p2 = pred([("tags", Value::doc([("$gt".into(), Value::string("z"))]))]);
        assert!(!matches(&doc, &p2).unwrap());
    }

    #[test]
    fn exists_distinguishes_missing_from_null() {
        let doc = Value::doc([("a".into(), Value::Null)]);
        let has_a = pred([("a", Value::doc([("$exists".into(), Value::Bool(true))]))]);
        assert!(matches(&doc, &has_a).unwrap());
        let has_b = pred([("b", Value::doc([("$exists".into(), Value::Bool(true))]))]);
        assert!(!matches(&doc, &has_b).unwrap());
    }

    #[test]
    fn and_or_nor_composition() {
        let doc = Value::doc([("a".into(), Value::Number(1.0)), ("b".into(), Value::Number(2.0))]);
        let p = pred([(
            "$or",
            Value::array([
                Value::doc([("a".into(), Value::Number(9.0))]),
                Value::doc([("b".into(), Value::Number(2.0))]),
            ]),
        )]);
        assert!(matches(&doc, &p).unwrap());

        let nor = pred([(
            "$nor",
            Value::array([Value::doc([("a".into(), Value::Number(9.0))])]),
        )]);
        assert!(matches(&doc, &nor).unwrap());
    }

    #[test]
    fn size_and_all_and_in() {
        let doc = Value::doc([(
            "tags".into(),
            Value::array([Value::string("x"), Value::string("y")]),
        )]);
        let p = pred([("tags", Value::doc([("$size".into(), Value::Number(2.0))]))]);
        assert!(matches(&doc, &p).unwrap());

        let all_p = pred([(
            "tags",
            Value::doc([("$all".into(), Value::array([Value::string("x"), Value::string("y")]))]),
        )]);
        assert!(matches(&doc, &all_p).unwrap());

        let in_p = pred([(
            "tags",
            Value::doc([(
                "$in".into(),
                Value::array([Value::string("y"), Value::string("z")]),
            )]),
        )]);
        assert!(matches(&doc, &in_p).unwrap());
    }

    #[test]
    fn elem_match_applies_subquery_per_element() {
        let doc = Value::doc([(
            "items".into(),
            Value::array([
                Value::doc([("qty".into(), Value::Number(1.0))]),
                Value::doc([("qty".into(), Value::Number(10.0))]),
            ]),
        )]);
        let p = pred([(
            "items",
            Value::doc([(
                "$elemMatch".into(),
                Value::doc([("qty".into(), Value::doc([("$gt".into(), Value::Number(5.0))]))]),
            )]),
        )]);
        assert!(matches(&doc, &p).unwrap());
    }

    #[test]
    fn regex_matches_strings() {
        let doc = Value::doc([("name".into(), Value::string("Alice"))]);
        let p = pred([(
            "name",
            Value::doc([
                ("$regex".into(), Value::string("^al")),
                ("$options".into(), Value::string("i")),
            ]),
        )]);
        assert!(matches(&doc, &p).unwrap());
    }
}
