//! Object-shape projection (spec.md §4.1, "Object shape").
//!
//! A mapping of output keys to sub-expressions, evaluated against a
//! `(current, root)` pair with MongoDB-`$project`-style inclusion rules:
//! `1`/`true` passes the same key through from `current`, `0`/`false`
//! omits it, a bare string is resolved as a path against `root`, a nested
//! document/array recurses as a sub-projection when the same key in
//! `current` is itself a document/array, and anything else is evaluated
//! as a computed expression.

use super::context::EvalContext;
use super::{eval, is_remove_sentinel};
use crate::error::Result;
use crate::value::{path, Document, Value};

/// Project `spec` (an object-shape document, e.g. a `$project` argument)
/// against `current`. Returns the projected document.
pub fn project(current: &Value, spec: &Document, ctx: &mut EvalContext) -> Result<Value> {
    let mut out = Document::new();
    for (key, value_spec) in spec {
        let projected = project_one(current, value_spec, key, ctx)?;
        let Some(projected) = projected else { continue };
        if is_remove_sentinel(&projected) {
            continue;
        }
        if key.contains('.') {
            let mut wrapper = Value::Document(std::mem::take(&mut out));
            path::set_path(&mut wrapper, key, projected);
            let Value::Document(map) = wrapper else {
                unreachable!()
            };
            out = map;
        } else {
            out.insert(key.clone(), projected);
        }
    }
    Ok(Value::Document(out))
}

fn current_field(current: &Value, key: &str) -> Option<Value> {
    // Dotted keys address the leaf name for passthrough lookups.
    let leaf = key.rsplit('.').next().unwrap_or(key);
    match current {
        Value::Document(doc) => doc.get(leaf).cloned(),
        _ => None,
    }
}

fn project_one(
    current: &Value,
    value_spec: &Value,
    key: &str,
    ctx: &mut EvalContext,
) -> Result<Option<Value>> {
    match value_spec {
        Value::Number(n) if *n == 1.0 => Ok(current_field(current, key)),
        Value::Bool(true) => Ok(current_field(current, key)),
        Value::Number(n) if *n == 0.0 => Ok(None),
        Value::Bool(false) => Ok(None),
        Value::String(path_str) => Ok(Some(eval(ctx.root, &Value::String(path_str.clone()), ctx)?)),
        Value::Document(nested_spec) => {
            let field = current_field(current, key);
            match field {
                Some(Value::Document(_)) | Some(Value::Array(_)) => {
                    let field = field.unwrap();
                    project_nested(&field, nested_spec, ctx).map(Some)
                }
                _ => Ok(Some(eval(current, value_spec, ctx)?)),
            }
        }
        other => Ok(Some(eval(current, other, ctx)?)),
    }
}

fn project_nested(field: &Value, nested_spec: &Document, ctx: &mut EvalContext) -> Result<Value> {
    match field {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(project(item, nested_spec, ctx)?);
            }
            Ok(Value::Array(out))
        }
        _ => project(field, nested_spec, ctx),
    }
}
