//! Operator library (spec.md §4.1, "Operator semantics").
//!
//! Every operator is a plain function over `OpArgs` (raw, unforced
//! arguments) and the evaluation context, dispatched by name from
//! [`dispatch`]. Short-circuiting operators (`$and`, `$or`, `$cond`,
//! `$ifNull`, `$switch`) force only the thunks they need; every other
//! operator forces all of its arguments up front since it needs them all
//! anyway.

use super::{EvalContext, OpArgs};
use crate::error::{AggError, Result};
use crate::value::Value;
use std::cmp::Ordering;

pub fn dispatch(op_name: &str, args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    match op_name {
        // Arithmetic
        "$add" => arith_fold(args, ctx, 0.0, |acc, x| acc + x),
        "$multiply" => arith_fold(args, ctx, 1.0, |acc, x| acc * x),
        "$subtract" => arith_binary(args, ctx, |a, b| a - b),
        "$divide" => divide(args, ctx),
        "$mod" => modulo(args, ctx),
        "$abs" => arith_unary(args, ctx, f64::abs),
        "$ceil" => arith_unary(args, ctx, f64::ceil),
        "$floor" => arith_unary(args, ctx, f64::floor),
        "$round" => arith_unary(args, ctx, |x| x.round()),
        "$trunc" => arith_unary(args, ctx, f64::trunc),

        // Comparison / equality
        "$eq" => compare_bool(args, ctx, |o| o == Ordering::Equal),
        "$ne" => compare_bool(args, ctx, |o| o != Ordering::Equal),
        "$gt" => compare_bool(args, ctx, |o| o == Ordering::Greater),
        "$gte" => compare_bool(args, ctx, |o| o != Ordering::Less),
        "$lt" => compare_bool(args, ctx, |o| o == Ordering::Less),
        "$lte" => compare_bool(args, ctx, |o| o != Ordering::Greater),
        "$cmp" => cmp(args, ctx),

        // Logical (short-circuiting)
        "$and" => and(args, ctx),
        "$or" => or(args, ctx),
        "$not" => not(args, ctx),

        // Set
        "$setUnion" => set_union(args, ctx),
        "$setIntersection" => set_intersection(args, ctx),
        "$setDifference" => set_difference(args, ctx),
        "$setEquals" => set_equals(args, ctx),
        "$setIsSubset" => set_is_subset(args, ctx),
        "$in" => in_array(args, ctx),

        // String
        "$concat" => concat(args, ctx),
        "$substr" => substr(args, ctx),
        "$toUpper" => string_unary(args, ctx, str::to_uppercase),
        "$toLower" => string_unary(args, ctx, str::to_lowercase),
        "$trim" => string_unary(args, ctx, |s| s.trim().to_string()),
        "$split" => split(args, ctx),
        "$strLenCP" => str_len(args, ctx),

        // Conditional (short-circuiting)
        "$cond" => cond(args, ctx),
        "$ifNull" => if_null(args, ctx),
        "$switch" => switch(args, ctx),

        // Array reducers
        "$reduce" => reduce(args, ctx),
        "$map" => map(args, ctx),
        "$filter" => filter(args, ctx),
        "$size" => size(args, ctx),
        "$arrayElemAt" => array_elem_at(args, ctx),
        "$first" => first_last(args, ctx, true),
        "$last" => first_last(args, ctx, false),
        "$slice" => slice(args, ctx),

        other => Err(AggError::unknown_operator(other)),
    }
}

// ---------- Arithmetic ----------

fn arith_fold(
    args: &OpArgs,
    ctx: &mut EvalContext,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value> {
    let values = args.force_all(ctx)?;
    let result = values.iter().map(Value::coerce_number).fold(init, f);
    Ok(Value::Number(result))
}

fn arith_binary(args: &OpArgs, ctx: &mut EvalContext, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("expected exactly 2 arguments"));
    }
    Ok(Value::Number(f(values[0].coerce_number(), values[1].coerce_number())))
}

fn arith_unary(args: &OpArgs, ctx: &mut EvalContext, f: impl Fn(f64) -> f64) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("expected 1 argument"))?
        .force(ctx)?;
    Ok(Value::Number(f(v.coerce_number())))
}

fn divide(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$divide expects 2 arguments"));
    }
    let denom = values[1].coerce_number();
    if denom == 0.0 {
        return Ok(Value::Null);
    }
    Ok(Value::Number(values[0].coerce_number() / denom))
}

/// spec.md §4.1: "modulo on non-integer operands uses IEEE remainder."
/// Integer operands keep Rust's truncated `%` (matching `$mod`'s usual
/// integer-modulo behavior); once either operand has a fractional part,
/// truncated division no longer agrees with IEEE 754 `remainder`, so the
/// round-to-nearest-quotient form below is used instead.
fn modulo(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$mod expects 2 arguments"));
    }
    let a = values[0].coerce_number();
    let b = values[1].coerce_number();
    if b == 0.0 {
        return Ok(Value::Null);
    }
    let result = if a.fract() == 0.0 && b.fract() == 0.0 {
        a % b
    } else {
        a - b * (a / b).round()
    };
    Ok(Value::Number(result))
}

// ---------- Comparison ----------

fn compare_bool(args: &OpArgs, ctx: &mut EvalContext, pred: impl Fn(Ordering) -> bool) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("comparison expects 2 arguments"));
    }
    Ok(Value::Bool(pred(values[0].compare(&values[1]))))
}

fn cmp(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$cmp expects 2 arguments"));
    }
    let n = match values[0].compare(&values[1]) {
        Ordering::Less => -1.0,
        Ordering::Equal => 0.0,
        Ordering::Greater => 1.0,
    };
    Ok(Value::Number(n))
}

// ---------- Logical ----------

fn and(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    for thunk in args.thunks() {
        if !thunk.force(ctx)?.is_truthy() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn or(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    for thunk in args.thunks() {
        if thunk.force(ctx)?.is_truthy() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn not(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("$not expects 1 argument"))?
        .force(ctx)?;
    Ok(Value::Bool(!v.is_truthy()))
}

// ---------- Set ----------

fn dedup(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.iter().any(|o| o.structural_eq(&v)) {
            out.push(v);
        }
    }
    out
}

fn as_element_seq(v: &Value) -> Result<Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(AggError::type_mismatch("set operator expects an array argument")),
    }
}

fn set_union(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    let mut all = Vec::new();
    for v in &values {
        all.extend(as_element_seq(v)?);
    }
    Ok(Value::Array(dedup(all)))
}

fn set_intersection(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    let mut sets = Vec::new();
    for v in &values {
        sets.push(dedup(as_element_seq(v)?));
    }
    let Some((first, rest)) = sets.split_first() else {
        return Ok(Value::Array(vec![]));
    };
    let result: Vec<Value> = first
        .iter()
        .filter(|item| rest.iter().all(|s| s.iter().any(|x| x.structural_eq(*item))))
        .cloned()
        .collect();
    Ok(Value::Array(result))
}

fn set_difference(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$setDifference expects 2 arguments"));
    }
    let a = dedup(as_element_seq(&values[0])?);
    let b = as_element_seq(&values[1])?;
    let result: Vec<Value> = a
        .into_iter()
        .filter(|item| !b.iter().any(|x| x.structural_eq(item)))
        .collect();
    Ok(Value::Array(result))
}

fn set_equals(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    let mut sets = Vec::new();
    for v in &values {
        sets.push(dedup(as_element_seq(v)?));
    }
    let Some((first, rest)) = sets.split_first() else {
        return Ok(Value::Bool(true));
    };
    let equal = rest.iter().all(|s| {
        s.len() == first.len() && first.iter().all(|x| s.iter().any(|y| x.structural_eq(y)))
    });
    Ok(Value::Bool(equal))
}

fn set_is_subset(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$setIsSubset expects 2 arguments"));
    }
    let a = as_element_seq(&values[0])?;
    let b = as_element_seq(&values[1])?;
    let subset = a.iter().all(|x| b.iter().any(|y| x.structural_eq(y)));
    Ok(Value::Bool(subset))
}

fn in_array(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$in expects [value, array]"));
    }
    let haystack = as_element_seq(&values[1])?;
    Ok(Value::Bool(haystack.iter().any(|x| x.structural_eq(&values[0]))))
}

// ---------- String ----------

fn concat(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let mut out = String::new();
    for v in &values {
        match v {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(Value::String(out))
}

fn substr(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 3 {
        return Err(AggError::type_mismatch("$substr expects [string, start, length]"));
    }
    let s: Vec<char> = match &values[0] {
        Value::String(s) => s.chars().collect(),
        other => other.to_string().chars().collect(),
    };
    let len = s.len() as i64;
    let start = (values[1].coerce_number() as i64).clamp(0, len);
    let requested = values[2].coerce_number() as i64;
    let end = if requested < 0 {
        len
    } else {
        (start + requested).clamp(start, len)
    };
    let slice: String = s[start as usize..end as usize].iter().collect();
    Ok(Value::String(slice))
}

fn string_unary(args: &OpArgs, ctx: &mut EvalContext, f: impl Fn(&str) -> String) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("expected 1 argument"))?
        .force(ctx)?;
    match v {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(f(&s))),
        other => Ok(Value::String(f(&other.to_string()))),
    }
}

fn split(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$split expects [string, delimiter]"));
    }
    let (Value::String(s), Value::String(delim)) = (&values[0], &values[1]) else {
        return Ok(Value::Null);
    };
    let parts = s.split(delim.as_str()).map(Value::string).collect();
    Ok(Value::Array(parts))
}

fn str_len(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("expected 1 argument"))?
        .force(ctx)?;
    match v {
        Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
        _ => Err(AggError::type_mismatch("$strLenCP expects a string")),
    }
}

// ---------- Conditional ----------

fn cond(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let (if_t, then_t, else_t) = match args.raw() {
        Value::Array(_) => (args.nth(0), args.nth(1), args.nth(2)),
        Value::Document(_) => (args.field("if"), args.field("then"), args.field("else")),
        _ => (None, None, None),
    };
    let if_t = if_t.ok_or_else(|| AggError::invalid_pipeline("$cond requires if/then/else"))?;
    let then_t = then_t.ok_or_else(|| AggError::invalid_pipeline("$cond requires if/then/else"))?;
    if if_t.force(ctx)?.is_truthy() {
        then_t.force(ctx)
    } else {
        match else_t {
            Some(t) => t.force(ctx),
            None => Ok(Value::Null),
        }
    }
}

fn if_null(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    for thunk in args.thunks() {
        let v = thunk.force(ctx)?;
        if !v.is_null() {
            return Ok(v);
        }
    }
    Ok(Value::Null)
}

fn switch(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let Value::Document(doc) = args.raw() else {
        return Err(AggError::invalid_pipeline("$switch requires {branches, default}"));
    };
    let Some(Value::Array(branches)) = doc.get("branches") else {
        return Err(AggError::invalid_pipeline("$switch requires a branches array"));
    };
    for branch in branches {
        let Value::Document(b) = branch else {
            return Err(AggError::invalid_pipeline("$switch branch must be {case, then}"));
        };
        let case_expr = b
            .get("case")
            .ok_or_else(|| AggError::invalid_pipeline("$switch branch missing case"))?;
        let then_expr = b
            .get("then")
            .ok_or_else(|| AggError::invalid_pipeline("$switch branch missing then"))?;
        let case_thunk = super::Thunk::new(args.current(), case_expr);
        if case_thunk.force(ctx)?.is_truthy() {
            return super::Thunk::new(args.current(), then_expr).force(ctx);
        }
    }
    match doc.get("default") {
        Some(default_expr) => super::Thunk::new(args.current(), default_expr).force(ctx),
        None => Ok(Value::Null),
    }
}

// ---------- Array reducers ----------

fn reduce(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let Value::Document(doc) = args.raw() else {
        return Err(AggError::invalid_pipeline("$reduce requires {input, initialValue, in}"));
    };
    let input_expr = doc
        .get("input")
        .ok_or_else(|| AggError::invalid_pipeline("$reduce missing input"))?;
    let initial_expr = doc
        .get("initialValue")
        .ok_or_else(|| AggError::invalid_pipeline("$reduce missing initialValue"))?;
    let in_expr = doc
        .get("in")
        .ok_or_else(|| AggError::invalid_pipeline("$reduce missing in"))?;

    let input = super::Thunk::new(args.current(), input_expr).force(ctx)?;
    let Value::Array(items) = input else {
        return Ok(Value::Null);
    };
    let mut acc = super::Thunk::new(args.current(), initial_expr).force(ctx)?;
    for item in items {
        acc = ctx.with_binding("value", acc, |ctx| {
            ctx.with_binding("this", item, |ctx| eval_in_current(args.current(), in_expr, ctx))
        })?;
    }
    Ok(acc)
}

fn map(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let Value::Document(doc) = args.raw() else {
        return Err(AggError::invalid_pipeline("$map requires {input, in}"));
    };
    let input_expr = doc
        .get("input")
        .ok_or_else(|| AggError::invalid_pipeline("$map missing input"))?;
    let in_expr = doc
        .get("in")
        .ok_or_else(|| AggError::invalid_pipeline("$map missing in"))?;
    let as_name = match doc.get("as") {
        Some(Value::String(s)) => s.clone(),
        _ => "this".to_string(),
    };

    let input = super::Thunk::new(args.current(), input_expr).force(ctx)?;
    let Value::Array(items) = input else {
        return Ok(Value::Null);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let mapped = ctx.with_binding(&as_name, item, |ctx| {
            eval_in_current(args.current(), in_expr, ctx)
        })?;
        out.push(mapped);
    }
    Ok(Value::Array(out))
}

fn filter(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let Value::Document(doc) = args.raw() else {
        return Err(AggError::invalid_pipeline("$filter requires {input, cond}"));
    };
    let input_expr = doc
        .get("input")
        .ok_or_else(|| AggError::invalid_pipeline("$filter missing input"))?;
    let cond_expr = doc
        .get("cond")
        .ok_or_else(|| AggError::invalid_pipeline("$filter missing cond"))?;
    let as_name = match doc.get("as") {
        Some(Value::String(s)) => s.clone(),
        _ => "this".to_string(),
    };

    let input = super::Thunk::new(args.current(), input_expr).force(ctx)?;
    let Value::Array(items) = input else {
        return Ok(Value::Null);
    };
    let mut out = Vec::new();
    for item in items {
        let keep = ctx.with_binding(&as_name, item.clone(), |ctx| {
            eval_in_current(args.current(), cond_expr, ctx)
        })?;
        if keep.is_truthy() {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn eval_in_current(current: &Value, expr: &Value, ctx: &mut EvalContext) -> Result<Value> {
    super::eval(current, expr, ctx)
}

fn size(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("$size expects 1 argument"))?
        .force(ctx)?;
    match v {
        Value::Array(items) => Ok(Value::Number(items.len() as f64)),
        _ => Err(AggError::type_mismatch("$size expects an array")),
    }
}

fn array_elem_at(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    if values.len() != 2 {
        return Err(AggError::type_mismatch("$arrayElemAt expects [array, index]"));
    }
    let Value::Array(items) = &values[0] else {
        return Err(AggError::type_mismatch("$arrayElemAt expects an array"));
    };
    let idx = values[1].coerce_number() as i64;
    let resolved = if idx < 0 { items.len() as i64 + idx } else { idx };
    if resolved < 0 || resolved as usize >= items.len() {
        return Ok(Value::Null);
    }
    Ok(items[resolved as usize].clone())
}

fn first_last(args: &OpArgs, ctx: &mut EvalContext, first: bool) -> Result<Value> {
    let v = args
        .nth(0)
        .ok_or_else(|| AggError::type_mismatch("expected 1 argument"))?
        .force(ctx)?;
    let Value::Array(items) = v else {
        return Err(AggError::type_mismatch("expects an array"));
    };
    let picked = if first { items.first() } else { items.last() };
    Ok(picked.cloned().unwrap_or(Value::Null))
}

fn slice(args: &OpArgs, ctx: &mut EvalContext) -> Result<Value> {
    let values = args.force_all(ctx)?;
    let Value::Array(items) = &values[0] else {
        return Err(AggError::type_mismatch("$slice expects an array"));
    };
    let len = items.len() as i64;
    let (start, count) = match values.len() {
        2 => (0i64, values[1].coerce_number() as i64),
        3 => (values[1].coerce_number() as i64, values[2].coerce_number() as i64),
        _ => return Err(AggError::type_mismatch("$slice expects 2 or 3 arguments")),
    };
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let end = (start + count.max(0)).min(len);
    Ok(Value::Array(items[start as usize..end as usize].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::eval;

    fn eval_expr(expr: &Value) -> Value {
        let mut ctx = EvalContext::new(&Value::Null);
        eval(&Value::Null, expr, &mut ctx).unwrap()
    }

    #[test]
    fn add_and_multiply() {
        let expr = Value::doc([("$add".into(), Value::array([Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]))]);
        assert_eq!(eval_expr(&expr), Value::Number(6.0));
    }

    #[test]
    fn divide_by_zero_yields_null() {
        let expr = Value::doc([("$divide".into(), Value::array([Value::Number(1.0), Value::Number(0.0)]))]);
        assert!(eval_expr(&expr).is_null());
    }

    #[test]
    fn and_short_circuits() {
        let expr = Value::doc([(
            "$and".into(),
            Value::array([
                Value::Bool(false),
                Value::doc([("$nonexistentOperator".into(), Value::Null)]),
            ]),
        )]);
        // Should short-circuit on the first false and never evaluate the
        // unknown-operator branch.
        assert_eq!(eval_expr(&expr), Value::Bool(false));
    }

    #[test]
    fn cond_array_form() {
        let expr = Value::doc([(
            "$cond".into(),
            Value::array([Value::Bool(true), Value::Number(1.0), Value::Number(2.0)]),
        )]);
        assert_eq!(eval_expr(&expr), Value::Number(1.0));
    }

    #[test]
    fn reduce_sums_items() {
        let doc = Value::doc([("items".into(), Value::array([1.0, 2.0, 3.0, 4.0].map(Value::Number)))]);
        let expr = Value::doc([(
            "$reduce".into(),
            Value::doc([
                ("input".into(), Value::string("$items")),
                ("initialValue".into(), Value::Number(0.0)),
                (
                    "in".into(),
                    Value::doc([(
                        "$add".into(),
                        Value::array([Value::string("$$value"), Value::string("$$this")]),
                    )]),
                ),
            ]),
        )]);
        let mut ctx = EvalContext::new(&doc);
        let result = eval(&doc, &expr, &mut ctx).unwrap();
        assert_eq!(result, Value::Number(10.0));
    }

    #[test]
    fn reduce_on_non_array_returns_null() {
        let doc = Value::doc([("items".into(), Value::Number(5.0))]);
        let expr = Value::doc([(
            "$reduce".into(),
            Value::doc([
                ("input".into(), Value::string("$items")),
                ("initialValue".into(), Value::Number(0.0)),
                ("in".into(), Value::string("$$value")),
            ]),
        )]);
        let mut ctx = EvalContext::new(&doc);
        assert!(eval(&doc, &expr, &mut ctx).unwrap().is_null());
    }

    #[test]
    fn set_operators_dedup_and_compare_structurally() {
        let expr = Value::doc([(
            "$setEquals".into(),
            Value::array([
                Value::array([Value::Number(1.0), Value::Number(2.0), Value::Number(1.0)]),
                Value::array([Value::Number(2.0), Value::Number(1.0)]),
            ]),
        )]);
        assert_eq!(eval_expr(&expr), Value::Bool(true));
    }

    #[test]
    fn switch_evaluates_branches_in_order() {
        let expr = Value::doc([(
            "$switch".into(),
            Value::doc([
                (
                    "branches".into(),
                    Value::array([Value::doc([
                        ("case".into(), Value::Bool(false)),
                        ("then".into(), Value::Number(1.0)),
                    ])]),
                ),
                ("default".into(), Value::Number(99.0)),
            ]),
        )]);
        assert_eq!(eval_expr(&expr), Value::Number(99.0));
    }
}
