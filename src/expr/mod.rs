//! # Expression Engine
//!
//! `eval(current, expr, ctx) -> Value` evaluates the expression grammar
//! spec.md §4.1 defines: literals, field paths (`"$a.b.c"`), system
//! variables (`"$$ROOT"`, `"$$CURRENT"`, `"$$NOW"`, `"$$REMOVE"`,
//! `"$$value"`/`"$$this"`), operator objects (`{"$add": [...]}`), and
//! object-shape projections (arbitrary multi-key documents).
//!
//! Expressions are not compiled into a separate AST — like MongoDB's own
//! aggregation expressions, the expression *is* a `Value` tree, evaluated
//! by structural recursion. `pub mod operators` resolves the cyclic
//! dependency between "the evaluator needs the operator table" and "every
//! operator needs to recursively call the evaluator" by taking the
//! evaluator as a plain function pointer (`eval`) rather than an injected
//! trait object — both live in the same crate so there's no real cycle to
//! break, but the operator functions are written against a narrow `Thunk`
//! capability rather than reaching back into this module's internals.

pub mod context;
pub mod object_shape;
pub mod operators;

use crate::error::{AggError, Result};
use crate::value::Value;
pub use context::EvalContext;

/// The sentinel `$$REMOVE` evaluates to. An object-shape projection that
/// assigns this to a key omits the key entirely (spec.md §4.1).
const REMOVE_MARKER: &str = "\u{0}AGGVIEW_REMOVE\u{0}";

pub fn remove_sentinel() -> Value {
    Value::String(REMOVE_MARKER.to_string())
}

pub fn is_remove_sentinel(v: &Value) -> bool {
    matches!(v, Value::String(s) if s == REMOVE_MARKER)
}

/// A lazily-forceable argument: the raw unevaluated sub-expression plus
/// the `current` document it should be evaluated against. Operators hold
/// these instead of eagerly evaluated values so that `$and`/`$or`/`$cond`/
/// `$ifNull`/`$switch` can short-circuit without evaluating (or
/// erroring on) branches they never take.
pub struct Thunk<'e> {
    current: &'e Value,
    expr: &'e Value,
}

impl<'e> Thunk<'e> {
    pub fn new(current: &'e Value, expr: &'e Value) -> Self {
        Thunk { current, expr }
    }

    pub fn force(&self, ctx: &mut EvalContext) -> Result<Value> {
        eval(self.current, self.expr, ctx)
    }

    pub fn raw(&self) -> &'e Value {
        self.expr
    }
}

/// The raw (unevaluated) argument to an operator, with helpers for
/// accessing it positionally (`$add: [a, b]`) or by field
/// (`$cond: {if, then, else}`) while deferring evaluation to the operator
/// body.
pub struct OpArgs<'e> {
    current: &'e Value,
    raw: &'e Value,
}

impl<'e> OpArgs<'e> {
    fn new(current: &'e Value, raw: &'e Value) -> Self {
        OpArgs { current, raw }
    }

    /// The raw argument as a list of thunks: an array argument is used
    /// positionally; any other shape is treated as a single-element list
    /// (MongoDB's convention for variadic operators given one argument).
    pub fn thunks(&self) -> Vec<Thunk<'e>> {
        match self.raw {
            Value::Array(items) => items.iter().map(|e| Thunk::new(self.current, e)).collect(),
            other => vec![Thunk::new(self.current, other)],
        }
    }

    pub fn nth(&self, i: usize) -> Option<Thunk<'e>> {
        match self.raw {
            Value::Array(items) => items.get(i).map(|e| Thunk::new(self.current, e)),
            other if i == 0 => Some(Thunk::new(self.current, other)),
            _ => None,
        }
    }

    /// Look up a named field of an object-shaped argument, e.g. `if` in
    /// `$cond: {if, then, else}`.
    pub fn field(&self, name: &str) -> Option<Thunk<'e>> {
        match self.raw {
            Value::Document(doc) => doc.get(name).map(|e| Thunk::new(self.current, e)),
            _ => None,
        }
    }

    pub fn raw(&self) -> &'e Value {
        self.raw
    }

    pub fn current(&self) -> &'e Value {
        self.current
    }

    /// Eagerly force every positional thunk. Convenient for operators
    /// with no short-circuit behavior (most arithmetic/string/set ops).
    pub fn force_all(&self, ctx: &mut EvalContext) -> Result<Vec<Value>> {
        self.thunks().iter().map(|t| t.force(ctx)).collect()
    }
}

/// Evaluate `expr` against `current`, with `ctx.root` available for
/// `$$ROOT` and object-shape string sub-expressions.
pub fn eval(current: &Value, expr: &Value, ctx: &mut EvalContext) -> Result<Value> {
    match expr {
        Value::String(s) => eval_string_expr(current, s, ctx),
        Value::Document(doc) => {
            if doc.len() == 1 {
                let (key, _) = doc.iter().next().unwrap();
                if key.starts_with('$') && !key.starts_with("$$") {
                    return eval_operator(current, doc, ctx);
                }
            }
            object_shape::project(current, doc, ctx)
        }
        // Every other value (including arrays that are not operator
        // arguments) is a literal per spec.md §4.1.
        other => Ok(other.clone()),
    }
}

fn eval_string_expr(current: &Value, s: &str, ctx: &mut EvalContext) -> Result<Value> {
    if let Some(rest) = s.strip_prefix("$$") {
        return eval_system_variable(current, rest, ctx);
    }
    if let Some(path) = s.strip_prefix('$') {
        return Ok(current.get_path(path));
    }
    // A plain string not starting with `$` is a literal.
    Ok(Value::String(s.to_string()))
}

fn eval_system_variable(current: &Value, rest: &str, ctx: &mut EvalContext) -> Result<Value> {
    let (name, sub_path) = match rest.split_once('.') {
        Some((n, p)) => (n, Some(p)),
        None => (rest, None),
    };
    let base = match name {
        "ROOT" => ctx.root.clone(),
        "CURRENT" => current.clone(),
        "NOW" => Value::Timestamp(ctx.now()),
        "REMOVE" => remove_sentinel(),
        "value" => ctx
            .get_var("value")
            .cloned()
            .ok_or_else(|| AggError::unknown_variable("$$value"))?,
        "this" => ctx
            .get_var("this")
            .cloned()
            .ok_or_else(|| AggError::unknown_variable("$$this"))?,
        other => {
            if let Some(v) = ctx.get_var(other) {
                v.clone()
            } else {
                return Err(AggError::unknown_variable(format!("$${other}")));
            }
        }
    };
    Ok(match sub_path {
        Some(p) => base.get_path(p),
        None => base,
    })
}

fn eval_operator(
    current: &Value,
    doc: &crate::value::Document,
    ctx: &mut EvalContext,
) -> Result<Value> {
    let (op_name, arg_expr) = doc.iter().next().expect("checked len == 1 by caller");
    let args = OpArgs::new(current, arg_expr);
    operators::dispatch(op_name, &args, ctx)
}
