//! Evaluation context: root document, reducer-local variables, and the
//! once-per-top-level-evaluation `$$NOW` instant (spec.md §4.1, design
//! note in §9).

use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Carries the root document and the variable bindings (`$$value`,
/// `$$this`, `$$ROOT`, `$$CURRENT`, `$$NOW`) visible to a single top-level
/// `eval` call and everything it recurses into.
pub struct EvalContext<'a> {
    pub root: &'a Value,
    now: DateTime<Utc>,
    vars: HashMap<String, Value>,
}

impl<'a> EvalContext<'a> {
    /// Start a fresh top-level evaluation. `$$NOW` is captured here and
    /// reused for the lifetime of this context, never re-sampled.
    pub fn new(root: &'a Value) -> Self {
        EvalContext {
            root,
            now: Utc::now(),
            vars: HashMap::new(),
        }
    }

    /// Start a context with an externally supplied `$$NOW`, so that a
    /// single batch evaluation (e.g. one `snapshot()` call materializing
    /// many documents) shares one instant across every document.
    pub fn with_now(root: &'a Value, now: DateTime<Utc>) -> Self {
        EvalContext {
            root,
            now,
            vars: HashMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Run `f` with `name` bound to `value`, restoring (or removing) the
    /// previous binding afterward. Used by `$reduce`/`$map`/`$filter` to
    /// expose `$$value`/`$$this` only within the scope of their `in`/`cond`
    /// sub-expression.
    pub fn with_binding<R>(
        &mut self,
        name: &str,
        value: Value,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let previous = self.vars.insert(name.to_string(), value);
        let result = f(self);
        match previous {
            Some(prev) => {
                self.vars.insert(name.to_string(), prev);
            }
            None => {
                self.vars.remove(name);
            }
        }
        result
    }
}
