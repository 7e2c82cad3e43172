//! Expression evaluation for `value_from` bindings (§4.3).
//!
//! The real evaluator is treated as an external collaborator: any pure
//! function from `(expression, self, inputs)` to a JSON value satisfies the
//! contract. [`RhaiEvaluator`] is one concrete implementation, not a claim of
//! exact parity with any particular expression language.

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;

use crate::error::ResolverError;

/// A pure function evaluator for step `value_from` expressions.
///
/// `$(...)` substitutions are string-interpolated; a standalone `${...}`
/// body is evaluated and its return value used directly, mirroring the two
/// forms step bindings use (§4.3).
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, self_value: &Value, inputs: &Value) -> Result<Value, ResolverError>;
}

/// Reference implementation backed by `rhai`.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        Self { engine }
    }
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_for<'a>(&self, self_value: &Value, inputs: &Value) -> Scope<'a> {
        let mut scope = Scope::new();
        scope.push_constant("self", json_to_dynamic(self_value));
        scope.push_constant("inputs", json_to_dynamic(inputs));
        scope
    }

    fn eval_one(&self, body: &str, self_value: &Value, inputs: &Value) -> Result<Value, ResolverError> {
        let mut scope = self.scope_for(self_value, inputs);
        let result: Dynamic = self
            .engine
            .eval_with_scope(&mut scope, body)
            .map_err(|e| ResolverError::Expression(e.to_string()))?;
        dynamic_to_json(result)
    }
}

impl ExpressionEvaluator for RhaiEvaluator {
    fn evaluate(&self, expression: &str, self_value: &Value, inputs: &Value) -> Result<Value, ResolverError> {
        let trimmed = expression.trim();
        if let Some(body) = trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return self.eval_one(body, self_value, inputs);
        }
        if trimmed.starts_with("$(") && trimmed.ends_with(')') && count_dollar_paren(trimmed) == 1 {
            let body = &trimmed[2..trimmed.len() - 1];
            return self.eval_one(body, self_value, inputs);
        }
        // General case: string with embedded $(...) substitutions.
        let mut out = String::new();
        let mut rest = trimmed;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = matching_paren(after).ok_or_else(|| {
                ResolverError::Expression(format!("unbalanced $(...) in expression: {trimmed}"))
            })?;
            let body = &after[..end];
            let value = self.eval_one(body, self_value, inputs)?;
            out.push_str(&value_to_interpolated_string(&value));
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

fn count_dollar_paren(s: &str) -> usize {
    s.matches("$(").count()
}

fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 1i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn value_to_interpolated_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn dynamic_to_json(value: Dynamic) -> Result<Value, ResolverError> {
    rhai::serde::from_dynamic(&value).map_err(|e| ResolverError::Expression(e.to_string()))
}
