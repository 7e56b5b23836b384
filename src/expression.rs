//! Expression/condition evaluator contract.
//!
//! The expression language itself is external; this subsystem only needs two
//! capabilities from it: resolving a collection-valued expression and
//! evaluating a boolean completion condition against a scope. Failures
//! propagate as evaluation errors and are not retried here.

use serde_json::Value;

use crate::tree::VariableScope;

#[derive(Debug, thiserror::Error)]
#[error("expression evaluation failed: {message}")]
pub struct EvaluationError {
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate a boolean condition against the given scope.
    fn evaluate_bool(
        &self,
        expression: &str,
        scope: &VariableScope,
    ) -> Result<bool, EvaluationError>;

    /// Resolve an expression to a value, or `None` when it refers to nothing.
    fn resolve(
        &self,
        expression: &str,
        scope: &VariableScope,
    ) -> Result<Option<Value>, EvaluationError>;
}

/// Minimal evaluator that treats every expression as a scope variable name.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScopeLookupEvaluator;

impl ExpressionEvaluator for ScopeLookupEvaluator {
    fn evaluate_bool(
        &self,
        expression: &str,
        scope: &VariableScope,
    ) -> Result<bool, EvaluationError> {
        Ok(scope.get(expression).map(is_truthy).unwrap_or(false))
    }

    fn resolve(
        &self,
        expression: &str,
        scope: &VariableScope,
    ) -> Result<Option<Value>, EvaluationError> {
        Ok(scope.get(expression).cloned())
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scope_lookup_resolves_variables() {
        let evaluator = ScopeLookupEvaluator;
        let mut scope = VariableScope::new();
        scope.insert("assignees".to_string(), json!(["ann", "bo"]));

        let resolved = evaluator.resolve("assignees", &scope).unwrap();
        assert_eq!(resolved, Some(json!(["ann", "bo"])));
        assert_eq!(evaluator.resolve("missing", &scope).unwrap(), None);
    }

    #[test]
    fn truthiness_matches_scope_values() {
        let evaluator = ScopeLookupEvaluator;
        let mut scope = VariableScope::new();
        scope.insert("done".to_string(), json!(true));
        scope.insert("empty".to_string(), json!([]));

        assert!(evaluator.evaluate_bool("done", &scope).unwrap());
        assert!(!evaluator.evaluate_bool("empty", &scope).unwrap());
        assert!(!evaluator.evaluate_bool("missing", &scope).unwrap());
    }
}
