//! Bridge between JSON values and `evalexpr`, used by condition expressions
//! and the builtin data transform.

use std::collections::BTreeSet;
use evalexpr::{build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node as EvalNode};
use serde_json::Value;

use crate::dsl::FieldType;
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::ExpressionError;
use crate::runtime::expression;
use crate::runtime::value::number;

pub type EvalValue = evalexpr::Value<DefaultNumericTypes>;
pub type EvalContext = HashMapContext<DefaultNumericTypes>;
pub type CompiledExpression = EvalNode<DefaultNumericTypes>;

pub fn compile(expression: &str) -> Result<CompiledExpression, ExpressionError> {
    build_operator_tree::<DefaultNumericTypes>(expression)
        .map_err(|e| ExpressionError::invalid(expression, e))
}

/// Variable identifiers read by an expression, deduplicated and sorted.
pub fn identifiers(tree: &CompiledExpression) -> Vec<String> {
    tree.iter_variable_identifiers()
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Root namespaces an expression reads (`input` for `input.age`).
pub fn references(expression: &str) -> Result<Vec<String>, ExpressionError> {
    let tree = compile(expression)?;
    let mut roots: Vec<String> = identifiers(&tree)
        .iter()
        .filter_map(|ident| ident.split('.').next().map(str::to_string))
        .collect();
    roots.dedup();
    Ok(roots)
}

/// Evaluate an expression whose identifiers are dotted context paths.
pub fn evaluate(expression: &str, ctx: &ExecutionContext) -> Result<EvalValue, ExpressionError> {
    let tree = compile(expression)?;
    let mut scope = EvalContext::new();
    for ident in identifiers(&tree) {
        let value = expression::resolve_path(&ident, ctx)?;
        let converted = to_eval_value(&value)
            .ok_or_else(|| ExpressionError::mismatch(&ident, "scalar or array", FieldType::of(&value)))?;
        scope
            .set_value(ident, converted)
            .map_err(|e| ExpressionError::invalid(expression, e))?;
    }
    tree.eval_with_context(&scope)
        .map_err(|e| ExpressionError::invalid(expression, e))
}

/// Bind a JSON value under `name`. Objects are flattened to `name.field` identifiers.
pub fn bind(scope: &mut EvalContext, name: &str, value: &Value) -> Result<(), ExpressionError> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                bind(scope, &format!("{}.{}", name, k), v)?;
            }
        }
        other => {
            if let Some(ev) = to_eval_value(other) {
                scope
                    .set_value(name.to_string(), ev)
                    .map_err(|e| ExpressionError::invalid(name, e))?;
            }
        }
    }
    Ok(())
}

pub fn to_eval_value(value: &Value) -> Option<EvalValue> {
    match value {
        Value::Null => Some(EvalValue::Empty),
        Value::Bool(b) => Some(EvalValue::Boolean(*b)),
        Value::String(s) => Some(EvalValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() { Some(EvalValue::Int(i)) }
            else { n.as_f64().map(EvalValue::Float) }
        }
        Value::Array(items) => items
            .iter()
            .map(to_eval_value)
            .collect::<Option<Vec<_>>>()
            .map(EvalValue::Tuple),
        Value::Object(_) => None,
    }
}

pub fn from_eval_value(value: EvalValue) -> Value {
    match value {
        EvalValue::String(s) => Value::String(s),
        EvalValue::Int(i) => Value::from(i),
        EvalValue::Float(f) => number(f),
        EvalValue::Boolean(b) => Value::Bool(b),
        EvalValue::Tuple(items) => Value::Array(items.into_iter().map(from_eval_value).collect()),
        EvalValue::Empty => Value::Null,
    }
}
