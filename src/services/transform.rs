use async_trait::async_trait;
use serde_json::Value;
use anyhow::{Result, anyhow};
use std::cmp::Ordering;

use crate::runtime::eval::{self, EvalContext, EvalValue, CompiledExpression};
use crate::runtime::value::{as_number, number, stringify, truthy};
use crate::services::{AggregateFunction, DataOperation, DataTransform};

/// In-process transform engine. Expressions use `evalexpr` syntax with the
/// current element bound as `item` (object fields as `item.field`) and its
/// position as `index`.
#[derive(Debug, Default, Clone)]
pub struct BuiltinTransform;

impl BuiltinTransform {
    pub fn new() -> Self {
        Self
    }

    fn map(&self, expression: &str, items: Vec<Value>) -> Result<Value> {
        let tree = eval::compile(expression)?;
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            out.push(eval::from_eval_value(eval_item(&tree, item, index)?));
        }
        Ok(Value::Array(out))
    }

    fn filter(&self, expression: &str, items: Vec<Value>) -> Result<Value> {
        let tree = eval::compile(expression)?;
        let mut out = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let keep = eval::from_eval_value(eval_item(&tree, &item, index)?);
            if truthy(&keep) {
                out.push(item);
            }
        }
        Ok(Value::Array(out))
    }

    fn aggregate(&self, function: AggregateFunction, field: Option<&str>, items: Vec<Value>) -> Result<Value> {
        let values: Vec<Value> = items
            .into_iter()
            .map(|v| project(v, field))
            .filter(|v| !v.is_null())
            .collect();

        let result = match function {
            AggregateFunction::Count => return Ok(Value::from(values.len())),
            AggregateFunction::Concat => return Ok(Value::String(values.iter().map(stringify).collect())),
            AggregateFunction::Sum => numbers(&values)?.iter().sum::<f64>(),
            AggregateFunction::Avg => {
                let nums = numbers(&values)?;
                if nums.is_empty() {
                    return Ok(Value::Null);
                }
                nums.iter().sum::<f64>() / nums.len() as f64
            }
            AggregateFunction::Min => match numbers(&values)?.into_iter().reduce(f64::min) {
                Some(min) => min,
                None => return Ok(Value::Null),
            },
            AggregateFunction::Max => match numbers(&values)?.into_iter().reduce(f64::max) {
                Some(max) => max,
                None => return Ok(Value::Null),
            },
        };
        Ok(number(result))
    }

    fn sort(&self, field: Option<&str>, descending: bool, mut items: Vec<Value>) -> Result<Value> {
        items.sort_by(|a, b| {
            let ord = compare(&project(a.clone(), field), &project(b.clone(), field));
            if descending { ord.reverse() } else { ord }
        });
        Ok(Value::Array(items))
    }
}

#[async_trait]
impl DataTransform for BuiltinTransform {
    async fn apply(&self, operation: &DataOperation, input: Value) -> Result<Value> {
        let Value::Array(items) = input else {
            return Err(anyhow!("{} expects an array input", operation.name()));
        };
        match operation {
            DataOperation::Map { expression } => self.map(expression, items),
            DataOperation::Filter { expression } => self.filter(expression, items),
            DataOperation::Aggregate { function, field } => self.aggregate(*function, field.as_deref(), items),
            DataOperation::Sort { field, descending } => self.sort(field.as_deref(), *descending, items),
        }
    }
}

fn eval_item(tree: &CompiledExpression, item: &Value, index: usize) -> Result<EvalValue> {
    let mut scope = EvalContext::new();
    eval::bind(&mut scope, "item", item)?;
    eval::bind(&mut scope, "index", &Value::from(index))?;
    tree.eval_with_context(&scope).map_err(|e| anyhow!("expression failed on item {}: {}", index, e))
}

fn numbers(values: &[Value]) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|v| as_number(v).ok_or_else(|| anyhow!("cannot aggregate non-numeric value {}", v)))
        .collect()
}

fn project(value: Value, field: Option<&str>) -> Value {
    match (field, value) {
        (None, v) => v,
        (Some(path), v) => path
            .split('.')
            .try_fold(v, |current, key| match current {
                Value::Object(mut map) => map.remove(key),
                _ => None,
            })
            .unwrap_or(Value::Null),
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => stringify(a).cmp(&stringify(b)),
    }
}
