use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};
use tracing::debug;

use crate::dsl::{labels, Node, NodeKind, NodeType, FieldType};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::{ExpressionError, NodeError};
use crate::runtime::eval::{self, EvalValue};
use crate::runtime::node::{Inputs, NodeExecutor, NodeOutcome};
use crate::runtime::syscall::Syscall;
use crate::runtime::value::truthy;

// --- CONDITION NODE ---

/// Chooses the `true` or `false` edge group by the truthiness of either the
/// `condition` input or the node's comparison expression.
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let value = match (&node.kind, inputs.get("condition")) {
            (_, Some(value)) => value.clone(),
            (NodeType::Condition { expression: Some(expr) }, None) => {
                let result = eval::evaluate(expr, ctx)?;
                if matches!(result, EvalValue::Empty) {
                    return Err(ExpressionError::InvalidConditionType { found: FieldType::Empty.to_string() }.into());
                }
                eval::from_eval_value(result)
            }
            _ => {
                return Err(NodeError::Configuration(format!(
                    "condition '{}' has neither a condition input nor an expression",
                    node.key
                )));
            }
        };

        let result = truthy(&value);
        let label = if result { labels::TRUE } else { labels::FALSE };
        debug!(node = %node.key, result, "Condition evaluated");
        Ok(NodeOutcome::next(json!({ "result": result }), syscall.successors(&node.key, Some(label))))
    }
}

// --- FOR-EACH NODE ---

/// Runs the `item` subgraph once per element of the `items` input, each
/// iteration in its own child scope. Output is the array of iteration results
/// in source order.
pub struct ForEachExecutor {
    default_concurrency: usize,
}

impl ForEachExecutor {
    pub fn new(default_concurrency: usize) -> Self {
        Self { default_concurrency: default_concurrency.max(1) }
    }
}

impl Default for ForEachExecutor {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl NodeExecutor for ForEachExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::ForEach
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let items = match inputs.get("items") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(ExpressionError::mismatch("items", FieldType::Array, FieldType::of(other)).into());
            }
            None => return Err(NodeError::Configuration(format!("for-each '{}' has no items input", node.key))),
        };
        let concurrency = match &node.kind {
            NodeType::ForEach { concurrency: Some(n) } => (*n).max(1),
            _ => self.default_concurrency,
        };
        let body = syscall.successors(&node.key, Some(labels::ITEM));
        debug!(node = %node.key, items = items.len(), concurrency, "Starting loop");

        // Iterations not yet started when one fails are skipped; those in flight finish.
        let aborted = AtomicBool::new(false);
        let results: Vec<Option<Result<Option<Value>, NodeError>>> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let aborted = &aborted;
                let body = &body;
                async move {
                    if aborted.load(Ordering::SeqCst) {
                        return None;
                    }
                    let scope = ctx.fork_iteration(format!("{}[{}]", node.key, index), item, index);
                    let result = syscall.run_subgraph(body.clone(), &scope).await;
                    if result.is_err() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut outputs = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(output)) => outputs.push(output.unwrap_or(Value::Null)),
                Some(Err(source)) => return Err(NodeError::Iteration { index, source: Box::new(source) }),
                None => {}
            }
        }
        Ok(NodeOutcome::next(Value::Array(outputs), syscall.successors(&node.key, None)))
    }
}

// --- FORK NODE ---

/// Runs every branch concurrently in its own child scope and joins on all of
/// them. Output is `{branch: {node: output}}`.
pub struct ForkExecutor;

#[async_trait]
impl NodeExecutor for ForkExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Fork
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: &Inputs,
        ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let branches: Vec<(String, ExecutionContext)> = syscall
            .branch_labels(&node.key)
            .into_iter()
            .map(|label| {
                let scope = ctx.fork(format!("{}.{}", node.key, label));
                (label, scope)
            })
            .collect();
        debug!(node = %node.key, branches = branches.len(), "Forking");

        // Siblings are never cancelled early; the join waits for every branch.
        let results = join_all(branches.iter().map(|(label, scope)| {
            let entries = syscall.successors(&node.key, Some(label.as_str()));
            syscall.run_subgraph(entries, scope)
        }))
        .await;

        for ((label, _), result) in branches.iter().zip(results) {
            if let Err(source) = result {
                return Err(NodeError::Branch { label: label.clone(), source: Box::new(source) });
            }
        }

        let merged = ExecutionContext::merge(&branches);
        Ok(NodeOutcome::next(merged, syscall.successors(&node.key, None)))
    }
}
