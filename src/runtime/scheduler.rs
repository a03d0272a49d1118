use std::collections::{HashSet, VecDeque};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::dsl::{labels, FieldType, Node};
use crate::runtime::blueprint::Blueprint;
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::{ExpressionError, NodeError};
use crate::runtime::expression;
use crate::runtime::node::{Inputs, NodeExecutor, NodeOutcome, NodeRegistry};
use crate::runtime::recorder::Recorder;
use crate::runtime::syscall::Syscall;

/// How a scope stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeExit {
    /// Queue ran dry; carries the output of the last node completed in the scope.
    Drained(Option<Value>),
    /// An End node ran; carries the run's final output.
    Finished(Value),
}

/// An unhandled node error, with the node it escaped from.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node_key: String,
    pub error: NodeError,
}

/// 调度器
///
/// Walks one run's graph. Each scope (root, loop iteration, fork branch) is a
/// FIFO work queue; a node is dispatched at most once per scope.
pub struct Scheduler<'a> {
    blueprint: &'a Blueprint,
    registry: &'a NodeRegistry,
    recorder: &'a Recorder,
    config: &'a EngineConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        blueprint: &'a Blueprint,
        registry: &'a NodeRegistry,
        recorder: &'a Recorder,
        config: &'a EngineConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self { blueprint, registry, recorder, config, cancel }
    }

    pub async fn run(&self, ctx: &ExecutionContext) -> Result<ScopeExit, NodeFailure> {
        self.run_scope(vec![self.blueprint.start.clone()], ctx).await
    }

    async fn run_scope(&self, entries: Vec<String>, ctx: &ExecutionContext) -> Result<ScopeExit, NodeFailure> {
        let mut queue: VecDeque<String> = entries.into();
        let mut dispatched = HashSet::new();
        let mut last = None;

        while let Some(key) = queue.pop_front() {
            if dispatched.contains(&key) {
                continue;
            }
            if self.waiting_on_pending(&key, &queue, &dispatched, ctx) {
                debug!(node = %key, "Deferring node until its inputs are produced");
                queue.push_back(key);
                continue;
            }
            dispatched.insert(key.clone());
            if self.cancel.is_cancelled() {
                return Err(NodeFailure { node_key: key, error: NodeError::Cancelled });
            }

            match self.step(&key, ctx).await {
                Ok(outcome) if outcome.finish => return Ok(ScopeExit::Finished(outcome.output)),
                Ok(outcome) => {
                    queue.extend(outcome.next);
                    last = Some(outcome.output);
                }
                Err(failure) => {
                    let handlers = self.blueprint.successors(&key, Some(labels::ERROR));
                    if handlers.is_empty() || failure.error.is_fatal() {
                        return Err(failure);
                    }
                    debug!(node = %key, handlers = ?handlers, "Routing failure to error handlers");
                    let handled = json!({ "error": failure.error.info() });
                    ctx.set_node_output(&key, handled.clone());
                    queue.extend(handlers);
                    last = Some(handled);
                }
            }
        }
        Ok(ScopeExit::Drained(last))
    }

    /// True while some node `key` reads has no output yet but can still be
    /// reached from the work queue. The graph is acyclic, so something in the
    /// queue is always ready and deferral cannot stall the scope.
    fn waiting_on_pending(
        &self,
        key: &str,
        queue: &VecDeque<String>,
        dispatched: &HashSet<String>,
        ctx: &ExecutionContext,
    ) -> bool {
        let missing: HashSet<&str> = self.blueprint
            .dependencies(key)
            .iter()
            .map(String::as_str)
            .filter(|dep| !ctx.has_output(dep))
            .collect();
        if missing.is_empty() {
            return false;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut frontier: Vec<&str> = queue
            .iter()
            .map(String::as_str)
            .filter(|k| *k != key && !dispatched.contains(*k))
            .collect();
        while let Some(node) = frontier.pop() {
            if !seen.insert(node) {
                continue;
            }
            if missing.contains(node) {
                return true;
            }
            frontier.extend(self.blueprint.targets(node).filter(|t| !dispatched.contains(*t)));
        }
        false
    }

    /// Dispatch one node: record, resolve, invoke, publish.
    async fn step(&self, key: &str, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeFailure> {
        let fail = |error: NodeError| NodeFailure { node_key: key.to_string(), error };

        let node = self.blueprint.node(key)
            .ok_or_else(|| fail(NodeError::Configuration(format!("unknown node '{}'", key))))?;
        let executor = self.registry.get(node.kind())
            .ok_or_else(|| fail(NodeError::Configuration(format!("no executor for {}", node.kind()))))?;

        let mut record = self.recorder.open(node, ctx.scope_label());
        self.recorder.append(&record).await.map_err(fail)?;

        ctx.tick();
        let (snapshot, resolved) = resolve_inputs(node, ctx);
        record.start(Value::Object(snapshot));
        self.recorder.append(&record).await.map_err(fail)?;
        debug!(node = %key, kind = %node.kind(), scope = ctx.scope_label(), sequence = record.sequence, "Dispatching node");

        let result = match resolved {
            Ok(inputs) => self.invoke(executor.as_ref(), node, &inputs, ctx).await,
            Err(e) => Err(NodeError::from(e)),
        };

        match result {
            Ok(outcome) => {
                ctx.set_node_output(key, outcome.output.clone());
                record.complete(outcome.output.clone());
                self.recorder.append(&record).await.map_err(fail)?;
                Ok(outcome)
            }
            Err(error) => {
                warn!(node = %key, kind = %node.kind(), error = %error, "Node failed");
                record.fail(&error);
                self.recorder.append(&record).await.map_err(fail)?;
                Err(fail(error))
            }
        }
    }

    async fn invoke(
        &self,
        executor: &dyn NodeExecutor,
        node: &Node,
        inputs: &Inputs,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError> {
        let call = executor.execute(node, inputs, ctx, self);
        let Some(limit) = self.config.timeout_for(node) else {
            // Control flow is unbounded; its children observe cancellation themselves.
            return call.await;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(limit, call) => match res {
                Ok(result) => result,
                Err(_) => Err(NodeError::external(
                    node.kind().as_str(),
                    format!("timed out after {}ms", limit.as_millis()),
                )),
            },
        }
    }
}

#[async_trait]
impl<'a> Syscall for Scheduler<'a> {
    fn successors(&self, node_key: &str, label: Option<&str>) -> Vec<String> {
        self.blueprint.successors(node_key, label)
    }

    fn branch_labels(&self, node_key: &str) -> Vec<String> {
        self.blueprint.branch_labels(node_key)
    }

    async fn run_subgraph(&self, entries: Vec<String>, ctx: &ExecutionContext) -> Result<Option<Value>, NodeError> {
        match self.run_scope(entries, ctx).await {
            Ok(ScopeExit::Drained(last)) => Ok(last),
            Ok(ScopeExit::Finished(output)) => Ok(Some(output)),
            Err(failure) => Err(NodeError::Subgraph {
                node_key: failure.node_key,
                source: Box::new(failure.error),
            }),
        }
    }
}

/// Resolve every binding in field order. Stops at the first failure; the
/// snapshot then holds the fields resolved so far.
fn resolve_inputs(node: &Node, ctx: &ExecutionContext) -> (Map<String, Value>, Result<Inputs, ExpressionError>) {
    let mut snapshot = Map::new();
    let mut inputs = Inputs::new();
    for (name, binding) in &node.inputs {
        let value = match expression::resolve(binding, ctx) {
            Ok(v) => v,
            Err(e) => return (snapshot, Err(e)),
        };
        if !binding.field_type.accepts(&value) {
            let found = FieldType::of(&value);
            return (snapshot, Err(ExpressionError::mismatch(name.as_str(), binding.field_type, found)));
        }
        snapshot.insert(name.clone(), value.clone());
        inputs.insert(name.clone(), value);
    }
    (snapshot, Ok(inputs))
}
