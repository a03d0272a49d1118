use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;

use crate::dsl::{Node, NodeKind};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::NodeError;
use crate::runtime::syscall::Syscall;

/// Resolved input bindings of one node, by field name.
pub type Inputs = BTreeMap<String, Value>;

/// What an executor hands back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub output: Value,
    /// Successors to enqueue in the current scope.
    pub next: Vec<String>,
    /// Set by End: the run is over and `output` is its final output.
    pub finish: bool,
}

impl NodeOutcome {
    pub fn next(output: Value, next: Vec<String>) -> Self {
        Self { output, next, finish: false }
    }

    pub fn finish(output: Value) -> Self {
        Self { output, next: Vec::new(), finish: true }
    }
}

/// 节点执行器接口
///
/// One implementation per [`NodeKind`]. Control-flow executors drive nested
/// scopes through the [`Syscall`] handle instead of touching the scheduler.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn kind(&self) -> NodeKind;

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError>;
}

/// Dispatch table from node type to executor.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: NodeKind) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(&kind)
    }

    pub fn contains(&self, kind: NodeKind) -> bool {
        self.executors.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = NodeKind> + '_ {
        self.executors.keys().copied()
    }
}
