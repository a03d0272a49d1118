use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::dsl::{Node, NodeKind};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::NodeError;
use crate::runtime::node::{Inputs, NodeExecutor, NodeOutcome};
use crate::runtime::syscall::Syscall;

/// Entry point. Its output is the run input, so `start.*` mirrors `input.*`.
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Start
    }

    async fn execute(
        &self,
        node: &Node,
        _inputs: &Inputs,
        ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::next(ctx.input().clone(), syscall.successors(&node.key, None)))
    }
}

/// Terminal node. The resolved inputs become the run's final output.
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::End
    }

    async fn execute(
        &self,
        _node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        _syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let output: Map<String, Value> = inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(NodeOutcome::finish(Value::Object(output)))
    }
}
