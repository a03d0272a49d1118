use async_trait::async_trait;
use serde_json::Value;

use crate::runtime::context::ExecutionContext;
use crate::runtime::error::NodeError;

/// 系统调用接口
/// Node 通过此接口控制 Engine 的调度
#[async_trait]
pub trait Syscall: Send + Sync {
    /// 按标签查询后继节点 (`None` = 默认边)
    fn successors(&self, node_key: &str, label: Option<&str>) -> Vec<String>;

    /// Fork 的分支标签，已排序
    fn branch_labels(&self, node_key: &str) -> Vec<String>;

    /// Run the nodes reachable from `entries` inside `ctx` until that scope drains.
    /// Returns the output of the last node that completed, if any.
    async fn run_subgraph(&self, entries: Vec<String>, ctx: &ExecutionContext) -> Result<Option<Value>, NodeError>;
}
