use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dsl::{NodeKind, WorkflowDefinition};
use crate::runtime::error::{ErrorInfo, NodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }
}

/// 节点执行记录
///
/// `Pending -> Running -> Completed | Failed`. Terminal records are never changed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub sequence: u64,
    pub node_key: String,
    pub node_type: NodeKind,
    /// Scope the node ran in: `root`, `loop[2]`, `fan.branch-a`, ...
    pub scope: String,
    pub state: NodeState,
    #[serde(default)]
    pub input_snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    pub fn pending(sequence: u64, node_key: &str, node_type: NodeKind, scope: &str) -> Self {
        Self {
            sequence,
            node_key: node_key.to_string(),
            node_type,
            scope: scope.to_string(),
            state: NodeState::Pending,
            input_snapshot: Value::Null,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, input_snapshot: Value) {
        debug_assert_eq!(self.state, NodeState::Pending);
        self.state = NodeState::Running;
        self.input_snapshot = input_snapshot;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: Value) {
        debug_assert_eq!(self.state, NodeState::Running);
        self.state = NodeState::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &NodeError) {
        debug_assert_eq!(self.state, NodeState::Running);
        self.state = NodeState::Failed;
        self.error = Some(error.info());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One run of a workflow definition, including its ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub definition: WorkflowDefinition,
    pub status: ExecutionStatus,
    pub input: Value,
    #[serde(default)]
    pub history: Vec<NodeExecutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(execution_id: Uuid, definition: WorkflowDefinition, input: Value) -> Self {
        Self {
            execution_id,
            definition,
            status: ExecutionStatus::Running,
            input,
            history: Vec::new(),
            final_output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn records_for<'a>(&'a self, node_key: &'a str) -> impl Iterator<Item = &'a NodeExecutionRecord> + 'a {
        self.history.iter().filter(move |r| r.node_key == node_key)
    }

    pub fn count_in_state(&self, state: NodeState) -> usize {
        self.history.iter().filter(|r| r.state == state).count()
    }
}

/// Terminal outcome handed to the recorder when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub status: ExecutionStatus,
    pub final_output: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}
