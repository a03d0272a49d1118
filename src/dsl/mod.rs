pub mod builder;

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::services::DataOperation;

/// Reserved edge labels.
pub mod labels {
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const ITEM: &str = "item";
    pub const ERROR: &str = "error";
    /// Fork branches use any label with this prefix ("branch-a", "branch-1", ...)
    pub const BRANCH_PREFIX: &str = "branch";

    pub fn is_branch(label: &str) -> bool {
        label.starts_with(BRANCH_PREFIX)
    }
}

/// 工作流定义 (不可变、带版本的节点图)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.key == key)
    }
}

/// 定义中的节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub key: String,
    #[serde(flatten)]
    pub kind: NodeType,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldBinding>,
    /// Per-node timeout override; only honoured by service-backed nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.kind.kind()
    }
}

/// 节点类型及其配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Condition {
        /// Comparison expression, used when no `condition` input binding is given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    ForEach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<usize>,
    },
    Fork,
    Plugin {
        plugin_key: String,
    },
    Wiki {
        wiki_ids: Vec<String>,
    },
    AiChat {
        model_id: String,
        #[serde(default)]
        settings: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
    },
    #[serde(rename = "javascript")]
    JavaScript {
        code: String,
    },
    DataProcess {
        operation: DataOperation,
    },
}

impl NodeType {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::Condition { .. } => NodeKind::Condition,
            NodeType::ForEach { .. } => NodeKind::ForEach,
            NodeType::Fork => NodeKind::Fork,
            NodeType::Plugin { .. } => NodeKind::Plugin,
            NodeType::Wiki { .. } => NodeKind::Wiki,
            NodeType::AiChat { .. } => NodeKind::AiChat,
            NodeType::JavaScript { .. } => NodeKind::JavaScript,
            NodeType::DataProcess { .. } => NodeKind::DataProcess,
        }
    }
}

/// Dispatch key for node executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Condition,
    ForEach,
    Fork,
    Plugin,
    Wiki,
    AiChat,
    #[serde(rename = "javascript")]
    JavaScript,
    DataProcess,
}

impl NodeKind {
    /// Nodes that talk to an external collaborator and therefore run under a timeout.
    pub fn is_service(self) -> bool {
        matches!(
            self,
            NodeKind::Plugin | NodeKind::Wiki | NodeKind::AiChat | NodeKind::JavaScript | NodeKind::DataProcess
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Condition => "condition",
            NodeKind::ForEach => "for_each",
            NodeKind::Fork => "fork",
            NodeKind::Plugin => "plugin",
            NodeKind::Wiki => "wiki",
            NodeKind::AiChat => "ai_chat",
            NodeKind::JavaScript => "javascript",
            NodeKind::DataProcess => "data_process",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 边: source -> target，可带分支标签
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionType {
    Fixed,
    Variable,
    JsonPath,
    StringInterpolation,
}

/// 字段绑定: 节点输入字段在运行时如何取值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldBinding {
    #[serde(rename = "type")]
    pub expression_type: ExpressionType,
    /// Any JSON literal for `Fixed`; a string for every other expression type.
    pub expression: Value,
    #[serde(default, skip_serializing_if = "FieldType::is_dynamic")]
    pub field_type: FieldType,
}

impl FieldBinding {
    pub fn fixed(value: impl Into<Value>) -> Self {
        Self::new(ExpressionType::Fixed, value.into())
    }

    pub fn variable(path: &str) -> Self {
        Self::new(ExpressionType::Variable, Value::String(path.to_string()))
    }

    pub fn json_path(path: &str) -> Self {
        Self::new(ExpressionType::JsonPath, Value::String(path.to_string()))
    }

    pub fn template(template: &str) -> Self {
        Self::new(ExpressionType::StringInterpolation, Value::String(template.to_string()))
    }

    fn new(expression_type: ExpressionType, expression: Value) -> Self {
        Self {
            expression_type,
            expression,
            field_type: FieldType::Dynamic,
        }
    }

    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }
}

/// Declared or resolved value shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Empty,
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Dynamic,
}

impl FieldType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Empty,
            Value::String(_) => FieldType::String,
            Value::Number(_) => FieldType::Number,
            Value::Bool(_) => FieldType::Boolean,
            Value::Object(_) => FieldType::Object,
            Value::Array(_) => FieldType::Array,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        self == FieldType::Dynamic || self == FieldType::of(value)
    }

    pub fn is_dynamic(&self) -> bool {
        *self == FieldType::Dynamic
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Empty => "empty",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}
