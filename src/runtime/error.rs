use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dsl::{FieldType, NodeKind};

/// Graph problems caught before a run starts. Nothing executes when one is raised.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("workflow has no start node")]
    MissingStart,
    #[error("workflow has more than one start node: {0:?}")]
    MultipleStarts(Vec<String>),
    #[error("workflow has no end node")]
    MissingEnd,
    #[error("duplicate node key: {0}")]
    DuplicateNode(String),
    #[error("invalid node key '{0}'")]
    InvalidNodeKey(String),
    #[error("edge {from} -> {to} references an unknown node")]
    UnknownEdgeNode { from: String, to: String },
    #[error("node '{node}' cannot have an edge labeled '{label}'")]
    InvalidEdgeLabel { node: String, label: String },
    #[error("node '{node}' has invalid edges: {reason}")]
    InvalidEdges { node: String, reason: String },
    #[error("nodes unreachable from start: {0:?}")]
    Unreachable(Vec<String>),
    #[error("cycle detected through node '{0}'")]
    Cycle(String),
    #[error("node '{0}' is reachable from more than one scope")]
    ScopeConflict(String),
    #[error("end node '{node}' sits inside the body of '{owner}'")]
    EndInsideScope { node: String, owner: String },
    #[error("node '{node}' is missing required input '{input}'")]
    MissingInput { node: String, input: String },
    #[error("node '{node}' input '{input}': {reason}")]
    InvalidBinding { node: String, input: String, reason: String },
    #[error("node '{node}' condition: {reason}")]
    InvalidCondition { node: String, reason: String },
    #[error("node '{node}' references '{reference}', which cannot have run before it")]
    UnresolvableReference { node: String, reference: String },
    #[error("node '{0}' references the loop namespace outside a for-each body")]
    LoopOutsideScope(String),
    #[error("no executor registered for node '{node}' of type {kind}")]
    UnsupportedNode { node: String, kind: NodeKind },
}

/// Failures while resolving a binding. Pure, scoped to the node doing the resolution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("unresolved reference '{path}'")]
    UnresolvedReference { path: String },
    #[error("index {index} out of range for '{path}' (length {len})")]
    IndexOutOfRange { path: String, index: usize, len: usize },
    #[error("type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch { path: String, expected: String, found: FieldType },
    #[error("condition value of type {found} cannot be used as a boolean")]
    InvalidConditionType { found: String },
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

impl ExpressionError {
    pub fn unresolved(path: impl Into<String>) -> Self {
        ExpressionError::UnresolvedReference { path: path.into() }
    }

    pub fn invalid(expression: impl Into<String>, reason: impl ToString) -> Self {
        ExpressionError::InvalidExpression {
            expression: expression.into(),
            reason: reason.to_string(),
        }
    }

    pub fn mismatch(path: impl Into<String>, expected: impl ToString, found: FieldType) -> Self {
        ExpressionError::TypeMismatch {
            path: path.into(),
            expected: expected.to_string(),
            found,
        }
    }
}

/// Node-level failure. Recorded on the node's terminal record, then propagated.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("{service} call failed: {message}")]
    ExternalService { service: String, message: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("execution store error: {0}")]
    Storage(String),
    #[error("node '{node_key}' failed: {source}")]
    Subgraph { node_key: String, #[source] source: Box<NodeError> },
    #[error("iteration {index} failed: {source}")]
    Iteration { index: usize, #[source] source: Box<NodeError> },
    #[error("branch '{label}' failed: {source}")]
    Branch { label: String, #[source] source: Box<NodeError> },
}

impl NodeError {
    pub fn external(service: impl Into<String>, error: impl ToString) -> Self {
        NodeError::ExternalService {
            service: service.into(),
            message: error.to_string(),
        }
    }

    /// Classification of the innermost cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Expression(e) => match e {
                ExpressionError::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
                ExpressionError::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
                ExpressionError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
                ExpressionError::InvalidConditionType { .. } => ErrorKind::InvalidConditionType,
                ExpressionError::InvalidExpression { .. } => ErrorKind::InvalidExpression,
            },
            NodeError::ExternalService { .. } => ErrorKind::ExternalService,
            NodeError::Cancelled => ErrorKind::Cancelled,
            NodeError::Configuration(_) => ErrorKind::Configuration,
            NodeError::Storage(_) => ErrorKind::Storage,
            NodeError::Subgraph { source, .. }
            | NodeError::Iteration { source, .. }
            | NodeError::Branch { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Fatal errors end the run and never follow an on-error edge.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Storage)
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnresolvedReference,
    IndexOutOfRange,
    TypeMismatch,
    InvalidConditionType,
    InvalidExpression,
    ExternalService,
    Cancelled,
    Configuration,
    Storage,
}

/// Serializable error cause stored on a failed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("input must be a JSON object")]
    InvalidInput,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
