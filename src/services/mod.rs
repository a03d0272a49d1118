//! External collaborators consumed by service-backed nodes.
//!
//! The engine only depends on these traits; concrete runtimes are injected
//! through [`crate::runtime::engine::EngineBuilder`].

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use anyhow::Result;
use std::time::Duration;

pub mod http;
pub mod transform;

/// 插件运行时接口
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn invoke(&self, plugin_key: &str, params: Value) -> Result<Value>;
}

/// Knowledge retrieval (wiki) service.
#[async_trait]
pub trait KnowledgeRetrieval: Send + Sync {
    async fn query(&self, wiki_ids: &[String], query: &str) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, model_id: &str, messages: &[ChatMessage], settings: &Value) -> Result<ChatResponse>;
}

/// Untrusted script execution.
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn run_script(&self, code: &str, inputs: Value, timeout: Duration) -> Result<Value>;
}

#[async_trait]
pub trait DataTransform: Send + Sync {
    async fn apply(&self, operation: &DataOperation, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Map/filter/aggregate style operations understood by a [`DataTransform`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOperation {
    /// Evaluate `expression` once per element (`item`, `index` are bound).
    Map { expression: String },
    /// Keep elements for which `expression` is truthy.
    Filter { expression: String },
    Aggregate {
        function: AggregateFunction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    Sort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default)]
        descending: bool,
    },
}

impl DataOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DataOperation::Map { .. } => "map",
            DataOperation::Filter { .. } => "filter",
            DataOperation::Aggregate { .. } => "aggregate",
            DataOperation::Sort { .. } => "sort",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    Concat,
}
