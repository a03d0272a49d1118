//! Service-backed nodes. Each one resolves its inputs, calls one external
//! collaborator and maps the answer (or the failure) into the node outcome.
//! The scheduler wraps every call here in the node's timeout.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::dsl::{FieldType, Node, NodeKind, NodeType};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::{ExpressionError, NodeError};
use crate::runtime::node::{Inputs, NodeExecutor, NodeOutcome};
use crate::runtime::syscall::Syscall;
use crate::runtime::value::stringify;
use crate::services::{ChatCompletion, ChatMessage, DataTransform, KnowledgeRetrieval, PluginRuntime, ScriptSandbox};

fn inputs_object(inputs: &Inputs) -> Value {
    Value::Object(inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
}

fn misconfigured(node: &Node) -> NodeError {
    NodeError::Configuration(format!("node '{}' is not a {} node", node.key, node.kind()))
}

fn done(node: &Node, output: Value, syscall: &dyn Syscall) -> NodeOutcome {
    NodeOutcome::next(output, syscall.successors(&node.key, None))
}

// --- PLUGIN ---

pub struct PluginExecutor {
    runtime: Arc<dyn PluginRuntime>,
}

impl PluginExecutor {
    pub fn new(runtime: Arc<dyn PluginRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl NodeExecutor for PluginExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Plugin
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let NodeType::Plugin { plugin_key } = &node.kind else {
            return Err(misconfigured(node));
        };
        let output = self.runtime
            .invoke(plugin_key, inputs_object(inputs))
            .await
            .map_err(|e| NodeError::external(NodeKind::Plugin.as_str(), format!("{:#}", e)))?;
        Ok(done(node, output, syscall))
    }
}

// --- WIKI ---

pub struct WikiExecutor {
    retrieval: Arc<dyn KnowledgeRetrieval>,
}

impl WikiExecutor {
    pub fn new(retrieval: Arc<dyn KnowledgeRetrieval>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl NodeExecutor for WikiExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Wiki
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let NodeType::Wiki { wiki_ids } = &node.kind else {
            return Err(misconfigured(node));
        };
        let query = match inputs.get("query") {
            Some(Value::String(q)) => q.as_str(),
            Some(other) => return Err(ExpressionError::mismatch("query", FieldType::String, FieldType::of(other)).into()),
            None => return Err(NodeError::Configuration(format!("wiki '{}' has no query input", node.key))),
        };
        let documents = self.retrieval
            .query(wiki_ids, query)
            .await
            .map_err(|e| NodeError::external(NodeKind::Wiki.as_str(), format!("{:#}", e)))?;
        Ok(done(node, json!({ "documents": documents }), syscall))
    }
}

// --- AI CHAT ---

pub struct AiChatExecutor {
    chat: Arc<dyn ChatCompletion>,
}

impl AiChatExecutor {
    pub fn new(chat: Arc<dyn ChatCompletion>) -> Self {
        Self { chat }
    }
}

/// Conversation sent to the model: system prompt, prior `messages`, then `prompt` as the user turn.
fn conversation(system_prompt: Option<&str>, inputs: &Inputs) -> Result<Vec<ChatMessage>, NodeError> {
    let mut messages = Vec::new();
    if let Some(system) = system_prompt {
        messages.push(ChatMessage::system(system));
    }
    if let Some(history) = inputs.get("messages") {
        let parsed: Vec<ChatMessage> = serde_json::from_value(history.clone())
            .map_err(|_| ExpressionError::mismatch("messages", "array of {role, content}", FieldType::of(history)))?;
        messages.extend(parsed);
    }
    if let Some(prompt) = inputs.get("prompt") {
        messages.push(ChatMessage::user(stringify(prompt)));
    }
    Ok(messages)
}

#[async_trait]
impl NodeExecutor for AiChatExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::AiChat
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let NodeType::AiChat { model_id, settings, system_prompt } = &node.kind else {
            return Err(misconfigured(node));
        };
        let messages = conversation(system_prompt.as_deref(), inputs)?;
        let response = self.chat
            .complete(model_id, &messages, settings)
            .await
            .map_err(|e| NodeError::external(NodeKind::AiChat.as_str(), format!("{:#}", e)))?;
        Ok(done(node, json!({ "text": response.text, "usage": response.usage }), syscall))
    }
}

// --- JAVASCRIPT ---

pub struct JavaScriptExecutor {
    sandbox: Arc<dyn ScriptSandbox>,
    default_timeout: Duration,
}

impl JavaScriptExecutor {
    pub fn new(sandbox: Arc<dyn ScriptSandbox>, default_timeout: Duration) -> Self {
        Self { sandbox, default_timeout }
    }
}

#[async_trait]
impl NodeExecutor for JavaScriptExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::JavaScript
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let NodeType::JavaScript { code } = &node.kind else {
            return Err(misconfigured(node));
        };
        let timeout = node.timeout_ms.map(Duration::from_millis).unwrap_or(self.default_timeout);
        let output = self.sandbox
            .run_script(code, inputs_object(inputs), timeout)
            .await
            .map_err(|e| NodeError::external(NodeKind::JavaScript.as_str(), format!("{:#}", e)))?;
        Ok(done(node, output, syscall))
    }
}

// --- DATA PROCESS ---

pub struct DataProcessExecutor {
    transform: Arc<dyn DataTransform>,
}

impl DataProcessExecutor {
    pub fn new(transform: Arc<dyn DataTransform>) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl NodeExecutor for DataProcessExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::DataProcess
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &ExecutionContext,
        syscall: &dyn Syscall,
    ) -> Result<NodeOutcome, NodeError> {
        let NodeType::DataProcess { operation } = &node.kind else {
            return Err(misconfigured(node));
        };
        let data = inputs.get("data").cloned().unwrap_or(Value::Null);
        let output = self.transform
            .apply(operation, data)
            .await
            .map_err(|e| NodeError::external(NodeKind::DataProcess.as_str(), format!("{:#}", e)))?;
        Ok(done(node, output, syscall))
    }
}
