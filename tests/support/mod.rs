#![allow(dead_code)]

use async_trait::async_trait;
use anyhow::{Result, anyhow, bail};
use flowline::config::EngineConfig;
use flowline::runtime::engine::Engine;
use flowline::services::transform::BuiltinTransform;
use flowline::services::{
    ChatCompletion, ChatMessage, ChatResponse, Document, KnowledgeRetrieval, PluginRuntime, ScriptSandbox, TokenUsage,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plugin runtime whose behaviour is chosen by plugin key:
///
/// - `double`: returns `params.value * 2`
/// - `echo`: returns the params
/// - `fail`: always errors
/// - `slow`: sleeps `params.delay_ms` (default 50) then returns the params
/// - `slow_double`: sleeps `params.delay_ms` then returns `params.value * 2`
/// - `hang`: never returns
#[derive(Default)]
pub struct FakePlugin {
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl FakePlugin {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, key: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

fn doubled(params: &Value) -> Result<Value> {
    if let Some(i) = params["value"].as_i64() {
        return Ok(json!(i * 2));
    }
    let n = params["value"].as_f64().ok_or_else(|| anyhow!("value must be a number"))?;
    Ok(json!(n * 2.0))
}

#[async_trait]
impl PluginRuntime for FakePlugin {
    async fn invoke(&self, plugin_key: &str, params: Value) -> Result<Value> {
        self.calls.lock().unwrap().push((plugin_key.to_string(), params.clone()));
        let delay = Duration::from_millis(params["delay_ms"].as_u64().unwrap_or(50));
        match plugin_key {
            "double" => doubled(&params),
            "echo" => Ok(params),
            "fail" => bail!("plugin exploded"),
            "slow" => {
                tokio::time::sleep(delay).await;
                Ok(params)
            }
            "slow_double" => {
                tokio::time::sleep(delay).await;
                doubled(&params)
            }
            "hang" => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            other => bail!("unknown plugin {}", other),
        }
    }
}

pub struct FakeWiki;

#[async_trait]
impl KnowledgeRetrieval for FakeWiki {
    async fn query(&self, wiki_ids: &[String], query: &str) -> Result<Vec<Document>> {
        Ok(wiki_ids
            .iter()
            .map(|id| Document {
                id: format!("{}-1", id),
                title: format!("{} result", id),
                content: format!("about {}", query),
                score: 0.9,
            })
            .collect())
    }
}

/// Replies with the role/content of every message it was sent, joined by `|`.
pub struct FakeChat;

#[async_trait]
impl ChatCompletion for FakeChat {
    async fn complete(&self, model_id: &str, messages: &[ChatMessage], _settings: &Value) -> Result<ChatResponse> {
        let transcript: Vec<String> = messages.iter().map(|m| format!("{}:{}", m.role, m.content)).collect();
        Ok(ChatResponse {
            text: format!("[{}] {}", model_id, transcript.join("|")),
            usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        })
    }
}

/// Echoes what it was asked to run.
pub struct FakeSandbox;

#[async_trait]
impl ScriptSandbox for FakeSandbox {
    async fn run_script(&self, code: &str, inputs: Value, timeout: Duration) -> Result<Value> {
        Ok(json!({
            "code": code,
            "inputs": inputs,
            "timeout_ms": timeout.as_millis() as u64,
        }))
    }
}

pub fn engine_with(config: EngineConfig, plugin: Arc<FakePlugin>) -> Engine {
    Engine::builder()
        .config(config)
        .plugin_runtime(plugin)
        .knowledge_retrieval(Arc::new(FakeWiki))
        .chat_completion(Arc::new(FakeChat))
        .script_sandbox(Arc::new(FakeSandbox))
        .data_transform(Arc::new(BuiltinTransform::new()))
        .build()
}

/// Engine with every collaborator faked and default config.
pub fn engine() -> (Engine, Arc<FakePlugin>) {
    let plugin = Arc::new(FakePlugin::default());
    (engine_with(EngineConfig::default(), plugin.clone()), plugin)
}
