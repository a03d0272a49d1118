use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};

use crate::dsl::{Node, NodeKind};

/// Engine settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    /// Iterations a for-each node runs at once unless the node says otherwise.
    pub foreach_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            foreach_concurrency: 1,
        }
    }
}

/// Per service-node-type timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub plugin_ms: u64,
    pub wiki_ms: u64,
    pub ai_chat_ms: u64,
    pub javascript_ms: u64,
    pub data_process_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            plugin_ms: 30_000,
            wiki_ms: 30_000,
            ai_chat_ms: 120_000,
            javascript_ms: 10_000,
            data_process_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    /// Timeout for dispatching `node`. `None` for control-flow nodes, which are unbounded.
    pub fn timeout_for(&self, node: &Node) -> Option<Duration> {
        let kind = node.kind();
        if !kind.is_service() {
            return None;
        }
        let ms = node.timeout_ms.unwrap_or(match kind {
            NodeKind::Plugin => self.timeouts.plugin_ms,
            NodeKind::Wiki => self.timeouts.wiki_ms,
            NodeKind::AiChat => self.timeouts.ai_chat_ms,
            NodeKind::JavaScript => self.timeouts.javascript_ms,
            _ => self.timeouts.data_process_ms,
        });
        Some(Duration::from_millis(ms))
    }

    pub fn foreach_concurrency(&self) -> usize {
        self.foreach_concurrency.max(1)
    }
}
