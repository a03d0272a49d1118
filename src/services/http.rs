use async_trait::async_trait;
use serde_json::Value;
use crate::services::PluginRuntime;
use anyhow::{Result, anyhow};
use reqwest::Client;
use tracing::debug;

/// Plugin runtime reached over HTTP: `POST {endpoint}/{plugin_key}` with the params as JSON body.
#[derive(Debug, Clone)]
pub struct HttpPluginRuntime {
    client: Client,
    endpoint: String,
}

impl HttpPluginRuntime {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, plugin_key: &str) -> String {
        format!("{}/{}", self.endpoint, plugin_key)
    }
}

#[async_trait]
impl PluginRuntime for HttpPluginRuntime {
    async fn invoke(&self, plugin_key: &str, params: Value) -> Result<Value> {
        let url = self.url_for(plugin_key);
        debug!(%url, "invoking plugin");

        let response = self.client.post(&url).json(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("plugin '{}' returned HTTP {}: {}", plugin_key, status.as_u16(), body));
        }

        // Empty or non-JSON bodies come back as null
        let data = match response.json::<Value>().await {
            Ok(json) => json,
            Err(_) => Value::Null,
        };
        Ok(data)
    }
}
