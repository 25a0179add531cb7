// Lucy Engine — Meta-Integration Broker Client
//
// The broker's session surface is five meta-tools that let the model
// discover and execute any integration tool at runtime:
//
//     COMPOSIO_SEARCH_TOOLS        — find tools by use-case
//     COMPOSIO_MANAGE_CONNECTIONS  — check/create OAuth connections
//     COMPOSIO_MULTI_EXECUTE_TOOL  — execute up to 20 tools in parallel
//     COMPOSIO_REMOTE_WORKBENCH    — run Python in a sandbox
//     COMPOSIO_REMOTE_BASH_TOOL    — run bash in a sandbox
//
// It also serves full OpenAI-format tool schemas per app, which feed the
// per-workspace capability index. Schemas are cached for 10 minutes per
// workspace so a burst of requests doesn't hammer the broker.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ToolDefinition;
use crate::engine::capability_index::ToolSchemaSource;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

pub const META_TOOL_PREFIX: &str = "COMPOSIO_";

pub const META_TOOL_NAMES: [&str; 5] = [
    "COMPOSIO_SEARCH_TOOLS",
    "COMPOSIO_MANAGE_CONNECTIONS",
    "COMPOSIO_MULTI_EXECUTE_TOOL",
    "COMPOSIO_REMOTE_WORKBENCH",
    "COMPOSIO_REMOTE_BASH_TOOL",
];

const SCHEMA_CACHE_TTL_MINUTES: i64 = 10;

pub struct BrokerClient {
    client: Client,
    base_url: String,
    api_key: String,
    /// workspace_id → (expiry, schema pairs)
    schema_cache: Mutex<HashMap<String, (DateTime<Utc>, Vec<(String, Vec<ToolDefinition>)>)>>,
}

impl BrokerClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        BrokerClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            schema_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// The five meta-tool definitions passed to the model when the
    /// capability index can't produce a confident top-K.
    pub fn meta_tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "COMPOSIO_SEARCH_TOOLS",
                "Search the integration catalog for tools matching a use-case description. \
                 Returns tool slugs and schemas you can pass to COMPOSIO_MULTI_EXECUTE_TOOL.",
                json!({
                    "type": "object",
                    "properties": {
                        "use_case": {"type": "string", "description": "What you are trying to do"},
                        "apps": {"type": "array", "items": {"type": "string"}, "description": "Optional app slugs to restrict the search"}
                    },
                    "required": ["use_case"]
                }),
            ),
            ToolDefinition::function(
                "COMPOSIO_MANAGE_CONNECTIONS",
                "Check the status of an app connection or create an OAuth link for the user.",
                json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["status", "initiate"]},
                        "toolkit": {"type": "string", "description": "App slug, e.g. 'googlecalendar'"}
                    },
                    "required": ["action", "toolkit"]
                }),
            ),
            ToolDefinition::function(
                "COMPOSIO_MULTI_EXECUTE_TOOL",
                "Execute up to 20 integration tools in parallel. Each entry names a tool slug \
                 and its arguments.",
                json!({
                    "type": "object",
                    "properties": {
                        "tools": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "tool_slug": {"type": "string"},
                                    "arguments": {"type": "object"}
                                },
                                "required": ["tool_slug", "arguments"]
                            }
                        }
                    },
                    "required": ["tools"]
                }),
            ),
            ToolDefinition::function(
                "COMPOSIO_REMOTE_WORKBENCH",
                "Run Python code in the broker's sandbox. Use for data processing over tool results.",
                json!({
                    "type": "object",
                    "properties": {"code": {"type": "string"}},
                    "required": ["code"]
                }),
            ),
            ToolDefinition::function(
                "COMPOSIO_REMOTE_BASH_TOOL",
                "Run a bash command in the broker's sandbox.",
                json!({
                    "type": "object",
                    "properties": {"command": {"type": "string"}},
                    "required": ["command"]
                }),
            ),
        ]
    }

    /// Execute one meta-tool call for a workspace.
    pub async fn execute(
        &self,
        workspace_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> EngineResult<Value> {
        if !self.is_configured() {
            return Err(EngineError::Config("Broker API key not configured".into()));
        }

        let response = self
            .client
            .post(format!("{}/api/v3/tools/execute", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "slug": tool_name,
                "arguments": arguments,
                "user_id": workspace_id,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::tool(
                tool_name,
                format!(
                    "Broker error {}: {}",
                    status.as_u16(),
                    crate::atoms::types::truncate_utf8(&body, 300)
                ),
            ));
        }
        Ok(response.json().await?)
    }

    /// List connected app slugs for a workspace.
    pub async fn get_connected_apps(&self, workspace_id: &str) -> EngineResult<Vec<String>> {
        if !self.is_configured() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get(format!("{}/api/v3/toolkits", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("user_id", workspace_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(
                "[broker] toolkit listing failed: HTTP {}",
                response.status().as_u16()
            );
            return Ok(Vec::new());
        }
        let data: Value = response.json().await?;
        Ok(data["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|tk| tk["connection"]["is_active"].as_bool().unwrap_or(false))
                    .filter_map(|tk| tk["slug"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Clear the schema cache for one workspace (or all).
    pub fn invalidate_cache(&self, workspace_id: Option<&str>) {
        let mut cache = self.schema_cache.lock();
        match workspace_id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }
}

#[async_trait]
impl ToolSchemaSource for BrokerClient {
    /// Fetch OpenAI-format tool schemas per connected app, with a
    /// 10-minute per-workspace cache.
    async fn fetch_app_tool_schemas(
        &self,
        workspace_id: &str,
        apps: &[String],
    ) -> EngineResult<Vec<(String, Vec<ToolDefinition>)>> {
        if !self.is_configured() || apps.is_empty() {
            return Ok(Vec::new());
        }

        {
            let cache = self.schema_cache.lock();
            if let Some((expiry, pairs)) = cache.get(workspace_id) {
                if *expiry > Utc::now() {
                    return Ok(pairs.clone());
                }
            }
        }

        let mut pairs = Vec::new();
        for app in apps {
            let response = self
                .client
                .get(format!("{}/api/v3/tools", self.base_url))
                .header("x-api-key", &self.api_key)
                .query(&[("toolkit_slug", app.as_str()), ("user_id", workspace_id)])
                .send()
                .await?;
            if !response.status().is_success() {
                warn!(
                    "[broker] Schema fetch for {} failed: HTTP {}",
                    app,
                    response.status().as_u16()
                );
                continue;
            }
            let data: Value = response.json().await?;
            let schemas: Vec<ToolDefinition> = data["items"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            pairs.push((app.clone(), schemas));
        }

        let total: usize = pairs.iter().map(|(_, s)| s.len()).sum();
        info!(
            "[broker] Fetched {} schemas across {} apps for {}",
            total,
            pairs.len(),
            workspace_id
        );

        self.schema_cache.lock().insert(
            workspace_id.to_string(),
            (
                Utc::now() + ChronoDuration::minutes(SCHEMA_CACHE_TTL_MINUTES),
                pairs.clone(),
            ),
        );
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_tool_definitions_complete() {
        let broker = BrokerClient::new("https://broker.example", "key");
        let defs = broker.meta_tool_definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name()).collect();
        assert_eq!(names, META_TOOL_NAMES.to_vec());
        for def in &defs {
            assert!(def.function.parameters["type"] == "object");
        }
    }

    #[test]
    fn test_unconfigured_broker() {
        let broker = BrokerClient::new("https://broker.example", "");
        assert!(!broker.is_configured());
    }
}
