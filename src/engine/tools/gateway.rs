// Lucy Engine — Remote Exec Gateway Client
//
// Wraps the gateway's Tools Invoke API (POST /tools/invoke) so Lucy can
// remotely execute commands, manage background processes, and fetch web
// content without SSH. Background exec returns a sessionId that the
// process tool polls, logs, and kills.

use crate::atoms::error::{EngineError, EngineResult};
use log::{error, info};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const INVOKE_PATH: &str = "/tools/invoke";
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;

pub struct GatewayClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: &str) -> EngineResult<Self> {
        if base_url.is_empty() || token.is_empty() {
            return Err(EngineError::Config(
                "Gateway not configured: set LUCY_GATEWAY_BASE_URL and LUCY_GATEWAY_TOKEN".into(),
            ));
        }
        Ok(GatewayClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(180))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Low-level invoke: POST /tools/invoke with `{ tool, args }`.
    /// The gateway replies `{ ok, result | error: { type, message } }`.
    pub async fn invoke(&self, tool: &str, args: Value) -> EngineResult<Value> {
        let mut payload = json!({ "tool": tool });
        if !args.is_null() {
            payload["args"] = args;
        }

        let response = self
            .client
            .post(format!("{}{}", self.base_url, INVOKE_PATH))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "[gateway] HTTP {} invoking {}: {}",
                status,
                tool,
                crate::atoms::types::truncate_utf8(&body, 300)
            );
            return Err(EngineError::tool(
                tool,
                format!("HTTP {} from gateway", status.as_u16()),
            ));
        }

        let data: Value = response.json().await?;
        if !data["ok"].as_bool().unwrap_or(false) {
            let message = data["error"]["message"]
                .as_str()
                .unwrap_or("unknown gateway error")
                .to_string();
            return Err(EngineError::tool(tool, message));
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    // ── exec tool ──────────────────────────────────────────────────────

    /// Run a foreground shell command on the gateway host.
    pub async fn exec_command(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
        workdir: Option<&str>,
        env: Option<&Value>,
    ) -> EngineResult<Value> {
        let mut args = json!({
            "command": command,
            "timeout": timeout_secs.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS),
        });
        if let Some(workdir) = workdir {
            args["workdir"] = json!(workdir);
        }
        if let Some(env) = env {
            args["env"] = env.clone();
        }
        self.invoke("exec", args).await
    }

    /// Start a command in background mode. Returns the sessionId.
    pub async fn start_background(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> EngineResult<String> {
        let mut args = json!({ "command": command, "background": true });
        if let Some(workdir) = workdir {
            args["workdir"] = json!(workdir);
        }
        let result = self.invoke("exec", args).await?;
        let session_id = result["sessionId"].as_str().unwrap_or_default().to_string();
        if session_id.is_empty() {
            return Err(EngineError::tool("exec", "No sessionId returned from background exec"));
        }
        info!(
            "[gateway] Background session {} started: {}",
            session_id,
            crate::atoms::types::truncate_utf8(command, 80)
        );
        Ok(session_id)
    }

    // ── process tool ───────────────────────────────────────────────────

    pub async fn poll_process(&self, session_id: &str) -> EngineResult<Value> {
        self.invoke("process", json!({ "action": "poll", "sessionId": session_id }))
            .await
    }

    pub async fn log_process(&self, session_id: &str, limit: u64, offset: Option<u64>) -> EngineResult<Value> {
        let mut args = json!({ "action": "log", "sessionId": session_id, "limit": limit });
        if let Some(offset) = offset {
            args["offset"] = json!(offset);
        }
        self.invoke("process", args).await
    }

    pub async fn kill_process(&self, session_id: &str) -> EngineResult<Value> {
        self.invoke("process", json!({ "action": "kill", "sessionId": session_id }))
            .await
    }

    pub async fn list_processes(&self) -> EngineResult<Vec<Value>> {
        let result = self.invoke("process", json!({ "action": "list" })).await?;
        Ok(result["sessions"]
            .as_array()
            .cloned()
            .unwrap_or_else(|| result.as_array().cloned().unwrap_or_default()))
    }

    // ── file tools ─────────────────────────────────────────────────────

    pub async fn read_file(&self, path: &str) -> EngineResult<String> {
        let result = self.invoke("read", json!({ "path": path })).await?;
        Ok(result["content"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| result.to_string()))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> EngineResult<Value> {
        self.invoke("write", json!({ "path": path, "content": content }))
            .await
    }

    pub async fn edit_file(&self, path: &str, old_string: &str, new_string: &str) -> EngineResult<Value> {
        self.invoke(
            "edit",
            json!({ "path": path, "old_string": old_string, "new_string": new_string }),
        )
        .await
    }

    // ── web_fetch tool ─────────────────────────────────────────────────

    /// Fetch a URL via the gateway and return extracted markdown.
    pub async fn web_fetch(&self, url: &str, max_chars: u64) -> EngineResult<String> {
        let result = self
            .invoke(
                "web_fetch",
                json!({ "url": url, "extractMode": "markdown", "maxChars": max_chars }),
            )
            .await?;
        Ok(result["content"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| result.to_string()))
    }

    // ── health ─────────────────────────────────────────────────────────

    pub async fn health_check(&self) -> bool {
        self.invoke("session_status", Value::Null).await.is_ok()
    }
}
