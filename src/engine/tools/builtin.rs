// Lucy Engine — Built-in Tools
//
// Tools Lucy ships with regardless of which integrations a workspace has
// connected: web search, persistent background services (via the gateway),
// cron management, skill writing, and session memory.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CronDefinition, Message, ToolDefinition};
use crate::engine::providers::ChatProvider;
use crate::engine::tools::gateway::GatewayClient;
use crate::engine::workspace::{memory, skills, WorkspaceStore};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

const SEARCH_MODEL: &str = "google/gemini-2.5-flash:online";
const SEARCH_MAX_TOKENS: u32 = 4096;

/// Ask the cron scheduler to fire one cron now (out-of-schedule).
#[derive(Debug, Clone)]
pub struct CronTrigger {
    pub workspace_id: String,
    pub slug: String,
}

pub struct BuiltinTools {
    provider: Arc<dyn ChatProvider>,
    gateway: Option<Arc<GatewayClient>>,
    cron_trigger_tx: UnboundedSender<CronTrigger>,
}

impl BuiltinTools {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        gateway: Option<Arc<GatewayClient>>,
        cron_trigger_tx: UnboundedSender<CronTrigger>,
    ) -> Self {
        BuiltinTools {
            provider,
            gateway,
            cron_trigger_tx,
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "lucy_web_search",
                "Search the web for real-time information. Use this when you don't know if an \
                 API exists, need current docs or rate limits, need to verify facts, or the user \
                 asks about recent events. Returns a synthesized answer with source URLs. ALWAYS \
                 call this BEFORE guessing or giving up on finding information about a service.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "The search query. Be specific — include service names, 'API', 'documentation', etc."}
                    },
                    "required": ["query"]
                }),
            ),
            ToolDefinition::function(
                "lucy_start_service",
                "Start a persistent background service (always-running process). Use for webhook \
                 listeners, event processors, and polling workers. Returns a service_id. Use crons \
                 for periodic tasks instead — services are for continuous operation.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "Shell command to run, e.g. 'python webhook_listener.py'"},
                        "name": {"type": "string", "description": "Human-readable service name"},
                        "workdir": {"type": "string", "description": "Working directory (optional)"}
                    },
                    "required": ["command", "name"]
                }),
            ),
            ToolDefinition::function(
                "lucy_stop_service",
                "Stop a running background service.",
                json!({
                    "type": "object",
                    "properties": {"service_id": {"type": "string"}},
                    "required": ["service_id"]
                }),
            ),
            ToolDefinition::function(
                "lucy_list_services",
                "List all background services (running and recently stopped).",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::function(
                "lucy_service_logs",
                "Get recent logs from a background service.",
                json!({
                    "type": "object",
                    "properties": {
                        "service_id": {"type": "string"},
                        "limit": {"type": "integer", "description": "Max log lines (default 100)"}
                    },
                    "required": ["service_id"]
                }),
            ),
            ToolDefinition::function(
                "lucy_create_cron",
                "Create a recurring cron for this workspace. The cron runs on a schedule and \
                 delivers its result to a channel, a DM, or just the execution log.",
                json!({
                    "type": "object",
                    "properties": {
                        "slug": {"type": "string", "description": "Short kebab-case identifier"},
                        "title": {"type": "string"},
                        "description": {"type": "string", "description": "What the cron should do each run"},
                        "cron_expression": {"type": "string", "description": "Standard 5-field cron expression"},
                        "type": {"type": "string", "enum": ["script", "agent"]},
                        "delivery_mode": {"type": "string", "enum": ["channel", "dm", "log_only"]},
                        "delivery_channel": {"type": "string"},
                        "timezone": {"type": "string", "description": "IANA timezone, e.g. Asia/Kolkata"},
                        "max_runs": {"type": "integer", "description": "Self-delete after this many runs (0 = forever)"},
                        "max_retries": {"type": "integer"}
                    },
                    "required": ["slug", "title", "description", "cron_expression", "type", "delivery_mode"]
                }),
            ),
            ToolDefinition::function(
                "lucy_delete_cron",
                "Delete a cron and its execution history.",
                json!({
                    "type": "object",
                    "properties": {"slug": {"type": "string"}},
                    "required": ["slug"]
                }),
            ),
            ToolDefinition::function(
                "lucy_list_crons",
                "List this workspace's crons with their schedules.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::function(
                "lucy_trigger_cron",
                "Fire a cron immediately, outside its schedule.",
                json!({
                    "type": "object",
                    "properties": {"slug": {"type": "string"}},
                    "required": ["slug"]
                }),
            ),
            ToolDefinition::function(
                "lucy_save_skill",
                "Create or update a workspace skill file. Skills customize how you behave for \
                 this workspace and are injected into future prompts.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Kebab-case skill name"},
                        "description": {"type": "string", "description": "One line: what it does, when to use it"},
                        "content": {"type": "string", "description": "Markdown body with the full instructions"}
                    },
                    "required": ["name", "description", "content"]
                }),
            ),
            ToolDefinition::function(
                "lucy_remember",
                "Store a fact in session memory so it survives across threads.",
                json!({
                    "type": "object",
                    "properties": {
                        "fact": {"type": "string"},
                        "category": {"type": "string", "enum": ["company", "team", "general"]}
                    },
                    "required": ["fact"]
                }),
            ),
        ]
    }

    pub fn is_builtin(name: &str) -> bool {
        name.starts_with("lucy_")
    }

    pub async fn execute(
        &self,
        ws: &WorkspaceStore,
        name: &str,
        params: &Value,
    ) -> EngineResult<Value> {
        match name {
            "lucy_web_search" => self.web_search(params).await,
            "lucy_start_service" => self.start_service(params).await,
            "lucy_stop_service" => self.stop_service(params).await,
            "lucy_list_services" => self.list_services().await,
            "lucy_service_logs" => self.service_logs(params).await,
            "lucy_create_cron" => self.create_cron(ws, params),
            "lucy_delete_cron" => self.delete_cron(ws, params),
            "lucy_list_crons" => self.list_crons(ws),
            "lucy_trigger_cron" => self.trigger_cron(ws, params),
            "lucy_save_skill" => self.save_skill(ws, params),
            "lucy_remember" => self.remember(ws, params),
            _ => Err(EngineError::tool(name, "Unknown built-in tool")),
        }
    }

    // ── Web search ─────────────────────────────────────────────────────

    async fn web_search(&self, params: &Value) -> EngineResult<Value> {
        let query = required_str(params, "query", "lucy_web_search")?;
        info!("[builtin] Web search: {}", crate::atoms::types::truncate_utf8(query, 80));

        let messages = vec![
            Message::system(
                "You are a research assistant. Answer the user's question using current web \
                 information. Include specific details: URLs, version numbers, code examples, \
                 rate limits — whatever is relevant. Be concise but thorough.",
            ),
            Message::user(query),
        ];

        let reply = self
            .provider
            .chat(SEARCH_MODEL, &messages, &[], SEARCH_MAX_TOKENS, 0.3)
            .await
            .map_err(|e| EngineError::tool("lucy_web_search", e.to_string()))?;

        if reply.content.is_empty() {
            return Err(EngineError::tool("lucy_web_search", "Web search returned empty response"));
        }
        Ok(json!({ "query": query, "answer": reply.content }))
    }

    // ── Background services (gateway) ──────────────────────────────────

    fn gateway(&self) -> EngineResult<&Arc<GatewayClient>> {
        self.gateway
            .as_ref()
            .ok_or_else(|| EngineError::Config("Service management not available: gateway not configured".into()))
    }

    async fn start_service(&self, params: &Value) -> EngineResult<Value> {
        let command = required_str(params, "command", "lucy_start_service")?;
        let name = params["name"].as_str().unwrap_or("unnamed-service");
        let workdir = params["workdir"].as_str();

        let session_id = self.gateway()?.start_background(command, workdir).await?;
        info!("[builtin] Service '{}' started ({})", name, session_id);
        Ok(json!({
            "service_id": session_id,
            "name": name,
            "status": "running",
            "message": format!("Service '{}' is now running.", name),
        }))
    }

    async fn stop_service(&self, params: &Value) -> EngineResult<Value> {
        let service_id = required_str(params, "service_id", "lucy_stop_service")?;
        let result = self.gateway()?.kill_process(service_id).await?;
        Ok(json!({ "status": "stopped", "service_id": service_id, "result": result }))
    }

    async fn list_services(&self) -> EngineResult<Value> {
        let processes = self.gateway()?.list_processes().await?;
        let services: Vec<Value> = processes
            .iter()
            .map(|proc| {
                json!({
                    "service_id": proc["sessionId"].as_str().unwrap_or_default(),
                    "command": crate::atoms::types::truncate_utf8(proc["command"].as_str().unwrap_or_default(), 80),
                    "status": proc["status"].as_str().unwrap_or("unknown"),
                    "started_at": proc["startedAt"].as_str().unwrap_or_default(),
                })
            })
            .collect();
        Ok(json!({ "count": services.len(), "services": services }))
    }

    async fn service_logs(&self, params: &Value) -> EngineResult<Value> {
        let service_id = required_str(params, "service_id", "lucy_service_logs")?;
        let limit = params["limit"].as_u64().unwrap_or(100);
        self.gateway()?.log_process(service_id, limit, None).await
    }

    // ── Cron management ────────────────────────────────────────────────

    fn create_cron(&self, ws: &WorkspaceStore, params: &Value) -> EngineResult<Value> {
        if !params.is_object() {
            return Err(EngineError::tool("lucy_create_cron", "arguments must be an object"));
        }
        let slug = sanitize_slug(required_str(params, "slug", "lucy_create_cron")?);
        let mut definition = params.clone();
        definition["path"] = json!(format!("crons/{}", slug));
        if definition.get("timezone").and_then(|v| v.as_str()).is_none() {
            definition["timezone"] = json!("UTC");
        }

        // Validate through the typed definition before persisting.
        let parsed: CronDefinition = serde_json::from_value(definition.clone())
            .map_err(|e| EngineError::tool("lucy_create_cron", format!("Invalid cron definition: {}", e)))?;

        let path = format!("crons/{}/task.json", slug);
        ws.write(&path, &serde_json::to_string_pretty(&parsed)?)?;
        info!("[builtin] Cron '{}' created ({})", slug, ws.workspace_id());
        Ok(json!({
            "slug": slug,
            "path": path,
            "message": format!("Cron '{}' created. It will fire on schedule: {}", parsed.title, parsed.cron_expression),
        }))
    }

    fn delete_cron(&self, ws: &WorkspaceStore, params: &Value) -> EngineResult<Value> {
        let slug = sanitize_slug(required_str(params, "slug", "lucy_delete_cron")?);
        let removed = ws.delete_dir(&format!("crons/{}", slug))?;
        if !removed {
            return Err(EngineError::tool(
                "lucy_delete_cron",
                format!("No cron named '{}'", slug),
            ));
        }
        info!("[builtin] Cron '{}' deleted ({})", slug, ws.workspace_id());
        Ok(json!({ "slug": slug, "deleted": true }))
    }

    fn list_crons(&self, ws: &WorkspaceStore) -> EngineResult<Value> {
        let mut crons = Vec::new();
        for entry in ws.list("crons")? {
            if !entry.ends_with('/') {
                continue;
            }
            let slug = entry
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let Some(text) = ws.read(&format!("crons/{}/task.json", slug))? else {
                continue;
            };
            match serde_json::from_str::<CronDefinition>(&text) {
                Ok(def) => crons.push(json!({
                    "slug": slug,
                    "title": def.title,
                    "cron_expression": def.cron_expression,
                    "type": def.cron_type,
                    "delivery_mode": def.delivery_mode,
                    "timezone": def.timezone,
                })),
                Err(e) => warn!("[builtin] Skipping malformed cron '{}': {}", slug, e),
            }
        }
        Ok(json!({ "count": crons.len(), "crons": crons }))
    }

    fn trigger_cron(&self, ws: &WorkspaceStore, params: &Value) -> EngineResult<Value> {
        let slug = sanitize_slug(required_str(params, "slug", "lucy_trigger_cron")?);
        if ws.read(&format!("crons/{}/task.json", slug))?.is_none() {
            return Err(EngineError::tool(
                "lucy_trigger_cron",
                format!("No cron named '{}'", slug),
            ));
        }
        self.cron_trigger_tx
            .send(CronTrigger {
                workspace_id: ws.workspace_id().to_string(),
                slug: slug.clone(),
            })
            .map_err(|_| EngineError::tool("lucy_trigger_cron", "Cron scheduler is not running"))?;
        Ok(json!({ "slug": slug, "triggered": true }))
    }

    // ── Skills & memory ────────────────────────────────────────────────

    fn save_skill(&self, ws: &WorkspaceStore, params: &Value) -> EngineResult<Value> {
        let name = sanitize_slug(required_str(params, "name", "lucy_save_skill")?);
        let description = required_str(params, "description", "lucy_save_skill")?;
        let content = required_str(params, "content", "lucy_save_skill")?;

        let file = format!(
            "---\nname: {}\ndescription: {}\n---\n\n{}\n",
            name, description, content
        );
        let path = skills::write_skill(ws, &name, &file, "skills")?;
        Ok(json!({ "name": name, "path": path }))
    }

    fn remember(&self, ws: &WorkspaceStore, params: &Value) -> EngineResult<Value> {
        let fact = required_str(params, "fact", "lucy_remember")?;
        let category = params["category"].as_str().unwrap_or("general");
        memory::add_session_fact(ws, fact, "agent", category)?;
        Ok(json!({ "remembered": true, "category": category }))
    }
}

fn required_str<'a>(params: &'a Value, key: &str, tool: &str) -> EngineResult<&'a str> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::tool(tool, format!("missing '{}' argument", key)))
}

/// Slugs become directory names; keep them filesystem-safe.
fn sanitize_slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::providers::{ProviderError, ProviderReply};
    use async_trait::async_trait;

    struct NullProvider;

    #[async_trait]
    impl ChatProvider for NullProvider {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<ProviderReply, ProviderError> {
            Ok(ProviderReply {
                content: "searched".into(),
                ..Default::default()
            })
        }
    }

    fn builtins() -> (BuiltinTools, tokio::sync::mpsc::UnboundedReceiver<CronTrigger>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (BuiltinTools::new(Arc::new(NullProvider), None, tx), rx)
    }

    fn workspace() -> (tempfile::TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();
        (tmp, ws)
    }

    #[test]
    fn test_sanitize_slug() {
        assert_eq!(sanitize_slug("Daily Report!"), "daily-report-");
        assert_eq!(sanitize_slug("standup_reminder"), "standup_reminder");
    }

    #[tokio::test]
    async fn test_create_list_delete_cron() {
        let (builtins, _rx) = builtins();
        let (_tmp, ws) = workspace();

        let params = json!({
            "slug": "standup",
            "title": "Standup reminder",
            "description": "Post the standup prompt",
            "cron_expression": "0 9 * * 1-5",
            "type": "agent",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
        });
        builtins.execute(&ws, "lucy_create_cron", &params).await.unwrap();
        assert!(ws.read("crons/standup/task.json").unwrap().is_some());

        let listed = builtins.execute(&ws, "lucy_list_crons", &json!({})).await.unwrap();
        assert_eq!(listed["count"], 1);

        builtins
            .execute(&ws, "lucy_delete_cron", &json!({"slug": "standup"}))
            .await
            .unwrap();
        assert!(ws.read("crons/standup/task.json").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_cron_queues_request() {
        let (builtins, mut rx) = builtins();
        let (_tmp, ws) = workspace();
        builtins
            .execute(
                &ws,
                "lucy_create_cron",
                &json!({
                    "slug": "ping",
                    "title": "Ping",
                    "description": "say hi",
                    "cron_expression": "* * * * *",
                    "type": "agent",
                    "delivery_mode": "log_only",
                }),
            )
            .await
            .unwrap();

        builtins
            .execute(&ws, "lucy_trigger_cron", &json!({"slug": "ping"}))
            .await
            .unwrap();
        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.slug, "ping");
        assert_eq!(trigger.workspace_id, "T1");
    }

    #[tokio::test]
    async fn test_save_skill_writes_frontmatter() {
        let (builtins, _rx) = builtins();
        let (_tmp, ws) = workspace();
        builtins
            .execute(
                &ws,
                "lucy_save_skill",
                &json!({"name": "digest", "description": "Builds the daily digest.", "content": "Steps..."}),
            )
            .await
            .unwrap();

        let content = ws.read("skills/digest/SKILL.md").unwrap().unwrap();
        assert!(content.starts_with("---\nname: digest\n"));
        assert!(content.contains("Steps..."));
    }

    #[tokio::test]
    async fn test_remember_stores_fact() {
        let (builtins, _rx) = builtins();
        let (_tmp, ws) = workspace();
        builtins
            .execute(&ws, "lucy_remember", &json!({"fact": "MRR is $42k", "category": "company"}))
            .await
            .unwrap();
        let facts = memory::read_session_memory(&ws).unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_builtin_errors() {
        let (builtins, _rx) = builtins();
        let (_tmp, ws) = workspace();
        assert!(builtins.execute(&ws, "lucy_nope", &json!({})).await.is_err());
    }
}
