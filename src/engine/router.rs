// Lucy Engine — Model Router
//
// Maps a tier to a model chain and dispatches /chat/completions requests
// with fallback. Every request gets a system preamble: the soul text plus a
// current-time block so the model constructs concrete RFC3339 timestamps
// for tools like calendars instead of template variables.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    Message, ModelTier, ParsedToolCall, RouterResponse, TokenUsage, ToolDefinition,
};
use crate::engine::providers::{ChatProvider, ProviderError};
use chrono::{Duration as ChronoDuration, FixedOffset, Timelike, Utc};
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

// ── Tier configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub tier: ModelTier,
    pub primary_model: &'static str,
    pub fallback_models: &'static [&'static str],
    pub max_tokens: u32,
}

/// Model chains per tier. Higher tiers are slower and more capable.
pub fn tier_config(tier: ModelTier) -> TierConfig {
    match tier {
        ModelTier::Fast => TierConfig {
            tier,
            primary_model: "google/gemini-2.5-flash",
            fallback_models: &["openai/gpt-4o-mini"],
            max_tokens: 4096,
        },
        ModelTier::Default => TierConfig {
            tier,
            primary_model: "openai/gpt-4o-mini",
            fallback_models: &["moonshotai/kimi-k2.5", "openai/gpt-4o"],
            max_tokens: 8192,
        },
        ModelTier::Code => TierConfig {
            tier,
            primary_model: "anthropic/claude-3.5-sonnet",
            fallback_models: &["openai/gpt-4o"],
            max_tokens: 8192,
        },
        ModelTier::Research => TierConfig {
            tier,
            primary_model: "anthropic/claude-3.5-sonnet",
            fallback_models: &["anthropic/claude-3-opus", "openai/gpt-4o"],
            max_tokens: 8192,
        },
        ModelTier::Document => TierConfig {
            tier,
            primary_model: "openai/gpt-4o",
            fallback_models: &["anthropic/claude-3.5-sonnet"],
            max_tokens: 8192,
        },
        ModelTier::Frontier => TierConfig {
            tier,
            primary_model: "anthropic/claude-3-opus",
            fallback_models: &["anthropic/claude-3.5-sonnet", "openai/gpt-4o"],
            max_tokens: 8192,
        },
    }
}

// ── Route options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// User-local offset from UTC in hours. Defaults to IST.
    pub tz_offset_hours: Option<f64>,
    pub tz_label: Option<String>,
    pub workspace_id: Option<String>,
    pub task_id: Option<String>,
}

// ── Router ─────────────────────────────────────────────────────────────────

pub struct ModelRouter {
    provider: Arc<dyn ChatProvider>,
    assets_dir: PathBuf,
    workspace_root: PathBuf,
}

impl ModelRouter {
    pub fn new(provider: Arc<dyn ChatProvider>, assets_dir: PathBuf, workspace_root: PathBuf) -> Self {
        ModelRouter {
            provider,
            assets_dir,
            workspace_root,
        }
    }

    /// Dispatch a request to the tier's model chain. The first model to
    /// answer wins; when every model fails the caller gets
    /// `model_unavailable` and degrades gracefully.
    pub async fn route(
        &self,
        messages: &[Message],
        tier: ModelTier,
        opts: &RouteOptions,
    ) -> EngineResult<RouterResponse> {
        let config = tier_config(tier);
        let system = Message::system(self.system_preamble(opts));

        let mut final_messages = Vec::with_capacity(messages.len() + 1);
        final_messages.push(system);
        final_messages.extend_from_slice(messages);

        let max_tokens = opts.max_tokens.unwrap_or(config.max_tokens);
        let temperature = opts.temperature.unwrap_or(0.7);

        let mut models = vec![config.primary_model];
        models.extend_from_slice(config.fallback_models);

        let mut last_error: Option<ProviderError> = None;
        for model in models {
            match self
                .provider
                .chat(model, &final_messages, &opts.tools, max_tokens, temperature)
                .await
            {
                Ok(reply) => {
                    if let (Some(ws), Some(usage)) = (&opts.workspace_id, reply.usage) {
                        self.spawn_cost_log(ws, opts.task_id.clone(), &reply.model, usage);
                    }
                    let tool_calls = parse_tool_calls(&reply.tool_calls);
                    return Ok(RouterResponse {
                        content: reply.content,
                        tool_calls,
                        usage: reply.usage,
                        model: if reply.model.is_empty() {
                            model.to_string()
                        } else {
                            reply.model
                        },
                    });
                }
                Err(e) => {
                    warn!("[router] Model {} failed: {}", model, e);
                    let stop = !e.is_fallback_worthy();
                    last_error = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        Err(EngineError::ModelUnavailable {
            tier: tier.as_str().to_string(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no models configured".into()),
        })
    }

    /// System preamble: soul + current-time context + tool-calling rules.
    fn system_preamble(&self, opts: &RouteOptions) -> String {
        let soul = self.load_soul();
        let tz_offset = opts.tz_offset_hours.unwrap_or(5.5);
        let tz_label = opts
            .tz_label
            .as_deref()
            .unwrap_or("Asia/Kolkata (IST, UTC+5:30)");
        format!("{}{}", soul, time_context_block(tz_offset, tz_label))
    }

    /// The persona file is re-read on every call — edits take effect
    /// without a restart.
    fn load_soul(&self) -> String {
        let path = self.assets_dir.join("SOUL.md");
        std::fs::read_to_string(path).unwrap_or_else(|_| {
            "You are Lucy, an AI coworker. Direct, helpful, gets things done. \
             Lives in Slack with access to tools and integrations."
                .to_string()
        })
    }

    /// Append one JSON line to the workspace's cost log, off the hot path.
    fn spawn_cost_log(&self, workspace_id: &str, task_id: Option<String>, model: &str, usage: TokenUsage) {
        let path = self
            .workspace_root
            .join(workspace_id)
            .join("logs")
            .join("costs.jsonl");
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "task_id": task_id,
            "model": model,
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        });
        info!(
            "[router] Cost: model={} prompt={} completion={}",
            model, usage.prompt_tokens, usage.completion_tokens
        );
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                let _ = writeln!(f, "{}", record);
            }
        });
    }
}

// ── Time context ───────────────────────────────────────────────────────────

/// The current-time block injected into every system prompt. Gives the
/// model concrete RFC3339 windows for "today" and "tomorrow" in the user's
/// timezone so calendar parameters come out right on the first try.
pub fn time_context_block(tz_offset_hours: f64, tz_label: &str) -> String {
    let offset_secs = (tz_offset_hours * 3600.0).round() as i32;
    let offset = FixedOffset::east_opt(offset_secs)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("UTC offset"));

    let now_utc = Utc::now();
    let now_local = now_utc.with_timezone(&offset);
    let today_start = now_local
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now_local);
    let today_end = today_start + ChronoDuration::days(1);
    let tomorrow_end = today_end + ChronoDuration::days(1);

    format!(
        "\n\n## Current Context\n\
         - Current UTC time: {}\n\
         - User's timezone: {}\n\
         - User's local time: {}\n\
         - Today (local): {}\n\
         - Today start (RFC3339): {}\n\
         - Today end (RFC3339): {}\n\
         - Tomorrow start (RFC3339): {}\n\
         - Tomorrow end (RFC3339): {}\n\
         \n## Tool Calling Rules\n\
         - When calling calendar tools for 'today', use time_min={} and time_max={}\n\
         - When calling calendar tools for 'tomorrow', use time_min={} and time_max={}\n\
         - ALWAYS use concrete RFC3339 timestamps — NEVER use template variables like {{{{current_date_time.start}}}}\n\
         - For calendar_id, use 'primary' unless told otherwise\n\
         - If a tool returns data, use it and move on — do NOT call the same tool again with the same parameters\n\
         - You HAVE access to all tools listed in your tool definitions — never claim you don't have access to a tool that is available to you",
        now_utc.format("%Y-%m-%dT%H:%M:%SZ"),
        tz_label,
        now_local.format("%Y-%m-%d %H:%M:%S %z"),
        now_local.format("%A, %B %d, %Y"),
        today_start.to_rfc3339(),
        today_end.to_rfc3339(),
        today_end.to_rfc3339(),
        tomorrow_end.to_rfc3339(),
        today_start.to_rfc3339(),
        today_end.to_rfc3339(),
        today_end.to_rfc3339(),
        tomorrow_end.to_rfc3339(),
    )
}

// ── Tool-call argument parsing ─────────────────────────────────────────────

/// Parse wire tool calls into structured calls. Arguments arrive as a JSON
/// string; when it doesn't parse, the call is kept with empty parameters
/// and a parse_error marker so the model can correct itself.
pub fn parse_tool_calls(raw: &[crate::atoms::types::ToolCall]) -> Vec<ParsedToolCall> {
    raw.iter()
        .map(|tc| {
            let (parameters, parse_error) =
                match serde_json::from_str::<serde_json::Value>(&tc.function.arguments) {
                    Ok(v) if v.is_object() => (v, None),
                    Ok(_) | Err(_) => (json!({}), Some("invalid_json_arguments".to_string())),
                };
            ParsedToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                parameters,
                parse_error,
            }
        })
        .collect()
}
