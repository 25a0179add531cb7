// Lucy Engine — Configuration
// All values come from environment variables prefixed with LUCY_, with
// credentials optionally merged from keys.json. Environment wins.
// Loaded once at startup into an immutable Settings value that the
// composition root injects everywhere — nothing re-reads the environment
// during request handling.

use crate::atoms::error::EngineResult;
use log::{info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Settings {
    // ── Slack ──
    pub slack_bot_token: String,
    pub slack_app_token: String,
    pub slack_signing_secret: String,

    // ── Model router (OpenAI-compatible /chat/completions) ──
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,

    // ── Meta-integration broker ──
    pub broker_api_key: String,
    pub broker_base_url: String,

    // ── Remote exec / file-ops gateway ──
    pub gateway_base_url: String,
    pub gateway_token: String,

    // ── Filesystem ──
    pub workspace_root: PathBuf,
    pub assets_dir: PathBuf,

    // ── Application ──
    pub log_level: String,
    pub http_port: u16,
}

impl Settings {
    /// Load settings from the environment, falling back to keys.json for
    /// credentials that are not set. Paths are made absolute.
    pub fn load() -> EngineResult<Settings> {
        let keys = load_keys_json();

        let workspace_root = env_or("LUCY_WORKSPACE_ROOT", "")
            .map(PathBuf::from)
            .unwrap_or_else(default_workspace_root);
        let assets_dir = env_or("LUCY_ASSETS_DIR", "")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));

        let mut settings = Settings {
            slack_bot_token: env_var("LUCY_SLACK_BOT_TOKEN"),
            slack_app_token: env_var("LUCY_SLACK_APP_TOKEN"),
            slack_signing_secret: env_var("LUCY_SLACK_SIGNING_SECRET"),
            openrouter_api_key: env_var("LUCY_OPENROUTER_API_KEY"),
            openrouter_base_url: env_var_default(
                "LUCY_OPENROUTER_BASE_URL",
                "https://openrouter.ai/api/v1",
            ),
            broker_api_key: env_var("LUCY_BROKER_API_KEY"),
            broker_base_url: env_var_default("LUCY_BROKER_BASE_URL", "https://backend.composio.dev"),
            gateway_base_url: env_var("LUCY_GATEWAY_BASE_URL"),
            gateway_token: env_var("LUCY_GATEWAY_TOKEN"),
            workspace_root,
            assets_dir,
            log_level: env_var_default("LUCY_LOG_LEVEL", "info"),
            http_port: env_var_default("LUCY_HTTP_PORT", "3000")
                .parse()
                .unwrap_or(3000),
        };

        settings.merge_keys(&keys);

        if settings.slack_bot_token.is_empty() {
            warn!("[config] LUCY_SLACK_BOT_TOKEN is not set — Slack posting disabled");
        }

        info!(
            "[config] Loaded settings (workspace_root={}, router={})",
            settings.workspace_root.display(),
            settings.openrouter_base_url,
        );
        Ok(settings)
    }

    /// Fill credentials from keys.json where the environment left gaps.
    fn merge_keys(&mut self, keys: &Value) {
        merge(&mut self.slack_bot_token, keys, &["slack", "bot_token"]);
        merge(&mut self.slack_app_token, keys, &["slack", "app_token"]);
        merge(&mut self.slack_signing_secret, keys, &["slack", "signing_secret"]);
        merge(&mut self.openrouter_api_key, keys, &["openrouter", "api_key"]);
        merge(&mut self.broker_api_key, keys, &["broker", "api_key"]);
        merge(&mut self.gateway_token, keys, &["gateway", "token"]);
        if self.gateway_base_url.is_empty() {
            merge(&mut self.gateway_base_url, keys, &["gateway", "base_url"]);
        }
    }
}

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_var_default(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_or(name: &str, default: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ if !default.is_empty() => Some(default.to_string()),
        _ => None,
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lucy")
        .join("workspaces")
}

/// keys.json lives next to the binary or in the current directory.
/// Missing or malformed files are treated as empty.
fn load_keys_json() -> Value {
    for candidate in [Path::new("keys.json"), Path::new("../keys.json")] {
        if candidate.is_file() {
            match std::fs::read_to_string(candidate) {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(v) => return v,
                    Err(e) => warn!("[config] keys.json is not valid JSON: {}", e),
                },
                Err(e) => warn!("[config] Could not read keys.json: {}", e),
            }
        }
    }
    Value::Null
}

fn merge(target: &mut String, keys: &Value, path: &[&str]) {
    if !target.is_empty() {
        return;
    }
    let mut node = keys;
    for key in path {
        node = &node[*key];
    }
    if let Some(s) = node.as_str() {
        *target = s.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_env_precedence() {
        let keys: Value = serde_json::from_str(r#"{"slack": {"bot_token": "from-file"}}"#).unwrap();
        let mut already_set = "from-env".to_string();
        merge(&mut already_set, &keys, &["slack", "bot_token"]);
        assert_eq!(already_set, "from-env");

        let mut empty = String::new();
        merge(&mut empty, &keys, &["slack", "bot_token"]);
        assert_eq!(empty, "from-file");
    }

    #[test]
    fn test_merge_missing_path_is_noop() {
        let keys = Value::Null;
        let mut target = String::new();
        merge(&mut target, &keys, &["nope", "nothing"]);
        assert!(target.is_empty());
    }
}
