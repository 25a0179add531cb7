// ── Lucy Atoms: Pure Data Types ────────────────────────────────────────────
// All plain struct/enum definitions that flow through the engine.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};

// ── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// A tool-result message tied back to the call that produced it.
    pub fn tool_result(call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
            name: Some(tool_name.to_string()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ── Tool calling (OpenAI-compatible wire shapes) ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the provider returned them.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A tool call after the router has parsed its argument string.
/// `parse_error` is set (and `parameters` emptied) when the provider
/// returned arguments that were not valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

// ── Token usage (provider contract shape) ──────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// The router's view of one completed model call.
#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub content: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

impl RouterResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ── Model tiers & intent classification ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Default,
    Code,
    Research,
    Document,
    Frontier,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Default => "default",
            ModelTier::Code => "code",
            ModelTier::Research => "research",
            ModelTier::Document => "document",
            ModelTier::Frontier => "frontier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Chat,
    Lookup,
    Confirmation,
    Followup,
    ToolUse,
    Command,
    Code,
    Reasoning,
    Document,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Chat => "chat",
            Intent::Lookup => "lookup",
            Intent::Confirmation => "confirmation",
            Intent::Followup => "followup",
            Intent::ToolUse => "tool_use",
            Intent::Command => "command",
            Intent::Code => "code",
            Intent::Reasoning => "reasoning",
            Intent::Document => "document",
        }
    }
}

/// The result of tier classification. Deterministic: same input, same output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub tier: ModelTier,
    pub intent: Intent,
}

// ── Tool execution outcomes ────────────────────────────────────────────────

/// Latency budget class for a tool, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    MetaBroker,
    Integration,
    LlmCall,
    Default,
}

/// Error kinds surfaced inside tool observations. These are the strings
/// the model (and the degradation layer) sees in `error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    DuplicateBlocked,
    ServiceUnavailable,
    ToolTimeout,
    RateLimited,
    AuthError,
    InvalidParams,
    Retryable,
    ContextOverflow,
    Fatal,
    Unknown,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::DuplicateBlocked => "duplicate_blocked",
            ToolErrorKind::ServiceUnavailable => "service_unavailable",
            ToolErrorKind::ToolTimeout => "tool_timeout",
            ToolErrorKind::RateLimited => "rate_limited",
            ToolErrorKind::AuthError => "auth_error",
            ToolErrorKind::InvalidParams => "invalid_params",
            ToolErrorKind::Retryable => "retryable",
            ToolErrorKind::ContextOverflow => "context_overflow",
            ToolErrorKind::Fatal => "fatal",
            ToolErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Ok,
    Error,
    NeedsApproval,
}

/// What the executor hands back to the agent loop for one tool call.
/// `output` is already rendered (truncated result text, or the serialized
/// error/approval observation JSON).
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
    pub error_kind: Option<ToolErrorKind>,
}

// ── Chat platform surface (observable record types, mapped at boundary) ────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub team_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub text: String,
}

impl ChatEvent {
    /// Thread anchor for replies: the thread root if present, else this ts.
    pub fn thread_ref(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }

    pub fn thread_depth(&self) -> usize {
        if self.thread_ts.is_some() { 1 } else { 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPost {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
}

impl ChatPost {
    pub fn text(channel: &str, text: impl Into<String>) -> Self {
        ChatPost {
            channel: channel.into(),
            text: Some(text.into()),
            blocks: None,
            thread_ts: None,
        }
    }

    pub fn in_thread(mut self, thread_ts: impl Into<String>) -> Self {
        self.thread_ts = Some(thread_ts.into());
        self
    }
}

// ── Task run records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Acknowledged,
    Working,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Acknowledged | TaskState::Working)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Acknowledged => "acknowledged",
            TaskState::Working => "working",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

// ── Workspace data shapes ──────────────────────────────────────────────────

/// One bounded session-memory item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFact {
    pub fact: String,
    pub source: String,
    pub category: String,
    pub ts: String,
}

/// Parsed metadata from a SKILL.md file.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    /// Relative path within the workspace, e.g. "skills/browser/SKILL.md".
    pub path: String,
}

/// Snapshot payload persisted at data/{category}/YYYY-MM-DD.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub category: String,
    pub captured_at: String,
    pub data: serde_json::Value,
}

// ── Cron definitions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronType {
    Script,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Channel,
    Dm,
    LogOnly,
}

/// Predicate applied to the dependency's execution log before firing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsOnPredicate {
    /// The most recent run must have been delivered.
    #[default]
    LastDelivered,
    /// Any delivered run today (UTC) satisfies the dependency.
    AnySuccessToday,
}

/// Stored at crons/{slug}/task.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronDefinition {
    pub path: String,
    pub cron_expression: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub cron_type: CronType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_script_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub depends_on_predicate: DependsOnPredicate,
    pub delivery_mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_channel: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub max_runs: u32,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requesting_user_id: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
        assert_eq!(truncate_utf8("hi", 5), "hi");
    }

    #[test]
    fn test_truncate_utf8_multibyte_boundary() {
        let s = "héllo";
        // 'é' is 2 bytes starting at index 1; cutting at 2 must back up.
        assert_eq!(truncate_utf8(s, 2), "h");
        assert_eq!(truncate_utf8(s, 3), "hé");
    }

    #[test]
    fn test_thread_ref_prefers_thread_ts() {
        let ev = ChatEvent {
            team_id: "T1".into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            ts: "2.0".into(),
            thread_ts: Some("1.0".into()),
            text: "hi".into(),
        };
        assert_eq!(ev.thread_ref(), "1.0");
        assert_eq!(ev.thread_depth(), 1);
    }

    #[test]
    fn test_cron_definition_round_trip() {
        let def = CronDefinition {
            path: "crons/standup".into(),
            cron_expression: "0 9 * * 1-5".into(),
            title: "Standup reminder".into(),
            description: "Post the standup prompt".into(),
            cron_type: CronType::Agent,
            condition_script_path: None,
            depends_on: None,
            depends_on_predicate: DependsOnPredicate::LastDelivered,
            delivery_mode: DeliveryMode::Channel,
            delivery_channel: Some("C123".into()),
            max_retries: 2,
            max_runs: 0,
            notify_on_failure: true,
            requesting_user_id: None,
            timezone: "Asia/Kolkata".into(),
        };
        let json = serde_json::to_string(&def).unwrap();
        let back: CronDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.title, def.title);
        assert_eq!(back.cron_type, CronType::Agent);
        assert_eq!(back.delivery_mode, DeliveryMode::Channel);
        assert_eq!(back.timezone, "Asia/Kolkata");
    }

    #[test]
    fn test_cron_definition_defaults() {
        // Older task.json files omit the newer optional fields.
        let json = r#"{
            "path": "crons/report",
            "cron_expression": "0 8 * * *",
            "title": "Report",
            "description": "Daily report",
            "type": "script",
            "delivery_mode": "log_only"
        }"#;
        let def: CronDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.max_retries, 0);
        assert_eq!(def.max_runs, 0);
        assert!(!def.notify_on_failure);
        assert_eq!(def.timezone, "UTC");
        assert_eq!(def.depends_on_predicate, DependsOnPredicate::LastDelivered);
    }
}
