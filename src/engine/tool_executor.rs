// Lucy Engine — Tool Executor
//
// Every tool call the model makes goes through here — this is the safety
// enforcement point. Per-call pipeline:
//
//   1. Canonical signature → duplicate suppression (mutating calls only,
//      5s window). Idempotent verbs are never deduplicated.
//   2. Destructive screen → HITL pending + needs_approval observation.
//      Nothing destructive executes without an approval roundtrip.
//   3. Process-wide semaphore + per-class timeout budget + per-service
//      circuit breaker.
//   4. Result truncation before feeding the model.
//   5. Exceptions become structured error observations, never panics:
//      the model sees them and may retry with different parameters.

use crate::atoms::constants::{DEDUP_WINDOW, TOOL_RESULT_MAX_CHARS, TOOL_SEMAPHORE_PERMITS};
use crate::atoms::error::EngineError;
use crate::atoms::types::{
    truncate_utf8, ParsedToolCall, ToolErrorKind, ToolOutcome, ToolStatus,
};
use crate::engine::hitl::{is_destructive_tool_call, DestructivePolicy, HitlRegistry, PendingAction};
use crate::engine::http::BreakerRegistry;
use crate::engine::tools::{budget_for, classify_tool, service_for, ToolSuite};
use crate::engine::workspace::WorkspaceStore;
use futures::future::join_all;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Verbs whose tools are safe to call twice: duplicates are allowed.
const IDEMPOTENT_VERBS: [&str; 8] = [
    "get", "list", "search", "find", "fetch", "read", "check", "query",
];

pub struct ToolExecutor {
    suite: Arc<ToolSuite>,
    hitl: Arc<HitlRegistry>,
    breakers: Arc<BreakerRegistry>,
    semaphore: Arc<Semaphore>,
    recent_signatures: Mutex<HashMap<String, Instant>>,
}

impl ToolExecutor {
    pub fn new(suite: Arc<ToolSuite>, hitl: Arc<HitlRegistry>, breakers: Arc<BreakerRegistry>) -> Self {
        ToolExecutor {
            suite,
            hitl,
            breakers,
            semaphore: Arc::new(Semaphore::new(TOOL_SEMAPHORE_PERMITS)),
            recent_signatures: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one LLM tool-call batch. Calls run in parallel, bounded by
    /// the process-wide semaphore; outcomes come back in call order so the
    /// observation log matches the batch the model issued.
    pub async fn execute_batch(
        &self,
        ws: &WorkspaceStore,
        policy: &DestructivePolicy,
        calls: &[ParsedToolCall],
    ) -> Vec<ToolOutcome> {
        join_all(calls.iter().map(|call| self.execute_one(ws, policy, call))).await
    }

    async fn execute_one(
        &self,
        ws: &WorkspaceStore,
        policy: &DestructivePolicy,
        call: &ParsedToolCall,
    ) -> ToolOutcome {
        // The provider sent arguments that were not valid JSON.
        if call.parse_error.is_some() {
            return error_outcome(
                call,
                ToolErrorKind::InvalidParams,
                "Tool arguments were not valid JSON. Re-issue the call with corrected arguments.",
            );
        }

        // Duplicate suppression for mutating calls.
        if !is_idempotent_tool(&call.name) {
            let signature = canonical_signature(&call.name, &call.parameters);
            if !self.check_and_record(&signature) {
                warn!("[executor] Duplicate mutating call blocked: {}", call.name);
                return error_outcome(
                    call,
                    ToolErrorKind::DuplicateBlocked,
                    "An identical mutating call was just executed. Do not repeat it.",
                );
            }
        }

        // Destructive screen: park the call, ask the human.
        if is_destructive_tool_call(&call.name, policy) {
            let description = describe_call(call);
            let action_id = self.hitl.create(
                &call.name,
                call.parameters.clone(),
                &description,
                ws.workspace_id(),
            );
            let observation = json!({
                "tool": call.name,
                "status": "needs_approval",
                "action_id": action_id,
                "description": description,
                "note": "This action requires user approval. Tell the user what you want to do and wait — do NOT retry the call.",
            });
            return ToolOutcome {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                status: ToolStatus::NeedsApproval,
                output: observation.to_string(),
                error_kind: None,
            };
        }

        self.run_guarded(ws, call).await
    }

    /// Execute a previously-approved destructive action, with the same
    /// timeout/breaker/semaphore guards but no re-screening.
    pub async fn execute_approved(&self, ws: &WorkspaceStore, action: &PendingAction) -> ToolOutcome {
        let call = ParsedToolCall {
            id: format!("hitl_{}", action.action_id),
            name: action.tool_name.clone(),
            parameters: action.parameters.clone(),
            parse_error: None,
        };
        self.run_guarded(ws, &call).await
    }

    /// Semaphore + class timeout + circuit breaker around the raw call.
    async fn run_guarded(&self, ws: &WorkspaceStore, call: &ParsedToolCall) -> ToolOutcome {
        let service = service_for(&call.name);
        let breaker = self.breakers.for_service(&service);
        if !breaker.should_allow_request() {
            return error_outcome(
                call,
                ToolErrorKind::ServiceUnavailable,
                &format!("The {} service is temporarily unavailable (circuit open). Try a different approach.", service),
            );
        }

        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return error_outcome(call, ToolErrorKind::Fatal, "Tool semaphore closed");
            }
        };

        let class = classify_tool(&call.name);
        let budget = budget_for(class);
        let started = Instant::now();

        let result = tokio::time::timeout(
            budget,
            self.suite.execute_raw(ws, &call.name, &call.parameters),
        )
        .await;

        match result {
            Err(_) => {
                breaker.record_failure();
                warn!(
                    "[executor] {} timed out after {}s",
                    call.name,
                    budget.as_secs()
                );
                error_outcome(
                    call,
                    ToolErrorKind::ToolTimeout,
                    &format!(
                        "Tool call timed out after {}s. The external service may be slow. Please try again.",
                        budget.as_secs()
                    ),
                )
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                let kind = classify_tool_error(&e);
                error_outcome(call, kind, &e.to_string())
            }
            Ok(Ok(value)) => {
                breaker.record_success();
                info!(
                    "[executor] {} ok in {}ms",
                    call.name,
                    started.elapsed().as_millis()
                );
                ToolOutcome {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    status: ToolStatus::Ok,
                    output: truncate_result(&render_result(&value)),
                    error_kind: None,
                }
            }
        }
    }

    /// Atomically check the dedup window and record the signature.
    /// Returns false when an identical mutating signature is still live.
    fn check_and_record(&self, signature: &str) -> bool {
        let mut recent = self.recent_signatures.lock();
        recent.retain(|_, at| at.elapsed() <= DEDUP_WINDOW);
        if recent.contains_key(signature) {
            return false;
        }
        recent.insert(signature.to_string(), Instant::now());
        true
    }
}

// ── Signatures & idempotency ───────────────────────────────────────────────

/// Canonical call signature: tool name + JSON with recursively sorted
/// keys. Invariant under parameter key order.
pub fn canonical_signature(name: &str, parameters: &Value) -> String {
    format!("{}:{}", name, canonical_json(parameters))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Tools whose names carry an idempotent verb are safe to repeat.
pub fn is_idempotent_tool(name: &str) -> bool {
    let lower = name.to_lowercase();
    IDEMPOTENT_VERBS.iter().any(|verb| lower.contains(verb))
}

// ── Error classification ───────────────────────────────────────────────────

/// Map a tool failure to the error kind the model observes.
pub fn classify_tool_error(error: &EngineError) -> ToolErrorKind {
    let text = error.to_string().to_lowercase();
    if text.contains("429") || text.contains("rate limit") {
        return ToolErrorKind::RateLimited;
    }
    if text.contains("401")
        || text.contains("403")
        || text.contains("permission")
        || text.contains("unauthorized")
        || text.contains("forbidden")
    {
        return ToolErrorKind::AuthError;
    }
    if text.contains("400") || text.contains("validation") || text.contains("invalid") || text.contains("missing '") {
        return ToolErrorKind::InvalidParams;
    }
    if text.contains("500")
        || text.contains("502")
        || text.contains("503")
        || text.contains("504")
        || text.contains("connection")
        || text.contains("network error")
        || text.contains("timed out")
    {
        return ToolErrorKind::Retryable;
    }
    ToolErrorKind::Fatal
}

// ── Rendering ──────────────────────────────────────────────────────────────

fn render_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cap a result's string form so a huge payload can't blow the context.
pub fn truncate_result(text: &str) -> String {
    if text.len() <= TOOL_RESULT_MAX_CHARS {
        return text.to_string();
    }
    format!(
        "{}\n[TRUNCATED: showing first {} of {} chars]",
        truncate_utf8(text, TOOL_RESULT_MAX_CHARS),
        TOOL_RESULT_MAX_CHARS,
        text.len()
    )
}

fn error_outcome(call: &ParsedToolCall, kind: ToolErrorKind, message: &str) -> ToolOutcome {
    let observation = json!({
        "tool": call.name,
        "status": "error",
        "error_type": kind.as_str(),
        "error": message,
    });
    ToolOutcome {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        status: ToolStatus::Error,
        output: observation.to_string(),
        error_kind: Some(kind),
    }
}

fn describe_call(call: &ParsedToolCall) -> String {
    let params = canonical_json(&call.parameters);
    format!(
        "{} with {}",
        call.name,
        truncate_utf8(&params, 200)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_invariant_under_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(
            canonical_signature("TOOL_CREATE", &a),
            canonical_signature("TOOL_CREATE", &b)
        );
    }

    #[test]
    fn test_signature_differs_on_parameters() {
        let a = json!({"id": 1});
        let b = json!({"id": 2});
        assert_ne!(
            canonical_signature("TOOL_CREATE", &a),
            canonical_signature("TOOL_CREATE", &b)
        );
    }

    #[test]
    fn test_idempotent_classification() {
        assert!(is_idempotent_tool("GOOGLECALENDAR_EVENTS_LIST"));
        assert!(is_idempotent_tool("GMAIL_FETCH_EMAILS"));
        assert!(is_idempotent_tool("lucy_web_search"));
        assert!(!is_idempotent_tool("GMAIL_SEND_EMAIL"));
        assert!(!is_idempotent_tool("lucy_create_cron"));
    }

    #[test]
    fn test_truncation_marker() {
        let long = "y".repeat(TOOL_RESULT_MAX_CHARS + 100);
        let truncated = truncate_result(&long);
        assert!(truncated.contains("[TRUNCATED: showing first"));

        let short = "fine";
        assert_eq!(truncate_result(short), "fine");
    }

    #[test]
    fn test_error_classification() {
        let rate = EngineError::tool("t", "API error 429: slow down");
        assert_eq!(classify_tool_error(&rate), ToolErrorKind::RateLimited);

        let auth = EngineError::tool("t", "API error 401: bad key");
        assert_eq!(classify_tool_error(&auth), ToolErrorKind::AuthError);

        let invalid = EngineError::tool("t", "validation failed on field 'x'");
        assert_eq!(classify_tool_error(&invalid), ToolErrorKind::InvalidParams);

        let retryable = EngineError::tool("t", "API error 503: unavailable");
        assert_eq!(classify_tool_error(&retryable), ToolErrorKind::Retryable);

        let fatal = EngineError::tool("t", "schema mismatch in response");
        assert_eq!(classify_tool_error(&fatal), ToolErrorKind::Fatal);
    }
}
