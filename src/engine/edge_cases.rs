// Lucy Engine — Edge-Case Gate
//
// Handles the out-of-band intents that should short-circuit before the
// agent loop: "what are you working on?" (status) and "cancel that"
// (task cancellation), plus the mapping from error kinds to the warm,
// source-blind degradation lines the user sees when everything fails.

use crate::atoms::types::ToolErrorKind;
use crate::engine::humanize::MessagePools;
use crate::engine::tasks::TaskRegistry;
use regex::Regex;
use std::sync::LazyLock;

static STATUS_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:what (?:are you|r u) (?:working on|doing|up to)|(?:are you|r u) (?:busy|available|free|idle)|how(?:'s| is) (?:that|the) (?:going|coming|progressing)|(?:any )?(?:update|progress|status)(?: on)?|(?:still )?(?:working on|processing)|is (?:that|it) (?:done|ready|finished))\b",
    )
    .expect("status pattern regex")
});

static CANCEL_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:cancel|stop|abort|kill) (?:that|it|the (?:task|research|analysis))|nevermind|never\s*mind|(?:don'?t|dont) (?:bother|worry about)|(?:scratch|forget) (?:that|it))\b",
    )
    .expect("cancel pattern regex")
});

/// Is the message asking about current task status?
pub fn is_status_query(message: &str) -> bool {
    STATUS_PATTERNS.is_match(message)
}

/// Is the message asking to cancel in-flight work?
pub fn is_task_cancellation(message: &str) -> bool {
    CANCEL_PATTERNS.is_match(message)
}

/// What the edge gate decided to do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeCaseAction {
    /// Reply with this text, skip the agent loop entirely.
    ShortCircuit(String),
    /// Proceed to the normal pipeline.
    Continue,
}

/// Run the status/cancel short-circuits against the task registry.
pub fn evaluate(
    message: &str,
    workspace_id: &str,
    thread_ref: Option<&str>,
    tasks: &TaskRegistry,
) -> EdgeCaseAction {
    if is_status_query(message) {
        if let Some(status) = tasks.format_status(workspace_id) {
            return EdgeCaseAction::ShortCircuit(format!("Here's what I'm working on:\n{}", status));
        }
        // Nothing active: let the agent answer ("I'm free — what do you need?")
        return EdgeCaseAction::Continue;
    }

    if is_task_cancellation(message) {
        if let Some(description) = tasks.cancel_most_recent(workspace_id, thread_ref) {
            let short = crate::atoms::types::truncate_utf8(&description, 80);
            return EdgeCaseAction::ShortCircuit(format!("Cancelled: *{}*", short));
        }
        return EdgeCaseAction::Continue;
    }

    EdgeCaseAction::Continue
}

// ── Graceful degradation ───────────────────────────────────────────────────

/// Map an error kind to its message-pool category. The user never sees
/// internals — just warm, actionable framing.
pub fn degradation_category(kind: ToolErrorKind) -> &'static str {
    match kind {
        ToolErrorKind::RateLimited => "error_rate_limit",
        ToolErrorKind::ToolTimeout => "error_timeout",
        ToolErrorKind::ServiceUnavailable => "error_connection",
        ToolErrorKind::ContextOverflow => "error_generic",
        _ => "error_generic",
    }
}

/// Classify an arbitrary failure message into a degradation kind.
pub fn classify_error_for_degradation(error_text: &str) -> ToolErrorKind {
    let text = error_text.to_lowercase();
    if text.contains("429") || text.contains("rate limit") {
        return ToolErrorKind::RateLimited;
    }
    if text.contains("timeout") || text.contains("timed out") {
        return ToolErrorKind::ToolTimeout;
    }
    if ["502", "503", "504", "unavailable"].iter().any(|c| text.contains(c)) {
        return ToolErrorKind::ServiceUnavailable;
    }
    if text.contains("context") && (text.contains("length") || text.contains("token")) {
        return ToolErrorKind::ContextOverflow;
    }
    ToolErrorKind::Unknown
}

/// The user-facing degradation line for a failure.
pub fn degradation_message(error_text: &str, pools: &MessagePools) -> String {
    let kind = classify_error_for_degradation(error_text);
    pools.pick(degradation_category(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::TaskState;

    #[test]
    fn test_status_patterns() {
        assert!(is_status_query("what are you working on?"));
        assert!(is_status_query("any update on that?"));
        assert!(is_status_query("is it done yet"));
        assert!(!is_status_query("schedule a meeting"));
    }

    #[test]
    fn test_cancel_patterns() {
        assert!(is_task_cancellation("cancel that"));
        assert!(is_task_cancellation("nevermind"));
        assert!(is_task_cancellation("scratch that please"));
        assert!(!is_task_cancellation("cancel my 3pm meeting"));
    }

    #[test]
    fn test_status_short_circuit_lists_tasks() {
        let tasks = TaskRegistry::new();
        let (id, _) = tasks.create("W1", "crunching the signup numbers", None);
        tasks.set_state(&id, TaskState::Working);

        let action = evaluate("what are you working on?", "W1", None, &tasks);
        match action {
            EdgeCaseAction::ShortCircuit(text) => {
                assert!(text.contains("crunching the signup numbers"));
                assert!(text.contains("working"));
            }
            other => panic!("expected short circuit, got {:?}", other),
        }
    }

    #[test]
    fn test_status_continues_when_idle() {
        let tasks = TaskRegistry::new();
        assert_eq!(
            evaluate("what are you working on?", "W1", None, &tasks),
            EdgeCaseAction::Continue
        );
    }

    #[test]
    fn test_cancel_short_circuit() {
        let tasks = TaskRegistry::new();
        tasks.create("W1", "long research", Some("111.0"));
        let action = evaluate("cancel that", "W1", Some("111.0"), &tasks);
        match action {
            EdgeCaseAction::ShortCircuit(text) => assert!(text.contains("Cancelled")),
            other => panic!("expected short circuit, got {:?}", other),
        }
    }

    #[test]
    fn test_degradation_mapping() {
        assert_eq!(
            classify_error_for_degradation("API error 429: rate limit exceeded"),
            ToolErrorKind::RateLimited
        );
        assert_eq!(
            classify_error_for_degradation("request timed out"),
            ToolErrorKind::ToolTimeout
        );
        assert_eq!(
            classify_error_for_degradation("503 service unavailable"),
            ToolErrorKind::ServiceUnavailable
        );
        assert_eq!(
            classify_error_for_degradation("maximum context length is 128000 tokens"),
            ToolErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_error_for_degradation("weird failure"),
            ToolErrorKind::Unknown
        );
    }

    #[test]
    fn test_degradation_message_nonempty() {
        let pools = MessagePools::new();
        assert!(!degradation_message("429 everywhere", &pools).is_empty());
    }
}
