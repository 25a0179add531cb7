// Lucy Engine — Human-in-the-Loop Registry
//
// Destructive tool calls are never executed silently. The executor parks
// them here as pending actions and replies with an approval prompt; the
// action runs only when the user approves it, and pending entries expire
// after a TTL. Resolution is exactly-once: whichever of approve/cancel
// lands first pops the entry, the other sees nothing.

use crate::atoms::constants::HITL_PENDING_TTL;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub action_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub description: String,
    pub workspace_id: String,
    pub created_at: Instant,
}

pub struct HitlRegistry {
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl Default for HitlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HitlRegistry {
    pub fn new() -> Self {
        HitlRegistry {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Store a pending action and return its opaque id.
    pub fn create(
        &self,
        tool_name: &str,
        parameters: Value,
        description: &str,
        workspace_id: &str,
    ) -> String {
        let action_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut map = self.pending.lock();
        Self::cleanup_expired(&mut map);
        map.insert(
            action_id.clone(),
            PendingAction {
                action_id: action_id.clone(),
                tool_name: tool_name.to_string(),
                parameters,
                description: description.to_string(),
                workspace_id: workspace_id.to_string(),
                created_at: Instant::now(),
            },
        );
        info!(
            "[hitl] Pending action {} for tool {} ({})",
            action_id, tool_name, workspace_id
        );
        action_id
    }

    /// Resolve a pending action. Returns the record only when it existed,
    /// had not expired, and was approved. A second resolution of the same
    /// id returns None.
    pub fn resolve(&self, action_id: &str, approved: bool) -> Option<PendingAction> {
        let mut map = self.pending.lock();
        Self::cleanup_expired(&mut map);
        let action = map.remove(action_id);

        match (&action, approved) {
            (None, _) => {
                warn!("[hitl] Action {} not found or expired", action_id);
                None
            }
            (Some(_), true) => {
                info!("[hitl] Action {} approved", action_id);
                action
            }
            (Some(_), false) => {
                info!("[hitl] Action {} cancelled", action_id);
                None
            }
        }
    }

    /// Peek without resolving. Expired entries are inaccessible.
    pub fn get(&self, action_id: &str) -> Option<PendingAction> {
        let mut map = self.pending.lock();
        Self::cleanup_expired(&mut map);
        map.get(action_id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        let mut map = self.pending.lock();
        Self::cleanup_expired(&mut map);
        map.len()
    }

    /// Pending actions for one workspace, oldest first. Drives the
    /// approval UI's "waiting on you" listing.
    pub fn pending_for_workspace(&self, workspace_id: &str) -> Vec<PendingAction> {
        let mut map = self.pending.lock();
        Self::cleanup_expired(&mut map);
        let mut actions: Vec<PendingAction> = map
            .values()
            .filter(|a| a.workspace_id == workspace_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        actions
    }

    fn cleanup_expired(map: &mut HashMap<String, PendingAction>) {
        map.retain(|_, action| action.created_at.elapsed() <= HITL_PENDING_TTL);
    }
}

// ── Destructive-action screening ───────────────────────────────────────────
//
// Verb tokens, not substrings of the whole name: GET_SENDER_INFO must not
// trip on SEND. The deny list can be extended and the allow list can carve
// out exceptions per workspace; the runtime never performs a destructive
// operation silently regardless of classification.

const DESTRUCTIVE_VERBS: [&str; 9] = [
    "DELETE",
    "REMOVE",
    "CANCEL",
    "SEND",
    "FORWARD",
    "ARCHIVE",
    "DESTROY",
    "REVOKE",
    "UNSUBSCRIBE",
];

/// Per-workspace overrides for the destructive screen.
#[derive(Debug, Clone, Default)]
pub struct DestructivePolicy {
    /// Extra verb tokens to treat as destructive.
    pub deny_verbs: Vec<String>,
    /// Exact tool names exempted from gating.
    pub allow_tools: Vec<String>,
}

/// Check whether a tool call needs approval before execution.
pub fn is_destructive_tool_call(tool_name: &str, policy: &DestructivePolicy) -> bool {
    if policy.allow_tools.iter().any(|t| t == tool_name) {
        return false;
    }
    let upper = tool_name.to_uppercase();
    let tokens: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    tokens.iter().any(|token| {
        DESTRUCTIVE_VERBS.contains(token)
            || policy.deny_verbs.iter().any(|v| v.eq_ignore_ascii_case(token))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_destructive_detection() {
        let policy = DestructivePolicy::default();
        assert!(is_destructive_tool_call("GMAIL_SEND_EMAIL", &policy));
        assert!(is_destructive_tool_call("lucy_delete_cron", &policy));
        assert!(is_destructive_tool_call("GOOGLECALENDAR_EVENT_CANCEL", &policy));
        assert!(!is_destructive_tool_call("GMAIL_FETCH_EMAILS", &policy));
        assert!(!is_destructive_tool_call("GOOGLECALENDAR_EVENTS_LIST", &policy));
    }

    #[test]
    fn test_verb_tokens_not_substrings() {
        let policy = DestructivePolicy::default();
        // "SENDER" contains SEND as a substring but is not the SEND verb.
        assert!(!is_destructive_tool_call("GMAIL_GET_SENDER_INFO", &policy));
    }

    #[test]
    fn test_policy_overrides() {
        let policy = DestructivePolicy {
            deny_verbs: vec!["merge".into()],
            allow_tools: vec!["SLACK_SEND_MESSAGE".into()],
        };
        assert!(is_destructive_tool_call("GITHUB_MERGE_PR", &policy));
        assert!(!is_destructive_tool_call("SLACK_SEND_MESSAGE", &policy));
    }

    #[test]
    fn test_exactly_once_resolution() {
        let registry = HitlRegistry::new();
        let id = registry.create("GMAIL_SEND_EMAIL", json!({"to": "a@b.c"}), "send an email", "W1");

        let first = registry.resolve(&id, true);
        assert!(first.is_some());
        assert_eq!(first.unwrap().tool_name, "GMAIL_SEND_EMAIL");

        assert!(registry.resolve(&id, true).is_none());
        assert!(registry.resolve(&id, false).is_none());
    }

    #[test]
    fn test_cancel_returns_none_and_consumes() {
        let registry = HitlRegistry::new();
        let id = registry.create("GMAIL_SEND_EMAIL", json!({}), "send", "W1");
        assert!(registry.resolve(&id, false).is_none());
        assert!(registry.resolve(&id, true).is_none());
    }

    #[test]
    fn test_unknown_id() {
        let registry = HitlRegistry::new();
        assert!(registry.resolve("nope", true).is_none());
        assert!(registry.get("nope").is_none());
    }
}
