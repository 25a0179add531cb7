// Lucy Engine — User Preferences
//
// Extracts and persists per-user preferences from conversations, making
// Lucy progressively smarter about individual team members. Stored at
// preferences/{user_id}.json. Explicit statements always beat inferred
// signals; each key remembers where it came from.

use super::WorkspaceStore;
use crate::atoms::error::EngineResult;
use chrono::Utc;
use log::debug;
use serde_json::{json, Map, Value};

const PREFS_DIR: &str = "preferences";

fn prefs_path(user_id: &str) -> String {
    format!("{}/{}.json", PREFS_DIR, user_id)
}

pub fn load_user_preferences(ws: &WorkspaceStore, user_id: &str) -> EngineResult<Map<String, Value>> {
    match ws.read(&prefs_path(user_id))? {
        Some(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Ok(Map::new()),
        },
        None => Ok(Map::new()),
    }
}

pub fn save_user_preferences(
    ws: &WorkspaceStore,
    user_id: &str,
    prefs: &Map<String, Value>,
) -> EngineResult<()> {
    ws.write(
        &prefs_path(user_id),
        &serde_json::to_string_pretty(&Value::Object(prefs.clone()))?,
    )?;
    Ok(())
}

/// Set a single preference key. An explicit statement is never
/// overwritten by an inferred one.
pub fn update_preference(
    ws: &WorkspaceStore,
    user_id: &str,
    key: &str,
    value: Value,
    source: &str,
) -> EngineResult<()> {
    let mut prefs = load_user_preferences(ws, user_id)?;

    let existing_source = prefs
        .get(&format!("_src_{}", key))
        .and_then(|v| v.as_str())
        .unwrap_or("inferred");
    if existing_source == "explicit" && source == "inferred" {
        return Ok(());
    }

    prefs.insert(key.to_string(), value);
    prefs.insert(format!("_src_{}", key), json!(source));
    prefs.insert(format!("_ts_{}", key), json!(Utc::now().to_rfc3339()));
    save_user_preferences(ws, user_id, &prefs)?;
    debug!("[workspace] Preference '{}' updated for {}", key, user_id);
    Ok(())
}

/// Heuristic preference extraction, run after every interaction.
/// Cheap keyword checks only — no model cost.
pub fn extract_preferences_from_message(
    ws: &WorkspaceStore,
    user_id: &str,
    message: &str,
) -> EngineResult<()> {
    let msg = message.to_lowercase();

    // Communication style
    const BRIEF: [&str; 8] = [
        "keep it short", "brief", "tldr", "quick", "one line",
        "don't explain", "no explanation", "just the answer",
    ];
    const DETAILED: [&str; 7] = [
        "detailed", "in depth", "thorough", "explain everything",
        "comprehensive", "step by step", "full breakdown",
    ];
    if BRIEF.iter().any(|s| msg.contains(s)) {
        update_preference(ws, user_id, "response_style", json!("brief"), "explicit")?;
    } else if DETAILED.iter().any(|s| msg.contains(s)) {
        update_preference(ws, user_id, "response_style", json!("detailed"), "explicit")?;
    }

    // Format preferences
    if msg.contains("use bullets") || msg.contains("bullet points") {
        update_preference(ws, user_id, "format", json!("bullets"), "explicit")?;
    } else if msg.contains("use a table") || msg.contains("in a table") {
        update_preference(ws, user_id, "format", json!("table"), "explicit")?;
    } else if msg.contains("in prose") || msg.contains("as paragraphs") {
        update_preference(ws, user_id, "format", json!("prose"), "explicit")?;
    }

    // Notification preference
    if msg.contains("dm me") || msg.contains("in a dm") || msg.contains("send me a dm") {
        update_preference(ws, user_id, "notify_via", json!("dm"), "explicit")?;
    } else if msg.contains("in the channel") || msg.contains("post here") {
        update_preference(ws, user_id, "notify_via", json!("channel"), "explicit")?;
    }

    // Domain interest (inferred from topic)
    const DOMAINS: [(&str, [&str; 4]); 6] = [
        ("seo", ["seo", "search console", "keywords", "backlinks"]),
        ("sales", ["crm", "pipeline", "hubspot", "salesforce"]),
        ("engineering", ["github", "pull request", "deploy", "kubernetes"]),
        ("marketing", ["campaign", "open rate", "mailchimp", "conversion"]),
        ("finance", ["mrr", "arr", "revenue", "stripe"]),
        ("hr", ["hiring", "headcount", "onboarding", "salary"]),
    ];
    let prefs = load_user_preferences(ws, user_id)?;
    let mut interests: Vec<String> = prefs
        .get("domains")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    for (domain, signals) in DOMAINS {
        if signals.iter().any(|s| msg.contains(s)) && !interests.iter().any(|d| d == domain) {
            interests.push(domain.to_string());
            update_preference(ws, user_id, "domains", json!(interests), "inferred")?;
            break;
        }
    }
    Ok(())
}

/// Format stored preferences as a brief prompt injection.
pub fn format_preferences_for_prompt(prefs: &Map<String, Value>) -> String {
    let mut lines = Vec::new();
    if let Some(style) = prefs.get("response_style").and_then(|v| v.as_str()) {
        lines.push(format!("- Prefers {} responses", style));
    }
    if let Some(format) = prefs.get("format").and_then(|v| v.as_str()) {
        lines.push(format!("- Prefers {} format", format));
    }
    if let Some(notify) = prefs.get("notify_via").and_then(|v| v.as_str()) {
        lines.push(format!("- Prefers notifications via {}", notify));
    }
    if let Some(domains) = prefs.get("domains").and_then(|v| v.as_array()) {
        let names: Vec<&str> = domains.iter().filter_map(|v| v.as_str()).take(4).collect();
        if !names.is_empty() {
            lines.push(format!("- Works with: {}", names.join(", ")));
        }
    }
    if lines.is_empty() {
        return String::new();
    }
    format!("Known preferences for this user:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();
        (tmp, ws)
    }

    #[test]
    fn test_explicit_beats_inferred() {
        let (_tmp, ws) = store();
        update_preference(&ws, "U1", "response_style", json!("brief"), "explicit").unwrap();
        update_preference(&ws, "U1", "response_style", json!("detailed"), "inferred").unwrap();

        let prefs = load_user_preferences(&ws, "U1").unwrap();
        assert_eq!(prefs["response_style"], "brief");

        // A later explicit statement still wins.
        update_preference(&ws, "U1", "response_style", json!("detailed"), "explicit").unwrap();
        let prefs = load_user_preferences(&ws, "U1").unwrap();
        assert_eq!(prefs["response_style"], "detailed");
    }

    #[test]
    fn test_extraction_from_message() {
        let (_tmp, ws) = store();
        extract_preferences_from_message(&ws, "U1", "keep it short and dm me the result").unwrap();

        let prefs = load_user_preferences(&ws, "U1").unwrap();
        assert_eq!(prefs["response_style"], "brief");
        assert_eq!(prefs["notify_via"], "dm");
    }

    #[test]
    fn test_domain_inference_accumulates() {
        let (_tmp, ws) = store();
        extract_preferences_from_message(&ws, "U1", "what's our MRR this month?").unwrap();
        extract_preferences_from_message(&ws, "U1", "any open pull request reviews?").unwrap();

        let prefs = load_user_preferences(&ws, "U1").unwrap();
        let domains: Vec<&str> = prefs["domains"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(domains.contains(&"finance"));
        assert!(domains.contains(&"engineering"));
    }

    #[test]
    fn test_prompt_formatting() {
        let (_tmp, ws) = store();
        update_preference(&ws, "U1", "format", json!("bullets"), "explicit").unwrap();
        let prefs = load_user_preferences(&ws, "U1").unwrap();
        let block = format_preferences_for_prompt(&prefs);
        assert!(block.contains("Prefers bullets format"));

        assert!(format_preferences_for_prompt(&Map::new()).is_empty());
    }
}
