// Lucy Engine — Activity Log
//
// Appends timestamped entries to logs/YYYY-MM-DD.md so crons (heartbeat,
// monitors) can read what Lucy did recently. Append-only per UTC date.

use super::WorkspaceStore;
use crate::atoms::error::EngineResult;
use chrono::{Duration, Utc};
use serde_json::json;

/// Append a timestamped entry to today's log file.
pub fn log_activity(ws: &WorkspaceStore, message: &str) -> EngineResult<()> {
    let now = Utc::now();
    let date_str = now.format("%Y-%m-%d");
    let log_path = format!("logs/{}.md", date_str);

    if ws.read(&log_path)?.is_none() {
        ws.write(&log_path, &format!("# Activity Log — {}\n\n", date_str))?;
    }

    ws.append(
        &log_path,
        &format!("- **{} UTC** — {}\n", now.format("%H:%M:%S"), message),
    )?;
    Ok(())
}

/// Read the most recent activity log(s), newest day first.
pub fn get_recent_activity(ws: &WorkspaceStore, days: i64) -> EngineResult<String> {
    let now = Utc::now();
    let mut sections = Vec::new();
    for offset in 0..days {
        let date = now - Duration::days(offset);
        if let Some(content) = ws.read(&format!("logs/{}.md", date.format("%Y-%m-%d")))? {
            sections.push(content);
        }
    }
    if sections.is_empty() {
        return Ok("(No recent activity)".to_string());
    }
    Ok(sections.join("\n"))
}

/// Record that a heartbeat just ran.
pub fn set_last_heartbeat_time(ws: &WorkspaceStore) -> EngineResult<()> {
    let mut updates = serde_json::Map::new();
    updates.insert("last_heartbeat_at".into(), json!(Utc::now().to_rfc3339()));
    ws.update_state(updates)
}

/// Read the last heartbeat timestamp from state, if any.
pub fn get_last_heartbeat_time(ws: &WorkspaceStore) -> EngineResult<Option<String>> {
    Ok(ws
        .read_state()?
        .get("last_heartbeat_at")
        .and_then(|v| v.as_str())
        .map(String::from))
}
