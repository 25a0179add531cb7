// Lucy Engine — Local Slack Message Logs
//
// Periodically synced copies of channel history give crons instant grep
// access to what's been happening without an API round-trip per run.
//
// File structure:
//     slack_logs/{channel_name}/{YYYY-MM-DD}.md      one line per message
//     slack_logs/_last_sync_ts                       watermark for sync

use super::WorkspaceStore;
use crate::atoms::error::EngineResult;
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use std::collections::BTreeMap;

const LAST_SYNC_FILE: &str = "slack_logs/_last_sync_ts";

/// One message to persist locally: (slack ts, user id, text).
pub type LoggedMessage = (String, String, String);

/// Append messages for one channel, grouped by UTC date, deduplicating
/// against lines already on disk. Returns the number of new lines.
pub fn sync_channel_messages(
    ws: &WorkspaceStore,
    channel_name: &str,
    messages: &[LoggedMessage],
) -> EngineResult<usize> {
    let mut by_date: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (ts, user, text) in messages {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(dt) = slack_ts_to_datetime(ts) else {
            continue;
        };
        let line = format!("[{}] <{}> {}", dt.format("%H:%M:%S"), user, text);
        by_date.entry(dt.format("%Y-%m-%d").to_string()).or_default().push(line);
    }

    let mut synced = 0;
    for (date, lines) in by_date {
        let path = format!("slack_logs/{}/{}.md", channel_name, date);
        match ws.read(&path)? {
            Some(existing) => {
                let known: std::collections::HashSet<&str> = existing.lines().collect();
                let new_lines: Vec<&String> =
                    lines.iter().filter(|l| !known.contains(l.as_str())).collect();
                if !new_lines.is_empty() {
                    let chunk: Vec<&str> = new_lines.iter().map(|l| l.as_str()).collect();
                    ws.append(&path, &format!("{}\n", chunk.join("\n")))?;
                    synced += new_lines.len();
                }
            }
            None => {
                ws.write(&path, &format!("{}\n", lines.join("\n")))?;
                synced += lines.len();
            }
        }
    }

    if synced > 0 {
        info!(
            "[workspace] Synced {} slack messages for #{} ({})",
            synced,
            channel_name,
            ws.workspace_id()
        );
    }
    Ok(synced)
}

/// Read locally synced messages since a date, restricted to channels.
/// Used by monitoring crons to review recent activity.
pub fn get_local_messages(
    ws: &WorkspaceStore,
    since: &str,
    channels: &[&str],
) -> EngineResult<String> {
    let since_date = since
        .get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

    let mut sections = Vec::new();
    for channel in channels {
        let dir = format!("slack_logs/{}", channel);
        let mut files: Vec<String> = ws
            .list(&dir)?
            .into_iter()
            .filter(|f| f.ends_with(".md"))
            .collect();
        files.sort();

        for file in files {
            if let (Some(cutoff), Some(date_str)) = (since_date, file_date(&file)) {
                if let Ok(file_date) = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") {
                    if file_date < cutoff {
                        continue;
                    }
                }
            }
            if let Some(content) = ws.read(&file)? {
                sections.push(format!("### #{} — {}\n{}", channel, file, content.trim()));
            }
        }
    }

    if sections.is_empty() {
        return Ok("(No local slack messages found)".to_string());
    }
    Ok(sections.join("\n\n"))
}

pub fn get_last_sync_ts(ws: &WorkspaceStore) -> EngineResult<Option<String>> {
    Ok(ws.read(LAST_SYNC_FILE)?.map(|s| s.trim().to_string()))
}

pub fn save_last_sync_ts(ws: &WorkspaceStore, ts: &str) -> EngineResult<()> {
    ws.write(LAST_SYNC_FILE, ts)?;
    Ok(())
}

/// Slack timestamps are "epoch_seconds.sequence".
fn slack_ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = ts.parse().ok()?;
    DateTime::from_timestamp(seconds as i64, 0)
}

fn file_date(path: &str) -> Option<String> {
    path.rsplit('/')
        .next()
        .and_then(|name| name.strip_suffix(".md"))
        .map(String::from)
}
