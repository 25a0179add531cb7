// Lucy Engine — Data Snapshots
//
// Saves JSON payloads to data/{category}/YYYY-MM-DD.json so crons and the
// agent can track metrics over time and compute deltas ("signups up 12%
// vs yesterday"). Example categories: "revenue", "signups", "channel-stats".

use super::WorkspaceStore;
use crate::atoms::error::EngineResult;
use crate::atoms::types::SnapshotPayload;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde_json::Value;

fn snapshot_path(category: &str, date: &DateTime<Utc>) -> String {
    format!("data/{}/{}.json", category, date.format("%Y-%m-%d"))
}

/// Save a snapshot for a category. Returns the relative path written.
pub fn save_snapshot(
    ws: &WorkspaceStore,
    category: &str,
    data: Value,
    date: Option<DateTime<Utc>>,
) -> EngineResult<String> {
    let date = date.unwrap_or_else(Utc::now);
    let path = snapshot_path(category, &date);
    let payload = SnapshotPayload {
        category: category.to_string(),
        captured_at: date.to_rfc3339(),
        data,
    };
    ws.write(&path, &serde_json::to_string_pretty(&payload)?)?;
    info!(
        "[workspace] Snapshot saved: {} {} ({})",
        category,
        date.format("%Y-%m-%d"),
        ws.workspace_id()
    );
    Ok(path)
}

/// Load a specific date's snapshot.
pub fn load_snapshot(
    ws: &WorkspaceStore,
    category: &str,
    date: &DateTime<Utc>,
) -> EngineResult<Option<SnapshotPayload>> {
    let Some(content) = ws.read(&snapshot_path(category, date))? else {
        return Ok(None);
    };
    match serde_json::from_str(&content) {
        Ok(payload) => Ok(Some(payload)),
        Err(_) => {
            warn!(
                "[workspace] Snapshot parse failed: {} {}",
                category,
                date.format("%Y-%m-%d")
            );
            Ok(None)
        }
    }
}

/// Load the most recent snapshot for a category.
pub fn load_latest(ws: &WorkspaceStore, category: &str) -> EngineResult<Option<SnapshotPayload>> {
    let mut files: Vec<String> = ws
        .list(&format!("data/{}", category))?
        .into_iter()
        .filter(|e| e.ends_with(".json"))
        .collect();
    files.sort();
    let Some(newest) = files.last() else {
        return Ok(None);
    };
    let Some(content) = ws.read(newest)? else {
        return Ok(None);
    };
    Ok(serde_json::from_str(&content).ok())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDelta {
    pub key: String,
    pub current: f64,
    pub previous: f64,
    pub delta: f64,
    pub pct_change: f64,
    pub days_back: i64,
}

/// Compute the numeric delta for a dot-path key between today and N days ago.
/// Returns None when either snapshot or the key is missing.
pub fn compute_delta(
    ws: &WorkspaceStore,
    category: &str,
    key: &str,
    days_back: i64,
) -> EngineResult<Option<SnapshotDelta>> {
    let now = Utc::now();
    let current = load_snapshot(ws, category, &now)?;
    let previous = load_snapshot(ws, category, &(now - Duration::days(days_back)))?;

    let (Some(current), Some(previous)) = (current, previous) else {
        return Ok(None);
    };
    let (Some(cur), Some(prev)) = (
        extract_numeric(&current.data, key),
        extract_numeric(&previous.data, key),
    ) else {
        return Ok(None);
    };

    let delta = cur - prev;
    let pct = if prev != 0.0 { delta / prev * 100.0 } else { 0.0 };
    Ok(Some(SnapshotDelta {
        key: key.to_string(),
        current: cur,
        previous: prev,
        delta,
        pct_change: (pct * 100.0).round() / 100.0,
        days_back,
    }))
}

/// List all snapshot categories that have data.
pub fn list_categories(ws: &WorkspaceStore) -> EngineResult<Vec<String>> {
    Ok(ws
        .list("data")?
        .into_iter()
        .filter(|e| e.ends_with('/'))
        .map(|e| {
            e.trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .collect())
}

/// Extract a numeric value from nested data using dot notation,
/// e.g. "metrics.total" or a simple key like "count".
fn extract_numeric(data: &Value, key: &str) -> Option<f64> {
    let mut node = data;
    for part in key.split('.') {
        node = node.get(part)?;
    }
    node.as_f64()
}
