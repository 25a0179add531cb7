// Lucy Engine — Cron Execution
//
// One cron fire, end to end: condition gate → dependency gate → context
// assembly → script or agent execution → delivery → execution log →
// self-deletion at max_runs. The whole attempt is wrapped in an
// exponential-backoff retry loop; failures append a FAILED entry and
// optionally notify the delivery channel, but never self-delete.

use super::{CronAgent, DiscoveredCron};
use crate::atoms::constants::{CRON_RETRY_BASE_DELAY, CRON_SCRIPT_TIMEOUT};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CronDefinition, CronType, DeliveryMode, DependsOnPredicate, ChatPost};
use crate::engine::slack::ChatSink;
use crate::engine::workspace::{memory, WorkspaceStore};
use chrono::Utc;
use log::{info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronRunStatus {
    Delivered,
    Skipped,
    Failed,
}

impl CronRunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CronRunStatus::Delivered => "delivered",
            CronRunStatus::Skipped => "skipped",
            CronRunStatus::Failed => "failed",
        }
    }
}

pub struct CronRunner {
    workspace_root: PathBuf,
    agent: Arc<dyn CronAgent>,
    sink: Arc<dyn ChatSink>,
}

impl CronRunner {
    pub fn new(workspace_root: &Path, agent: Arc<dyn CronAgent>, sink: Arc<dyn ChatSink>) -> Self {
        CronRunner {
            workspace_root: workspace_root.to_path_buf(),
            agent,
            sink,
        }
    }

    /// Run one fire with `1 + max_retries` attempts and exponential
    /// backoff. Skips are terminal — a condition gate saying "not now"
    /// is not a failure.
    pub async fn run_with_retries(&self, cron: &DiscoveredCron) -> EngineResult<CronRunStatus> {
        let attempts = 1 + cron.definition.max_retries;
        let mut last_error: Option<EngineError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = CRON_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    "[cron] {}/{} retry {}/{} in {}s",
                    cron.workspace_id,
                    cron.slug,
                    attempt,
                    attempts - 1,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            match self.run_once(cron).await {
                Ok(status) => return Ok(status),
                Err(e) => last_error = Some(e),
            }
        }

        let error = last_error.unwrap_or_else(|| EngineError::cron(&cron.slug, "unknown failure"));
        let ws = self.workspace(&cron.workspace_id);
        append_log_entry(
            &ws,
            &cron.slug,
            CronRunStatus::Failed,
            0,
            &error.to_string(),
        )?;

        if cron.definition.notify_on_failure {
            if let Some(channel) = cron.definition.delivery_channel.as_deref() {
                let _ = self
                    .sink
                    .deliver(ChatPost::text(
                        channel,
                        format!(
                            ":warning: Cron '{}' failed after {} attempts: {}",
                            cron.definition.title,
                            attempts,
                            crate::atoms::types::truncate_utf8(&error.to_string(), 200)
                        ),
                    ))
                    .await;
            }
        }
        Err(error)
    }

    async fn run_once(&self, cron: &DiscoveredCron) -> EngineResult<CronRunStatus> {
        let started = Instant::now();
        let ws = self.workspace(&cron.workspace_id);
        let def = &cron.definition;

        // ── Condition gate ─────────────────────────────────────────────
        if let Some(condition) = def.condition_script_path.as_deref() {
            let path = ws.resolve(condition)?;
            let outcome = run_script(&path, &ws).await;
            let passed = matches!(&outcome, Ok((code, _, _)) if *code == 0);
            if !passed {
                info!("[cron] {}/{} skipped: condition not met", cron.workspace_id, cron.slug);
                append_log_entry(
                    &ws,
                    &cron.slug,
                    CronRunStatus::Skipped,
                    elapsed_ms(started),
                    "condition script returned non-zero",
                )?;
                return Ok(CronRunStatus::Skipped);
            }
        }

        // ── Dependency gate ────────────────────────────────────────────
        if let Some(dep_slug) = def.depends_on.as_deref() {
            let dep_log = ws
                .read(&format!("crons/{}/execution.log", dep_slug))?
                .unwrap_or_default();
            let today = Utc::now().format("%Y-%m-%d").to_string();
            if !dependency_satisfied(&dep_log, def.depends_on_predicate, &today) {
                info!(
                    "[cron] {}/{} skipped: dependency '{}' not satisfied",
                    cron.workspace_id, cron.slug, dep_slug
                );
                append_log_entry(
                    &ws,
                    &cron.slug,
                    CronRunStatus::Skipped,
                    elapsed_ms(started),
                    &format!("dependency '{}' not satisfied", dep_slug),
                )?;
                return Ok(CronRunStatus::Skipped);
            }
        }

        // ── Execute ────────────────────────────────────────────────────
        let response = match def.cron_type {
            CronType::Script => {
                let script_ref = def
                    .description
                    .strip_prefix("Script: ")
                    .unwrap_or(&def.description);
                let path = ws.resolve(script_ref.trim())?;
                let (code, stdout, stderr) = run_script(&path, &ws).await?;
                if code != 0 {
                    return Err(EngineError::cron(
                        &cron.slug,
                        format!(
                            "script exited {}: {}",
                            code,
                            crate::atoms::types::truncate_utf8(&stderr, 300)
                        ),
                    ));
                }
                stdout
            }
            CronType::Agent => {
                let instruction = build_instruction(&ws, cron)?;
                self.agent
                    .run_instruction(
                        &cron.workspace_id,
                        &instruction,
                        def.delivery_channel.as_deref(),
                    )
                    .await?
            }
        };

        // ── SKIP suppression ───────────────────────────────────────────
        let trimmed = response.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("skip") {
            info!("[cron] {}/{} produced SKIP — no delivery", cron.workspace_id, cron.slug);
            append_log_entry(
                &ws,
                &cron.slug,
                CronRunStatus::Skipped,
                elapsed_ms(started),
                "response was SKIP/empty",
            )?;
            return Ok(CronRunStatus::Skipped);
        }

        // ── Delivery ───────────────────────────────────────────────────
        self.deliver(def, trimmed).await?;

        append_log_entry(
            &ws,
            &cron.slug,
            CronRunStatus::Delivered,
            elapsed_ms(started),
            crate::atoms::types::truncate_utf8(trimmed, 500),
        )?;

        // ── Self-deletion at max_runs ──────────────────────────────────
        if def.max_runs > 0 {
            let log = ws
                .read(&format!("crons/{}/execution.log", cron.slug))?
                .unwrap_or_default();
            if count_delivered(&log) >= def.max_runs as usize {
                info!(
                    "[cron] {}/{} reached max_runs={} — self-deleting",
                    cron.workspace_id, cron.slug, def.max_runs
                );
                ws.delete_dir(&format!("crons/{}", cron.slug))?;
            }
        }

        Ok(CronRunStatus::Delivered)
    }

    async fn deliver(&self, def: &CronDefinition, response: &str) -> EngineResult<()> {
        let target = match def.delivery_mode {
            DeliveryMode::LogOnly => return Ok(()),
            DeliveryMode::Channel => def.delivery_channel.as_deref(),
            DeliveryMode::Dm => def.requesting_user_id.as_deref(),
        };
        let Some(target) = target else {
            warn!("[cron] No delivery target for '{}' — logging only", def.title);
            return Ok(());
        };

        let post = match parse_block_payload(response) {
            Some(blocks) => ChatPost {
                channel: target.to_string(),
                text: None,
                blocks: Some(blocks),
                thread_ts: None,
            },
            None => ChatPost::text(target, response),
        };
        self.sink.deliver(post).await
    }

    fn workspace(&self, workspace_id: &str) -> WorkspaceStore {
        WorkspaceStore::new(workspace_id, &self.workspace_root)
    }
}

// ── Instruction assembly ───────────────────────────────────────────────────

/// Instruction for an agent-type cron: title + description + accumulated
/// learnings + global context (current time, company/team knowledge).
fn build_instruction(ws: &WorkspaceStore, cron: &DiscoveredCron) -> EngineResult<String> {
    let def = &cron.definition;
    let mut parts = vec![format!("# {}\n\n{}", def.title, def.description)];

    if let Some(learnings) = ws.read(&format!("crons/{}/LEARNINGS.md", cron.slug))? {
        if !learnings.trim().is_empty() {
            parts.push(format!("## Learnings from previous runs\n\n{}", learnings.trim()));
        }
    }

    let mut context = format!("Current UTC time: {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
    for target in ["company", "team"] {
        let body = memory::knowledge_body(ws, target)?;
        if !body.trim().is_empty() {
            parts.push(format!("## {} context\n\n{}", target, body.trim()));
        }
    }
    context.push_str("\nIf there is nothing worth reporting this run, reply with exactly SKIP.");
    parts.push(format!("## Context\n\n{}", context));

    Ok(parts.join("\n\n"))
}

// ── Script execution ───────────────────────────────────────────────────────

/// Run a workspace script with WORKSPACE_ID in its environment.
/// Returns (exit_code, stdout, stderr).
async fn run_script(path: &Path, ws: &WorkspaceStore) -> EngineResult<(i32, String, String)> {
    if !path.is_file() {
        return Err(EngineError::Process(format!(
            "script not found: {}",
            path.display()
        )));
    }

    let mut command = match path.extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let mut c = tokio::process::Command::new("python3");
            c.arg(path);
            c
        }
        Some("sh") => {
            let mut c = tokio::process::Command::new("sh");
            c.arg(path);
            c
        }
        _ => tokio::process::Command::new(path),
    };

    let output = tokio::time::timeout(
        CRON_SCRIPT_TIMEOUT,
        command
            .current_dir(ws.root())
            .env("WORKSPACE_ID", ws.workspace_id())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| {
        EngineError::Process(format!(
            "script timed out after {}s: {}",
            CRON_SCRIPT_TIMEOUT.as_secs(),
            path.display()
        ))
    })??;

    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

// ── Execution log ──────────────────────────────────────────────────────────

/// Append one entry to the append-only execution log:
///     ## {iso} (elapsed: Xms, status: delivered|skipped|failed)
pub fn append_log_entry(
    ws: &WorkspaceStore,
    slug: &str,
    status: CronRunStatus,
    elapsed_ms: u128,
    detail: &str,
) -> EngineResult<()> {
    let entry = format!(
        "## {} (elapsed: {}ms, status: {})\n{}\n\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        elapsed_ms,
        status.as_str(),
        detail
    );
    ws.append(&format!("crons/{}/execution.log", slug), &entry)?;
    Ok(())
}

/// Count delivered runs in an execution log. Skips don't count toward
/// max_runs, and failures never trigger self-deletion.
pub fn count_delivered(log: &str) -> usize {
    log.lines()
        .filter(|line| line.starts_with("## ") && line.contains("status: delivered"))
        .count()
}

/// Evaluate a depends_on predicate against the dependency's log.
pub fn dependency_satisfied(log: &str, predicate: DependsOnPredicate, today: &str) -> bool {
    let entries: Vec<&str> = log.lines().filter(|l| l.starts_with("## ")).collect();
    match predicate {
        DependsOnPredicate::LastDelivered => entries
            .last()
            .map(|line| line.contains("status: delivered"))
            .unwrap_or(false),
        DependsOnPredicate::AnySuccessToday => entries
            .iter()
            .any(|line| line.contains(today) && line.contains("status: delivered")),
    }
}

/// Does the response parse as a Block Kit payload?
fn parse_block_payload(response: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(response.trim()).ok()?;
    let blocks = value.get("blocks")?;
    blocks.is_array().then(|| blocks.clone())
}

fn elapsed_ms(started: Instant) -> u128 {
    started.elapsed().as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_delivered_ignores_skips_and_failures() {
        let log = "## 2026-03-01T09:00:00.000Z (elapsed: 120ms, status: delivered)\nok\n\n\
                   ## 2026-03-02T09:00:00.000Z (elapsed: 80ms, status: skipped)\ncondition\n\n\
                   ## 2026-03-03T09:00:00.000Z (elapsed: 220ms, status: failed)\nboom\n\n\
                   ## 2026-03-04T09:00:00.000Z (elapsed: 100ms, status: delivered)\nok\n\n";
        assert_eq!(count_delivered(log), 2);
    }

    #[test]
    fn test_dependency_last_delivered() {
        let good = "## 2026-03-01T09:00:00Z (elapsed: 1ms, status: delivered)\nok\n";
        let bad = "## 2026-03-01T09:00:00Z (elapsed: 1ms, status: delivered)\nok\n\n\
                   ## 2026-03-02T09:00:00Z (elapsed: 1ms, status: failed)\nboom\n";
        assert!(dependency_satisfied(good, DependsOnPredicate::LastDelivered, "2026-03-02"));
        assert!(!dependency_satisfied(bad, DependsOnPredicate::LastDelivered, "2026-03-02"));
        assert!(!dependency_satisfied("", DependsOnPredicate::LastDelivered, "2026-03-02"));
    }

    #[test]
    fn test_dependency_any_success_today() {
        let log = "## 2026-03-01T09:00:00Z (elapsed: 1ms, status: delivered)\nok\n\n\
                   ## 2026-03-02T09:00:00Z (elapsed: 1ms, status: failed)\nboom\n";
        assert!(dependency_satisfied(log, DependsOnPredicate::AnySuccessToday, "2026-03-01"));
        assert!(!dependency_satisfied(log, DependsOnPredicate::AnySuccessToday, "2026-03-02"));
    }

    #[test]
    fn test_block_payload_detection() {
        let blocks = r#"{"blocks": [{"type": "section", "text": {"type": "mrkdwn", "text": "Hi"}}]}"#;
        assert!(parse_block_payload(blocks).is_some());
        assert!(parse_block_payload("plain text").is_none());
        assert!(parse_block_payload(r#"{"no_blocks": true}"#).is_none());
    }

    #[test]
    fn test_log_entry_format() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();

        append_log_entry(&ws, "digest", CronRunStatus::Delivered, 142, "posted the digest").unwrap();
        let log = ws.read("crons/digest/execution.log").unwrap().unwrap();
        assert!(log.starts_with("## "));
        assert!(log.contains("(elapsed: 142ms, status: delivered)"));
        assert!(log.contains("posted the digest"));

        // Append-only: a second entry lands after the first.
        append_log_entry(&ws, "digest", CronRunStatus::Skipped, 3, "SKIP").unwrap();
        let log = ws.read("crons/digest/execution.log").unwrap().unwrap();
        assert_eq!(log.matches("## ").count(), 2);
    }
}
