// Lucy Engine — Cron Scheduler
//
// Workspace-local recurring workloads. Every workspace stores its crons at
// crons/{slug}/task.json; the scheduler discovers them, computes fire
// times in each definition's timezone, and dispatches each fire into its
// own task with the same safety guarantees as interactive runs.
//
// A manual-trigger channel lets the lucy_trigger_cron tool fire a cron
// immediately without waiting for its schedule.

pub mod executor;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::CronDefinition;
use crate::engine::slack::ChatSink;
use crate::engine::tools::builtin::CronTrigger;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// How often the timer loop re-evaluates schedules.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Runs an agent-type cron's instruction and returns the final text.
/// Implemented by the request pipeline; mocked in tests.
#[async_trait::async_trait]
pub trait CronAgent: Send + Sync {
    async fn run_instruction(
        &self,
        workspace_id: &str,
        instruction: &str,
        delivery_channel: Option<&str>,
    ) -> EngineResult<String>;
}

/// A cron discovered on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredCron {
    pub workspace_id: String,
    pub slug: String,
    pub definition: CronDefinition,
}

pub struct CronScheduler {
    workspace_root: PathBuf,
    agent: Arc<dyn CronAgent>,
    sink: Arc<dyn ChatSink>,
}

impl CronScheduler {
    pub fn new(workspace_root: &Path, agent: Arc<dyn CronAgent>, sink: Arc<dyn ChatSink>) -> Self {
        CronScheduler {
            workspace_root: workspace_root.to_path_buf(),
            agent,
            sink,
        }
    }

    /// Walk every workspace root and parse crons/*/task.json.
    /// Malformed definitions are logged and skipped, never fatal.
    pub fn discover(&self) -> Vec<DiscoveredCron> {
        let mut found = Vec::new();
        let Ok(workspaces) = std::fs::read_dir(&self.workspace_root) else {
            return found;
        };

        for ws_entry in workspaces.flatten() {
            if !ws_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let workspace_id = ws_entry.file_name().to_string_lossy().to_string();
            let crons_dir = ws_entry.path().join("crons");
            let Ok(entries) = std::fs::read_dir(&crons_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let task_path = entry.path().join("task.json");
                if !task_path.is_file() {
                    continue;
                }
                let slug = entry.file_name().to_string_lossy().to_string();
                match std::fs::read_to_string(&task_path)
                    .map_err(EngineError::from)
                    .and_then(|text| Ok(serde_json::from_str::<CronDefinition>(&text)?))
                {
                    Ok(definition) => found.push(DiscoveredCron {
                        workspace_id: workspace_id.clone(),
                        slug,
                        definition,
                    }),
                    Err(e) => warn!("[cron] Skipping malformed {}/{}: {}", workspace_id, slug, e),
                }
            }
        }
        info!("[cron] Discovered {} cron definitions", found.len());
        found
    }

    /// Start the timer loop and the manual-trigger listener. Each fire
    /// dispatches into an independent task so a slow cron can't delay the
    /// next tick.
    pub fn start(self: Arc<Self>, mut triggers: UnboundedReceiver<CronTrigger>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("[cron] Scheduler started ({}s tick)", TICK_INTERVAL.as_secs());
            let mut last_tick = Utc::now();
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                let now = Utc::now();
                for cron in scheduler.discover() {
                    match is_due(&cron.definition, last_tick, now) {
                        Ok(true) => scheduler.clone().spawn_run(cron),
                        Ok(false) => {}
                        Err(e) => warn!(
                            "[cron] Bad schedule for {}/{}: {}",
                            cron.workspace_id, cron.slug, e
                        ),
                    }
                }
                last_tick = now;
            }
        });

        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                info!(
                    "[cron] Manual trigger for {}/{}",
                    trigger.workspace_id, trigger.slug
                );
                match self.load(&trigger.workspace_id, &trigger.slug) {
                    Ok(cron) => self.clone().spawn_run(cron),
                    Err(e) => warn!("[cron] Trigger failed: {}", e),
                }
            }
        });
    }

    fn load(&self, workspace_id: &str, slug: &str) -> EngineResult<DiscoveredCron> {
        let path = self
            .workspace_root
            .join(workspace_id)
            .join("crons")
            .join(slug)
            .join("task.json");
        let text = std::fs::read_to_string(&path)
            .map_err(|_| EngineError::cron(slug, "task.json not found"))?;
        Ok(DiscoveredCron {
            workspace_id: workspace_id.to_string(),
            slug: slug.to_string(),
            definition: serde_json::from_str(&text)?,
        })
    }

    fn spawn_run(self: Arc<Self>, cron: DiscoveredCron) {
        tokio::spawn(async move {
            let runner = executor::CronRunner::new(
                &self.workspace_root,
                self.agent.clone(),
                self.sink.clone(),
            );
            if let Err(e) = runner.run_with_retries(&cron).await {
                warn!("[cron] {}/{} failed: {}", cron.workspace_id, cron.slug, e);
            }
        });
    }
}

// ── Schedule evaluation ────────────────────────────────────────────────────

/// Parse a cron expression, accepting the standard 5-field form by
/// prefixing a seconds field.
pub fn parse_schedule(expression: &str) -> EngineResult<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::Config(format!("Invalid cron expression '{}': {}", expression, e)))
}

/// Did this definition have a fire time in (last_tick, now]?
pub fn is_due(
    definition: &CronDefinition,
    last_tick: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let schedule = parse_schedule(&definition.cron_expression)?;
    let tz: Tz = definition
        .timezone
        .parse()
        .map_err(|_| EngineError::Config(format!("Unknown timezone '{}'", definition.timezone)))?;

    let after = last_tick.with_timezone(&tz);
    match schedule.after(&after).next() {
        Some(next_fire) => Ok(next_fire.with_timezone(&Utc) <= now),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{CronType, DeliveryMode, DependsOnPredicate};
    use chrono::TimeZone;

    fn definition(expression: &str, timezone: &str) -> CronDefinition {
        CronDefinition {
            path: "crons/test".into(),
            cron_expression: expression.into(),
            title: "Test".into(),
            description: "test".into(),
            cron_type: CronType::Agent,
            condition_script_path: None,
            depends_on: None,
            depends_on_predicate: DependsOnPredicate::LastDelivered,
            delivery_mode: DeliveryMode::LogOnly,
            delivery_channel: None,
            max_retries: 0,
            max_runs: 0,
            notify_on_failure: false,
            requesting_user_id: None,
            timezone: timezone.into(),
        }
    }

    #[test]
    fn test_parse_five_field_expression() {
        assert!(parse_schedule("0 9 * * 1-5").is_ok());
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[test]
    fn test_is_due_when_boundary_crossed() {
        let def = definition("0 9 * * *", "UTC");
        let last = Utc.with_ymd_and_hms(2026, 3, 2, 8, 59, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 30).unwrap();
        assert!(is_due(&def, last, now).unwrap());
    }

    #[test]
    fn test_not_due_between_fires() {
        let def = definition("0 9 * * *", "UTC");
        let last = Utc.with_ymd_and_hms(2026, 3, 2, 9, 5, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 10, 0).unwrap();
        assert!(!is_due(&def, last, now).unwrap());
    }

    #[test]
    fn test_timezone_shifts_fire_time() {
        // 09:00 Kolkata == 03:30 UTC.
        let def = definition("0 9 * * *", "Asia/Kolkata");
        let last = Utc.with_ymd_and_hms(2026, 3, 2, 3, 25, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 31, 0).unwrap();
        assert!(is_due(&def, last, now).unwrap());

        let last = Utc.with_ymd_and_hms(2026, 3, 2, 3, 31, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 40, 0).unwrap();
        assert!(!is_due(&def, last, now).unwrap());
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let def = definition("0 9 * * *", "Mars/Olympus");
        let now = Utc::now();
        assert!(is_due(&def, now, now).is_err());
    }
}
