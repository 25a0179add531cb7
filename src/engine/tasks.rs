// Lucy Engine — Task Registry
//
// In-memory run records for agent work: what is running, for which
// workspace, since when. Powers the "what are you working on?" status
// reply and cooperative cancellation. Records for finished runs linger
// briefly (so "is it done?" gets an answer) and are pruned after a TTL.

use crate::atoms::constants::TASK_RETENTION;
use crate::atoms::types::TaskState;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation: the agent loop checks this at iteration
/// boundaries and before tool dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub workspace_id: String,
    pub description: String,
    pub state: TaskState,
    pub started_at: Instant,
    pub thread_ref: Option<String>,
    pub last_progress_at: Instant,
    pub cancel: CancellationFlag,
}

pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskRecord>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a new run. Returns the task id and its cancellation flag.
    pub fn create(
        &self,
        workspace_id: &str,
        description: &str,
        thread_ref: Option<&str>,
    ) -> (String, CancellationFlag) {
        let task_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let flag = CancellationFlag::default();
        let now = Instant::now();
        self.tasks.lock().push(TaskRecord {
            task_id: task_id.clone(),
            workspace_id: workspace_id.to_string(),
            description: description.to_string(),
            state: TaskState::Pending,
            started_at: now,
            thread_ref: thread_ref.map(String::from),
            last_progress_at: now,
            cancel: flag.clone(),
        });
        (task_id, flag)
    }

    pub fn set_state(&self, task_id: &str, state: TaskState) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.state = state;
            task.last_progress_at = Instant::now();
        }
        Self::prune(&mut tasks);
    }

    pub fn touch_progress(&self, task_id: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.last_progress_at = Instant::now();
        }
    }

    /// All records for a workspace, oldest first.
    pub fn workspace_tasks(&self, workspace_id: &str) -> Vec<TaskRecord> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| t.workspace_id == workspace_id)
            .cloned()
            .collect()
    }

    /// Format active tasks for the status short-circuit reply.
    /// Returns None when nothing is in flight.
    pub fn format_status(&self, workspace_id: &str) -> Option<String> {
        let tasks = self.workspace_tasks(workspace_id);
        let active: Vec<&TaskRecord> = tasks.iter().filter(|t| t.state.is_active()).collect();
        if active.is_empty() {
            return None;
        }

        let lines: Vec<String> = active
            .iter()
            .map(|t| {
                let elapsed = t.started_at.elapsed().as_secs();
                let elapsed_str = if elapsed > 0 {
                    format!("{}s", elapsed)
                } else {
                    "just started".to_string()
                };
                let description = crate::atoms::types::truncate_utf8(&t.description, 80);
                format!("• *{}* — {} ({})", description, t.state.as_str(), elapsed_str)
            })
            .collect();
        Some(lines.join("\n"))
    }

    /// Cancel the most recent active task, preferring a thread match.
    /// Returns the cancelled task's description.
    pub fn cancel_most_recent(
        &self,
        workspace_id: &str,
        thread_ref: Option<&str>,
    ) -> Option<String> {
        let mut tasks = self.tasks.lock();
        let active_indices: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.workspace_id == workspace_id && t.state.is_active())
            .map(|(i, _)| i)
            .collect();

        let target = thread_ref
            .and_then(|tref| {
                active_indices
                    .iter()
                    .copied()
                    .find(|&i| tasks[i].thread_ref.as_deref() == Some(tref))
            })
            .or_else(|| active_indices.last().copied())?;

        let task = &mut tasks[target];
        task.state = TaskState::Cancelled;
        task.cancel.cancel();
        info!("[tasks] Cancelled {} ({})", task.task_id, task.description);
        Some(task.description.clone())
    }

    fn prune(tasks: &mut Vec<TaskRecord>) {
        tasks.retain(|t| t.state.is_active() || t.last_progress_at.elapsed() <= TASK_RETENTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lists_active_only() {
        let registry = TaskRegistry::new();
        let (id1, _) = registry.create("W1", "research the payments market", None);
        registry.set_state(&id1, TaskState::Working);
        let (id2, _) = registry.create("W1", "draft the report", None);
        registry.set_state(&id2, TaskState::Done);

        let status = registry.format_status("W1").unwrap();
        assert!(status.contains("research the payments market"));
        assert!(status.contains("working"));
        assert!(!status.contains("draft the report"));
    }

    #[test]
    fn test_status_none_when_idle() {
        let registry = TaskRegistry::new();
        assert!(registry.format_status("W1").is_none());
    }

    #[test]
    fn test_cancel_prefers_thread_match() {
        let registry = TaskRegistry::new();
        registry.create("W1", "task in thread A", Some("111.0"));
        registry.create("W1", "task in thread B", Some("222.0"));

        let cancelled = registry.cancel_most_recent("W1", Some("111.0")).unwrap();
        assert_eq!(cancelled, "task in thread A");
    }

    #[test]
    fn test_cancel_falls_back_to_most_recent() {
        let registry = TaskRegistry::new();
        registry.create("W1", "older task", None);
        registry.create("W1", "newer task", None);

        let cancelled = registry.cancel_most_recent("W1", Some("999.9")).unwrap();
        assert_eq!(cancelled, "newer task");
    }

    #[test]
    fn test_cancellation_flag_propagates() {
        let registry = TaskRegistry::new();
        let (_, flag) = registry.create("W1", "long research", None);
        assert!(!flag.is_cancelled());
        registry.cancel_most_recent("W1", None);
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_workspace_isolation() {
        let registry = TaskRegistry::new();
        registry.create("W1", "w1 task", None);
        registry.create("W2", "w2 task", None);
        assert!(registry.cancel_most_recent("W2", None).is_some());
        let remaining = registry.workspace_tasks("W1");
        assert!(remaining.iter().all(|t| t.state.is_active()));
    }
}
