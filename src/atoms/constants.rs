// ── Lucy Atoms: Constants ──────────────────────────────────────────────────
// All named tuning constants for the engine live here.
// Collecting them in one place eliminates magic numbers and makes the
// behavior of every layer auditable without reading its internals.

use std::time::Duration;

// ── Agent loop ─────────────────────────────────────────────────────────────

/// Maximum model-call iterations per agent run.
pub const MAX_ITERATIONS: u32 = 6;

/// Identical tool-call batch signatures this many consecutive iterations
/// means the model is stuck — force a loop-break reply.
pub const MAX_REPEATED_SIGNATURES: usize = 3;

/// Hard wall-clock cap for a single agent run.
pub const RUN_WALL_CLOCK_CAP: Duration = Duration::from_secs(180);

/// Non-system messages kept when trimming context before a model call.
pub const CONTEXT_KEEP_MESSAGES: usize = 40;

// ── Tool execution ─────────────────────────────────────────────────────────

/// Process-wide cap on concurrent tool executions.
pub const TOOL_SEMAPHORE_PERMITS: usize = 8;

/// Duplicate mutating calls with an identical canonical signature inside
/// this window are suppressed without executing.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Tool results longer than this are truncated before being fed back to
/// the model.
pub const TOOL_RESULT_MAX_CHARS: usize = 4_000;

/// Per-class timeout budgets (seconds).
pub const TIMEOUT_META_BROKER_SECS: u64 = 45;
pub const TIMEOUT_INTEGRATION_SECS: u64 = 20;
pub const TIMEOUT_LLM_CALL_SECS: u64 = 90;
pub const TIMEOUT_DEFAULT_SECS: u64 = 30;

// ── HITL ───────────────────────────────────────────────────────────────────

/// Pending destructive actions expire after this long.
pub const HITL_PENDING_TTL: Duration = Duration::from_secs(300);

// ── Capability index / retrieval ───────────────────────────────────────────

/// Below this many indexed tools the retriever returns nothing and the
/// caller falls back to meta-broker discovery.
pub const MIN_INDEXED_TOOLS: usize = 5;

/// BM25 score below which the caller may prefer meta-broker discovery
/// over binding the retrieved tools.
pub const MIN_RELEVANCE_SCORE: f64 = 0.5;

/// Default top-K for a retrieval pass.
pub const INITIAL_K: usize = 15;

// ── Fast path ──────────────────────────────────────────────────────────────

/// Messages longer than this never take the fast path.
pub const FAST_PATH_MAX_CHARS: usize = 60;

// ── Workspace ──────────────────────────────────────────────────────────────

/// Session memory is bounded; the oldest fact is evicted on insert.
pub const SESSION_MEMORY_MAX_ITEMS: usize = 50;

/// Session facts shown to the model in the prompt block.
pub const SESSION_MEMORY_PROMPT_ITEMS: usize = 20;

/// At most this many skill bodies are injected per request.
pub const MAX_INJECTED_SKILLS: usize = 3;

/// Total cap on injected skill-body characters per request.
pub const MAX_SKILL_CONTENT_CHARS: usize = 20_000;

/// Don't bother truncating a skill body into fewer remaining chars than this.
pub const MIN_REMAINING_FOR_TRUNCATION: usize = 500;

// ── Tasks ──────────────────────────────────────────────────────────────────

/// Finished task records are pruned after this long.
pub const TASK_RETENTION: Duration = Duration::from_secs(600);

// ── Circuit breakers ───────────────────────────────────────────────────────

pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

// ── Slack bridge ───────────────────────────────────────────────────────────

/// Reconnect backoff for the Socket Mode listener is capped here.
pub const BRIDGE_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

// ── Cron scheduler ─────────────────────────────────────────────────────────

/// Base delay for the cron retry backoff (doubles per attempt).
pub const CRON_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Condition and cron scripts are killed after this long.
pub const CRON_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);
