// Lucy — integration tests.
//
// End-to-end paths through the real pipeline with a scripted model
// provider and a collecting chat sink: fast path, destructive-action
// gating with HITL approval, duplicate suppression, and the cron
// executor's full fire pipeline (condition gates, SKIP suppression,
// Block Kit delivery, max_runs self-deletion).

use async_trait::async_trait;
use lucy::atoms::error::EngineResult;
use lucy::atoms::types::*;
use lucy::engine::capability_index::{IndexRegistry, TopKRetriever};
use lucy::engine::cron::executor::{CronRunner, CronRunStatus};
use lucy::engine::cron::{CronAgent, DiscoveredCron};
use lucy::engine::hitl::{DestructivePolicy, HitlRegistry};
use lucy::engine::http::BreakerRegistry;
use lucy::engine::humanize::MessagePools;
use lucy::engine::pipeline::MessagePipeline;
use lucy::engine::providers::{ChatProvider, ProviderError, ProviderReply};
use lucy::engine::router::ModelRouter;
use lucy::engine::slack::ChatSink;
use lucy::engine::tasks::TaskRegistry;
use lucy::engine::tool_executor::ToolExecutor;
use lucy::engine::tools::broker::BrokerClient;
use lucy::engine::tools::builtin::BuiltinTools;
use lucy::engine::tools::ToolSuite;
use lucy::engine::workspace::WorkspaceStore;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test doubles ───────────────────────────────────────────────────────────

/// Pops one scripted reply per model call and counts invocations.
struct ScriptedProvider {
    replies: Mutex<Vec<ProviderReply>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(mut replies: Vec<ProviderReply>) -> Arc<Self> {
        replies.reverse();
        Arc::new(ScriptedProvider {
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .pop()
            .ok_or_else(|| ProviderError::Transport("script exhausted".into()))
    }
}

fn text_reply(text: &str) -> ProviderReply {
    ProviderReply {
        content: text.into(),
        tool_calls: vec![],
        usage: None,
        model: "stub-model".into(),
    }
}

fn tool_reply(name: &str, args: serde_json::Value) -> ProviderReply {
    ProviderReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: format!("call_{}", uuid_suffix()),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: args.to_string(),
            },
        }],
        usage: Some(TokenUsage {
            prompt_tokens: 50,
            completion_tokens: 5,
            total_tokens: 55,
        }),
        model: "stub-model".into(),
    }
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Collects everything the pipeline posts to chat.
#[derive(Default)]
struct CollectingSink {
    posts: Mutex<Vec<ChatPost>>,
}

impl CollectingSink {
    fn posts(&self) -> Vec<ChatPost> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl ChatSink for CollectingSink {
    async fn deliver(&self, post: ChatPost) -> EngineResult<()> {
        self.posts.lock().push(post);
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    _tmp: tempfile::TempDir,
    root: std::path::PathBuf,
    pipeline: Arc<MessagePipeline>,
    sink: Arc<CollectingSink>,
    hitl: Arc<HitlRegistry>,
    provider: Arc<ScriptedProvider>,
}

fn harness(replies: Vec<ProviderReply>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let provider = ScriptedProvider::new(replies);

    let router = Arc::new(ModelRouter::new(
        provider.clone(),
        root.join("assets"),
        root.clone(),
    ));
    let broker = Arc::new(BrokerClient::new("https://broker.invalid", ""));
    let (cron_tx, _cron_rx) = tokio::sync::mpsc::unbounded_channel();
    let builtin = BuiltinTools::new(provider.clone(), None, cron_tx);
    let suite = Arc::new(ToolSuite::new(broker.clone(), None, builtin));

    let hitl = Arc::new(HitlRegistry::new());
    let executor = Arc::new(ToolExecutor::new(
        suite.clone(),
        hitl.clone(),
        Arc::new(BreakerRegistry::new()),
    ));
    let retriever = Arc::new(TopKRetriever::new(Arc::new(IndexRegistry::new()), broker));
    let sink = Arc::new(CollectingSink::default());

    let pipeline = Arc::new(MessagePipeline::new(
        root.clone(),
        None,
        root.join("assets"),
        router,
        retriever,
        suite,
        executor,
        Arc::new(TaskRegistry::new()),
        hitl.clone(),
        Arc::new(MessagePools::new()),
        sink.clone(),
        None,
    ));

    Harness {
        _tmp: tmp,
        root,
        pipeline,
        sink,
        hitl,
        provider,
    }
}

fn event(text: &str) -> ChatEvent {
    ChatEvent {
        team_id: "T012345".into(),
        channel_id: "C1".into(),
        user_id: "U1".into(),
        ts: format!("1726000000.{}", uuid_suffix()),
        thread_ts: None,
        text: text.into(),
    }
}

// ── Fast path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn greeting_takes_fast_path_without_model_call() {
    let h = harness(vec![]);
    h.pipeline.handle_event(event("hi")).await;

    let posts = h.sink.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].text.as_ref().unwrap().len() > 0);
    assert_eq!(h.provider.call_count(), 0, "fast path must not hit the router");
}

#[tokio::test]
async fn duplicate_events_processed_once() {
    let h = harness(vec![]);
    let ev = event("hello");
    h.pipeline.handle_event(ev.clone()).await;
    h.pipeline.handle_event(ev).await;
    assert_eq!(h.sink.posts().len(), 1);
}

#[tokio::test]
async fn long_message_skips_fast_path() {
    let text = "please pull together a summary of everything that happened in the project this week";
    let h = harness(vec![text_reply("Here's the summary.")]);
    h.pipeline.handle_event(event(text)).await;

    assert_eq!(h.provider.call_count(), 1);
    let posts = h.sink.posts();
    assert_eq!(posts[0].text.as_deref(), Some("Here's the summary."));
}

// ── Destructive gating + HITL ──────────────────────────────────────────────

#[tokio::test]
async fn destructive_tool_call_is_gated_then_approved() {
    let h = harness(vec![
        tool_reply("lucy_delete_cron", json!({"slug": "standup"})),
        text_reply("I'd like to delete the standup cron — approve to proceed."),
    ]);

    // Seed the workspace with the cron the model will try to delete.
    let ws = WorkspaceStore::new("T012345", &h.root);
    ws.ensure_structure().unwrap();
    ws.write(
        "crons/standup/task.json",
        &json!({
            "path": "crons/standup",
            "cron_expression": "0 9 * * 1-5",
            "title": "Standup",
            "description": "remind the team",
            "type": "agent",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
        })
        .to_string(),
    )
    .unwrap();

    h.pipeline.handle_event(event("delete the standup reminder cron")).await;

    // Nothing executed yet: the cron survives and an approval is pending.
    assert!(ws.read("crons/standup/task.json").unwrap().is_some());
    let pending = h.hitl.pending_for_workspace("T012345");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_name, "lucy_delete_cron");
    let posts = h.sink.posts();
    assert!(posts.last().unwrap().text.as_ref().unwrap().contains("approve"));

    // Approve: the action runs exactly once and reports back.
    let action_id = pending[0].action_id.clone();
    h.pipeline.approve_action(&action_id, "C1").await.unwrap();

    assert!(ws.read("crons/standup/task.json").unwrap().is_none());
    assert_eq!(h.hitl.pending_count(), 0);
    let posts = h.sink.posts();
    assert!(posts.last().unwrap().text.as_ref().unwrap().starts_with("Done"));

    // Second resolution is a no-op with a polite reply.
    h.pipeline.approve_action(&action_id, "C1").await.unwrap();
    let posts = h.sink.posts();
    assert!(posts.last().unwrap().text.as_ref().unwrap().contains("expired"));
}

// ── Duplicate suppression ──────────────────────────────────────────────────

#[tokio::test]
async fn identical_mutating_calls_within_window_execute_once() {
    let h = harness(vec![]);
    let ws = WorkspaceStore::new("T012345", &h.root);
    ws.ensure_structure().unwrap();

    let suite = {
        let broker = Arc::new(BrokerClient::new("https://broker.invalid", ""));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(ToolSuite::new(
            broker,
            None,
            BuiltinTools::new(h.provider.clone(), None, tx),
        ))
    };
    let executor = ToolExecutor::new(
        suite,
        Arc::new(HitlRegistry::new()),
        Arc::new(BreakerRegistry::new()),
    );

    let call = |id: &str| ParsedToolCall {
        id: id.into(),
        name: "lucy_remember".into(),
        parameters: json!({"fact": "the deploy window is Friday", "category": "general"}),
        parse_error: None,
    };

    let outcomes = executor
        .execute_batch(&ws, &DestructivePolicy::default(), &[call("c1"), call("c2")])
        .await;

    let ok_count = outcomes.iter().filter(|o| o.status == ToolStatus::Ok).count();
    let blocked: Vec<_> = outcomes
        .iter()
        .filter(|o| o.error_kind == Some(ToolErrorKind::DuplicateBlocked))
        .collect();
    assert_eq!(ok_count, 1, "exactly one of the pair executes");
    assert_eq!(blocked.len(), 1);

    // Idempotent pairs both execute.
    let read = |id: &str| ParsedToolCall {
        id: id.into(),
        name: "lucy_list_crons".into(),
        parameters: json!({}),
        parse_error: None,
    };
    let outcomes = executor
        .execute_batch(&ws, &DestructivePolicy::default(), &[read("r1"), read("r2")])
        .await;
    assert!(outcomes.iter().all(|o| o.status == ToolStatus::Ok));
}

// ── Cron executor ──────────────────────────────────────────────────────────

struct StaticAgent {
    response: String,
}

#[async_trait]
impl CronAgent for StaticAgent {
    async fn run_instruction(
        &self,
        _workspace_id: &str,
        _instruction: &str,
        _delivery_channel: Option<&str>,
    ) -> EngineResult<String> {
        Ok(self.response.clone())
    }
}

fn cron_workspace(root: &std::path::Path) -> WorkspaceStore {
    let ws = WorkspaceStore::new("T012345", root);
    ws.ensure_structure().unwrap();
    ws
}

fn discovered(definition: serde_json::Value, slug: &str) -> DiscoveredCron {
    DiscoveredCron {
        workspace_id: "T012345".into(),
        slug: slug.into(),
        definition: serde_json::from_value(definition).unwrap(),
    }
}

#[tokio::test]
async fn script_cron_with_max_runs_one_self_deletes() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = cron_workspace(tmp.path());
    ws.write("scripts/echo.sh", "echo 'Hello from a cron job!'\n").unwrap();
    ws.write(
        "crons/echo-once/task.json",
        &json!({
            "path": "crons/echo-once",
            "cron_expression": "* * * * *",
            "title": "Echo once",
            "description": "scripts/echo.sh",
            "type": "script",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
            "max_runs": 1,
        })
        .to_string(),
    )
    .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let runner = CronRunner::new(
        tmp.path(),
        Arc::new(StaticAgent { response: String::new() }),
        sink.clone(),
    );
    let cron = discovered(
        serde_json::from_str(&ws.read("crons/echo-once/task.json").unwrap().unwrap()).unwrap(),
        "echo-once",
    );

    let status = runner.run_with_retries(&cron).await.unwrap();
    assert_eq!(status, CronRunStatus::Delivered);

    // Delivered to the channel…
    let posts = sink.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].text.as_ref().unwrap().contains("Hello from a cron job!"));

    // …and the whole cron directory is gone after run 1 of max_runs=1.
    assert!(!tmp.path().join("T012345").join("crons").join("echo-once").exists());
}

#[tokio::test]
async fn condition_script_failure_skips_run() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = cron_workspace(tmp.path());
    ws.write("scripts/never.sh", "exit 1\n").unwrap();
    ws.write(
        "crons/gated/task.json",
        &json!({
            "path": "crons/gated",
            "cron_expression": "* * * * *",
            "title": "Gated",
            "description": "should not run",
            "type": "agent",
            "condition_script_path": "scripts/never.sh",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
        })
        .to_string(),
    )
    .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let runner = CronRunner::new(
        tmp.path(),
        Arc::new(StaticAgent { response: "should not appear".into() }),
        sink.clone(),
    );
    let cron = discovered(
        serde_json::from_str(&ws.read("crons/gated/task.json").unwrap().unwrap()).unwrap(),
        "gated",
    );

    let status = runner.run_with_retries(&cron).await.unwrap();
    assert_eq!(status, CronRunStatus::Skipped);
    assert!(sink.posts().is_empty());

    let log = ws.read("crons/gated/execution.log").unwrap().unwrap();
    assert!(log.contains("status: skipped"));
    // Skips never self-delete.
    assert!(ws.read("crons/gated/task.json").unwrap().is_some());
}

#[tokio::test]
async fn agent_cron_skip_response_suppresses_delivery() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = cron_workspace(tmp.path());
    ws.write(
        "crons/quiet/task.json",
        &json!({
            "path": "crons/quiet",
            "cron_expression": "* * * * *",
            "title": "Quiet",
            "description": "report only when something changed",
            "type": "agent",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
        })
        .to_string(),
    )
    .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let runner = CronRunner::new(
        tmp.path(),
        Arc::new(StaticAgent { response: "SKIP".into() }),
        sink.clone(),
    );
    let cron = discovered(
        serde_json::from_str(&ws.read("crons/quiet/task.json").unwrap().unwrap()).unwrap(),
        "quiet",
    );

    let status = runner.run_with_retries(&cron).await.unwrap();
    assert_eq!(status, CronRunStatus::Skipped);
    assert!(sink.posts().is_empty());
}

#[tokio::test]
async fn agent_cron_block_kit_response_delivers_blocks() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = cron_workspace(tmp.path());
    ws.write(
        "crons/digest/task.json",
        &json!({
            "path": "crons/digest",
            "cron_expression": "* * * * *",
            "title": "Digest",
            "description": "daily digest",
            "type": "agent",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
        })
        .to_string(),
    )
    .unwrap();

    let blocks = json!({
        "blocks": [{"type": "section", "text": {"type": "mrkdwn", "text": "Hello Block"}}]
    });
    let sink = Arc::new(CollectingSink::default());
    let runner = CronRunner::new(
        tmp.path(),
        Arc::new(StaticAgent { response: blocks.to_string() }),
        sink.clone(),
    );
    let cron = discovered(
        serde_json::from_str(&ws.read("crons/digest/task.json").unwrap().unwrap()).unwrap(),
        "digest",
    );

    runner.run_with_retries(&cron).await.unwrap();
    let posts = sink.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].blocks.is_some());
    assert!(posts[0].text.is_none());
}

#[tokio::test]
async fn failed_cron_appends_failed_entry_and_notifies() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = cron_workspace(tmp.path());
    ws.write(
        "crons/broken/task.json",
        &json!({
            "path": "crons/broken",
            "cron_expression": "* * * * *",
            "title": "Broken",
            "description": "scripts/missing.sh",
            "type": "script",
            "delivery_mode": "channel",
            "delivery_channel": "C1",
            "notify_on_failure": true,
        })
        .to_string(),
    )
    .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let runner = CronRunner::new(
        tmp.path(),
        Arc::new(StaticAgent { response: String::new() }),
        sink.clone(),
    );
    let cron = discovered(
        serde_json::from_str(&ws.read("crons/broken/task.json").unwrap().unwrap()).unwrap(),
        "broken",
    );

    assert!(runner.run_with_retries(&cron).await.is_err());

    let log = ws.read("crons/broken/execution.log").unwrap().unwrap();
    assert!(log.contains("status: failed"));
    // Failure notice went to the delivery channel; no self-deletion.
    assert_eq!(sink.posts().len(), 1);
    assert!(sink.posts()[0].text.as_ref().unwrap().contains("failed"));
    assert!(ws.read("crons/broken/task.json").unwrap().is_some());
}

// ── Workspace properties on real disk ──────────────────────────────────────

#[test]
fn workspace_round_trip_and_traversal() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = WorkspaceStore::new("T1", tmp.path());
    ws.ensure_structure().unwrap();

    for (path, content) in [
        ("company/SKILL.md", "---\nname: company\ndescription: d\n---\nbody"),
        ("data/metrics/2026-01-01.json", "{\"n\": 1}"),
        ("logs/threads/1_0.jsonl", "{}"),
    ] {
        ws.write(path, content).unwrap();
        assert_eq!(ws.read(path).unwrap().as_deref(), Some(content));
    }

    for bad in ["../x", "a/../../x", "/abs"] {
        assert!(ws.write(bad, "x").is_err());
        assert!(ws.read(bad).is_err());
        assert!(ws.delete(bad).is_err());
    }
}
