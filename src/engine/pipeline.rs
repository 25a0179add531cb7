// Lucy Engine — Message Pipeline
//
// Turns an inbound chat event into a bounded, observable, interruptible
// agent run:
//
//   event ─► dedup ─► per-thread serialization ─► workspace resolve
//         ─► fast path ─► edge gate (status / cancel)
//         ─► classify ─► prompt ─► tool retrieval ─► agent loop
//         ─► output processing ─► post ─► trace + memory persist
//
// The pipeline is also the cron scheduler's agent: an agent-type cron is
// just a run whose "user message" is the cron's instruction.

use crate::atoms::constants::MIN_RELEVANCE_SCORE;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChatEvent, ChatPost, Message, TaskState, ToolDefinition};
use crate::engine::agent_loop::{AgentLoop, StopReason};
use crate::engine::classifier::{classify, prompt_modules, ClassifierInput};
use crate::engine::edge_cases::{self, EdgeCaseAction};
use crate::engine::fast_path;
use crate::engine::hitl::{DestructivePolicy, HitlRegistry};
use crate::engine::humanize::MessagePools;
use crate::engine::output;
use crate::engine::prompt::PromptBuilder;
use crate::engine::capability_index::TopKRetriever;
use crate::engine::slack::{ChatSink, EventHandler, SlackClient};
use crate::engine::tasks::TaskRegistry;
use crate::engine::tool_executor::ToolExecutor;
use crate::engine::tools::ToolSuite;
use crate::engine::trace::RequestContext;
use crate::engine::workspace::{activity, channels, memory, preferences, skills, slack_logs, WorkspaceStore};
use crate::engine::cron::CronAgent;
use crate::engine::router::{ModelRouter, RouteOptions};
use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// Events remembered for duplicate suppression.
const SEEN_EVENTS_CAP: usize = 1_000;

pub struct MessagePipeline {
    workspace_root: PathBuf,
    seeds_dir: Option<PathBuf>,
    prompt: PromptBuilder,
    retriever: Arc<TopKRetriever>,
    suite: Arc<ToolSuite>,
    executor: Arc<ToolExecutor>,
    agent: AgentLoop,
    pub tasks: Arc<TaskRegistry>,
    pub hitl: Arc<HitlRegistry>,
    pub pools: Arc<MessagePools>,
    sink: Arc<dyn ChatSink>,
    /// Present when the transport is the real Slack client (thread history).
    slack: Option<Arc<SlackClient>>,
    thread_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    seen_events: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_root: PathBuf,
        seeds_dir: Option<PathBuf>,
        assets_dir: PathBuf,
        router: Arc<ModelRouter>,
        retriever: Arc<TopKRetriever>,
        suite: Arc<ToolSuite>,
        executor: Arc<ToolExecutor>,
        tasks: Arc<TaskRegistry>,
        hitl: Arc<HitlRegistry>,
        pools: Arc<MessagePools>,
        sink: Arc<dyn ChatSink>,
        slack: Option<Arc<SlackClient>>,
    ) -> Self {
        MessagePipeline {
            workspace_root,
            seeds_dir,
            prompt: PromptBuilder::new(&assets_dir),
            agent: AgentLoop::new(router, executor.clone()),
            retriever,
            suite,
            executor,
            tasks,
            hitl,
            pools,
            sink,
            slack,
            thread_locks: Mutex::new(HashMap::new()),
            seen_events: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Full pipeline for one inbound event. Never panics the caller:
    /// fatal errors degrade into a warm reply and an error log.
    pub async fn handle_event(&self, event: ChatEvent) {
        if self.already_seen(&event) {
            return;
        }

        // Messages within one thread are processed in receipt order.
        let lock = self.thread_lock(&event);
        let _guard = lock.lock().await;

        if let Err(e) = self.process(&event).await {
            error!("[pipeline] Fatal error for {}: {}", event.team_id, e);
            let degraded = edge_cases::degradation_message(&e.to_string(), &self.pools);
            let _ = self
                .sink
                .deliver(ChatPost::text(&event.channel_id, degraded).in_thread(event.thread_ref()))
                .await;
        }
    }

    async fn process(&self, event: &ChatEvent) -> EngineResult<()> {
        let mut ctx = RequestContext::new(&event.team_id);
        ctx.thread_ts = Some(event.thread_ref().to_string());

        let ws = self.workspace(&event.team_id)?;

        // ── Fast path ──────────────────────────────────────────────────
        let fast = fast_path::evaluate(&event.text, event.thread_depth(), &self.pools);
        if fast.is_fast {
            let reply = fast.response.unwrap_or_default();
            self.sink
                .deliver(ChatPost::text(&event.channel_id, &reply).in_thread(event.thread_ref()))
                .await?;
            ctx.trace.intent = format!("fast_path:{}", fast.reason);
            let record = ctx.trace.finish(&event.text, &reply);
            let _ = record; // fast path skips the thread log
            return Ok(());
        }

        // ── Edge-case gate: status / cancel short-circuits ─────────────
        match edge_cases::evaluate(
            &event.text,
            &event.team_id,
            event.thread_ts.as_deref(),
            &self.tasks,
        ) {
            EdgeCaseAction::ShortCircuit(reply) => {
                self.sink
                    .deliver(
                        ChatPost::text(&event.channel_id, &reply).in_thread(event.thread_ref()),
                    )
                    .await?;
                ctx.trace.intent = "edge_case".into();
                ctx.trace.finish(&event.text, &reply);
                return Ok(());
            }
            EdgeCaseAction::Continue => {}
        }

        // ── Classify ───────────────────────────────────────────────────
        let classification = classify(&ClassifierInput {
            text: &event.text,
            thread_depth: if event.thread_ts.is_some() { 6 } else { 0 },
            prev_turn_tool_calls: false,
        });
        ctx.trace.intent = classification.intent.as_str().to_string();

        // ── Task record ────────────────────────────────────────────────
        let (task_id, cancel) = self.tasks.create(
            &event.team_id,
            &event.text,
            Some(event.thread_ref()),
        );
        ctx.task_id = Some(task_id.clone());
        self.tasks.set_state(&task_id, TaskState::Working);

        // ── Channel + preference bookkeeping ───────────────────────────
        let _ = channels::register_channel(
            &ws,
            channels::ChannelInfo {
                channel_id: event.channel_id.clone(),
                is_dm: event.channel_id.starts_with('D'),
                ..Default::default()
            },
        );

        // ── Prompt + tools ─────────────────────────────────────────────
        let span = ctx.trace.open_span("prompt_build", json!({}));
        let connected = self
            .suite
            .broker()
            .get_connected_apps(&event.team_id)
            .await
            .unwrap_or_default();
        let connected_opt = (!connected.is_empty()).then_some(connected.as_slice());
        let system_prompt = self.prompt.build(&ws, connected_opt, &[], Some(&event.text))?;
        ctx.trace.close_span(span);

        let span = ctx.trace.open_span("tool_retrieval", json!({}));
        let tools = self.bind_tools(&event.team_id, &event.text, &connected).await;
        ctx.trace.close_span(span);

        // ── Messages: system + channel/user context + thread + user ────
        let mut messages = vec![Message::system(system_prompt)];

        if let Ok(channel_ctx) = channels::format_channel_context_for_prompt(&ws, &event.channel_id) {
            if !channel_ctx.is_empty() {
                messages.push(Message::system(channel_ctx));
            }
        }
        let prefs = preferences::load_user_preferences(&ws, &event.user_id).unwrap_or_default();
        let pref_block = preferences::format_preferences_for_prompt(&prefs);
        if !pref_block.is_empty() {
            messages.push(Message::system(pref_block));
        }

        // Intent-specific prompt modules, customized per workspace.
        if let Ok(module_content) =
            skills::load_named_skill_content(&ws, prompt_modules(classification.intent))
        {
            if !module_content.is_empty() {
                messages.push(Message::system(module_content));
            }
        }

        if let Some(thread_ts) = event.thread_ts.as_deref() {
            if let Some(slack) = &self.slack {
                if let Ok(replies) = slack.fetch_thread(&event.channel_id, thread_ts, 40).await {
                    let context: Vec<String> = replies
                        .iter()
                        .rev()
                        .take(20)
                        .rev()
                        .map(|(user, text)| format!("<{}> {}", user, text))
                        .collect();
                    if !context.is_empty() {
                        messages.push(Message::system(format!(
                            "Thread context (oldest first):\n{}",
                            context.join("\n")
                        )));
                    }
                }
            }
        }
        messages.push(Message::user(&event.text));

        // ── Agent run ──────────────────────────────────────────────────
        let route_opts = RouteOptions {
            tools,
            tz_offset_hours: prefs.get("tz_offset_hours").and_then(|v| v.as_f64()),
            tz_label: prefs
                .get("tz_label")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..Default::default()
        };
        let result = self
            .agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                messages,
                classification.tier,
                route_opts,
                &mut ctx,
                Some(&cancel),
            )
            .await;

        let reply = match result {
            Ok(run) => {
                self.tasks.set_state(
                    &task_id,
                    match run.stop_reason {
                        StopReason::Cancelled => TaskState::Cancelled,
                        StopReason::Completed => TaskState::Done,
                        _ => TaskState::Done,
                    },
                );
                if run.stop_reason == StopReason::Cancelled {
                    // Cancellation never removes posted messages; it only
                    // stops further posts.
                    ctx.trace.finish(&event.text, "");
                    return Ok(());
                }
                run.text
            }
            Err(e) => {
                self.tasks.set_state(&task_id, TaskState::Failed);
                warn!("[pipeline] Agent run failed: {}", e);
                edge_cases::degradation_message(&e.to_string(), &self.pools)
            }
        };

        // ── Post ───────────────────────────────────────────────────────
        if !reply.is_empty() {
            let post = match output::to_blocks(&reply) {
                Some(blocks) => ChatPost {
                    channel: event.channel_id.clone(),
                    text: Some(crate::atoms::types::truncate_utf8(&reply, 200).to_string()),
                    blocks: Some(blocks),
                    thread_ts: Some(event.thread_ref().to_string()),
                },
                None => ChatPost::text(&event.channel_id, &reply).in_thread(event.thread_ref()),
            };
            self.sink.deliver(post).await?;
        }

        // ── Persist: memory, preferences, local logs, activity, trace ──
        if memory::should_persist_memory(&event.text) {
            let category = memory::classify_memory_target(&event.text);
            if let Err(e) = memory::add_session_fact(&ws, &event.text, "conversation", category) {
                warn!("[pipeline] Session fact persist failed: {}", e);
            }
        }
        let _ = preferences::extract_preferences_from_message(&ws, &event.user_id, &event.text);
        let _ = slack_logs::sync_channel_messages(
            &ws,
            &event.channel_id,
            &[(event.ts.clone(), event.user_id.clone(), event.text.clone())],
        );
        let _ = activity::log_activity(
            &ws,
            &format!(
                "Replied in {} ({} tool calls)",
                event.channel_id,
                ctx.trace.tool_calls_made.len()
            ),
        );

        ctx.trace.finish(&event.text, &reply);
        ctx.trace.write_to_thread_log(
            &self.workspace_root,
            &event.team_id,
            event.thread_ts.as_deref().or(Some(event.ts.as_str())),
        );
        Ok(())
    }

    /// Retrieval-first tool binding: built-ins + meta tools always; the
    /// indexed top-K only when the BM25 score clears the confidence bar.
    /// A weak or absent index leaves discovery to the broker's meta-tools.
    async fn bind_tools(
        &self,
        workspace_id: &str,
        query: &str,
        connected: &[String],
    ) -> Vec<ToolDefinition> {
        let mut tools = self.suite.base_definitions();

        let connected_set: HashSet<String> = connected.iter().cloned().collect();
        let apps = (!connected_set.is_empty()).then_some(&connected_set);
        match self.retriever.retrieve(workspace_id, query, apps, None).await {
            Ok(Some(result)) if result.top_score >= MIN_RELEVANCE_SCORE => {
                info!(
                    "[pipeline] Binding {} retrieved tools (top_score={:.2})",
                    result.tools.len(),
                    result.top_score
                );
                let known: HashSet<String> = tools.iter().map(|t| t.name().to_string()).collect();
                tools.extend(
                    result
                        .tools
                        .into_iter()
                        .filter(|t| !known.contains(t.name())),
                );
            }
            Ok(_) => {
                info!("[pipeline] No confident retrieval — relying on broker discovery");
            }
            Err(e) => warn!("[pipeline] Retrieval failed: {}", e),
        }
        tools
    }

    /// Resolve (and lazily onboard) a workspace.
    pub fn workspace(&self, workspace_id: &str) -> EngineResult<WorkspaceStore> {
        let ws = WorkspaceStore::new(workspace_id, &self.workspace_root);
        let first_contact = !ws.exists();
        ws.ensure_structure()?;
        if first_contact {
            if let Some(seeds) = &self.seeds_dir {
                let _ = ws.copy_seeds(seeds, "");
            }
            let mut updates = serde_json::Map::new();
            updates.insert(
                "onboarded_at".into(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            ws.update_state(updates)?;
            info!("[pipeline] Workspace {} onboarded", workspace_id);
        }
        Ok(ws)
    }

    // ── HITL resolution ────────────────────────────────────────────────

    /// Approve a pending destructive action: execute it and report back.
    pub async fn approve_action(&self, action_id: &str, channel: &str) -> EngineResult<()> {
        let Some(action) = self.hitl.resolve(action_id, true) else {
            self.sink
                .deliver(ChatPost::text(
                    channel,
                    "That approval has expired or was already handled.",
                ))
                .await?;
            return Ok(());
        };

        let ws = self.workspace(&action.workspace_id)?;
        let outcome = self.executor.execute_approved(&ws, &action).await;
        let reply = if outcome.status == crate::atoms::types::ToolStatus::Ok {
            format!("Done — {} went through.", action.description)
        } else {
            format!(
                "I tried to run {} but it failed: {}",
                action.description,
                crate::atoms::types::truncate_utf8(&outcome.output, 200)
            )
        };
        self.sink.deliver(ChatPost::text(channel, reply)).await
    }

    /// Cancel a pending destructive action.
    pub async fn cancel_action(&self, action_id: &str, channel: &str) -> EngineResult<()> {
        self.hitl.resolve(action_id, false);
        self.sink
            .deliver(ChatPost::text(channel, "Okay, I won't do that."))
            .await
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn already_seen(&self, event: &ChatEvent) -> bool {
        let key = format!("{}:{}", event.channel_id, event.ts);
        let mut seen = self.seen_events.lock();
        if seen.0.contains(&key) {
            return true;
        }
        seen.0.insert(key.clone());
        seen.1.push_back(key);
        if seen.1.len() > SEEN_EVENTS_CAP {
            if let Some(oldest) = seen.1.pop_front() {
                seen.0.remove(&oldest);
            }
        }
        false
    }

    fn thread_lock(&self, event: &ChatEvent) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}:{}", event.channel_id, event.thread_ref());
        let mut locks = self.thread_locks.lock();
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl EventHandler for MessagePipeline {
    async fn handle(&self, event: ChatEvent) {
        self.handle_event(event).await;
    }
}

#[async_trait]
impl CronAgent for MessagePipeline {
    /// An agent-type cron is a normal run whose user message is the
    /// cron's assembled instruction. No fast path, no edge gate.
    async fn run_instruction(
        &self,
        workspace_id: &str,
        instruction: &str,
        delivery_channel: Option<&str>,
    ) -> EngineResult<String> {
        let ws = self.workspace(workspace_id)?;
        let mut ctx = RequestContext::new(workspace_id);
        ctx.trace.intent = "cron".into();

        let connected = self
            .suite
            .broker()
            .get_connected_apps(workspace_id)
            .await
            .unwrap_or_default();
        let connected_opt = (!connected.is_empty()).then_some(connected.as_slice());
        let system_prompt = self.prompt.build(&ws, connected_opt, &[], Some(instruction))?;
        let tools = self.bind_tools(workspace_id, instruction, &connected).await;

        let mut messages = vec![Message::system(system_prompt)];
        if let Some(channel) = delivery_channel {
            messages.push(Message::system(format!(
                "This run was started by a scheduled cron. Its output will be delivered to {}.",
                channel
            )));
        }
        messages.push(Message::user(instruction));

        let result = self
            .agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                messages,
                crate::atoms::types::ModelTier::Default,
                RouteOptions {
                    tools,
                    ..Default::default()
                },
                &mut ctx,
                None,
            )
            .await?;

        ctx.trace.finish(instruction, &result.text);
        Ok(result.text)
    }
}
