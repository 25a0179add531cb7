// Lucy Engine — Agent Loop
//
// The core orchestration loop: send messages to the model, execute the
// tool calls it makes, feed the observations back, repeat until it
// produces a tool-free reply or a guard fires.
//
// Termination guards (any one ends the run):
//   • iteration cap
//   • identical tool-call batch three times in a row
//   • wall-clock cap
//   • an all-error batch immediately re-issued unchanged
//   • cooperative cancellation

use crate::atoms::constants::{
    CONTEXT_KEEP_MESSAGES, MAX_ITERATIONS, MAX_REPEATED_SIGNATURES, RUN_WALL_CLOCK_CAP,
};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{FunctionCall, Message, ModelTier, Role, ToolCall, ToolStatus};
use crate::engine::hitl::DestructivePolicy;
use crate::engine::output;
use crate::engine::router::{ModelRouter, RouteOptions};
use crate::engine::tasks::CancellationFlag;
use crate::engine::tool_executor::{canonical_signature, ToolExecutor};
use crate::engine::trace::RequestContext;
use crate::engine::workspace::WorkspaceStore;
use log::{info, warn};
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

/// Why a run ended. Carried alongside the final text so the pipeline can
/// decide what (if anything) to post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    MaxIterations,
    LoopDetected,
    WallClock,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub text: String,
    pub stop_reason: StopReason,
    pub iterations: u32,
}

pub struct AgentLoop {
    router: Arc<ModelRouter>,
    executor: Arc<ToolExecutor>,
}

impl AgentLoop {
    pub fn new(router: Arc<ModelRouter>, executor: Arc<ToolExecutor>) -> Self {
        AgentLoop { router, executor }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        ws: &WorkspaceStore,
        policy: &DestructivePolicy,
        mut messages: Vec<Message>,
        tier: ModelTier,
        mut route_opts: RouteOptions,
        ctx: &mut RequestContext,
        cancel: Option<&CancellationFlag>,
    ) -> EngineResult<AgentRunResult> {
        let started = Instant::now();
        let mut batch_signatures: Vec<u64> = Vec::new();
        let mut prev_batch: Option<(u64, bool)> = None; // (signature, all_errors)

        route_opts.workspace_id = Some(ws.workspace_id().to_string());
        route_opts.task_id = ctx.task_id.clone();

        for iteration in 1..=MAX_ITERATIONS {
            if let Some(flag) = cancel {
                if flag.is_cancelled() {
                    info!("[agent] Run cancelled at iteration {}", iteration);
                    return Ok(AgentRunResult {
                        text: String::new(),
                        stop_reason: StopReason::Cancelled,
                        iterations: iteration - 1,
                    });
                }
            }

            if started.elapsed() > RUN_WALL_CLOCK_CAP {
                warn!("[agent] Wall-clock cap hit at iteration {}", iteration);
                return Ok(AgentRunResult {
                    text: "This is taking longer than it should, so I stopped here. \
                           I can pick it back up if you want — just say so."
                        .to_string(),
                    stop_reason: StopReason::WallClock,
                    iterations: iteration - 1,
                });
            }

            trim_context(&mut messages);

            info!(
                "[agent] Iteration {}/{} ({} messages)",
                iteration,
                MAX_ITERATIONS,
                messages.len()
            );

            let span = ctx.trace.open_span("llm_call", json!({"iteration": iteration}));
            let response = self.router.route(&messages, tier, &route_opts).await;
            ctx.trace.close_span(span);

            let response = response?;
            ctx.trace.model_used = response.model.clone();
            if let Some(usage) = response.usage {
                ctx.trace.usage = Some(usage);
            }

            // ── Tool-free reply: we're done ────────────────────────────
            if !response.has_tool_calls() {
                let text = output::process_output(&response.content);
                return Ok(AgentRunResult {
                    text,
                    stop_reason: StopReason::Completed,
                    iterations: iteration,
                });
            }

            // Record issued calls in the trace before any guard fires, so
            // observability sees what the model attempted.
            for call in &response.tool_calls {
                ctx.trace.tool_calls_made.push(call.name.clone());
            }

            // Append the assistant turn (with its calls) to history.
            messages.push(Message {
                role: Role::Assistant,
                content: response.content.clone(),
                tool_calls: Some(
                    response
                        .tool_calls
                        .iter()
                        .map(|call| ToolCall {
                            id: call.id.clone(),
                            call_type: "function".into(),
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.parameters.to_string(),
                            },
                        })
                        .collect(),
                ),
                tool_call_id: None,
                name: None,
            });

            // ── Repetition guard ───────────────────────────────────────
            let signature = batch_fingerprint(&response.tool_calls);
            batch_signatures.push(signature);
            let len = batch_signatures.len();
            if len >= MAX_REPEATED_SIGNATURES
                && batch_signatures[len - MAX_REPEATED_SIGNATURES..]
                    .iter()
                    .all(|&s| s == signature)
            {
                warn!(
                    "[agent] Same tool batch issued {} times — breaking loop",
                    MAX_REPEATED_SIGNATURES
                );
                return Ok(AgentRunResult {
                    text: "I appear to be looping — I've tried the same tool call several \
                           times without getting anywhere. Could you rephrase the request \
                           or narrow it down?"
                        .to_string(),
                    stop_reason: StopReason::LoopDetected,
                    iterations: iteration,
                });
            }

            // ── All-errors-then-retry guard ────────────────────────────
            if let Some((prev_sig, all_errors)) = prev_batch {
                if all_errors && prev_sig == signature {
                    warn!("[agent] Re-issued an all-error batch unchanged — stopping");
                    return Ok(AgentRunResult {
                        text: "Every attempt at that tool call failed and retrying the same \
                               way won't help. Want me to try a different approach?"
                            .to_string(),
                        stop_reason: StopReason::LoopDetected,
                        iterations: iteration,
                    });
                }
            }

            // ── Execute the batch ──────────────────────────────────────
            let span = ctx
                .trace
                .open_span("tool_batch", json!({"count": response.tool_calls.len()}));
            let outcomes = self
                .executor
                .execute_batch(ws, policy, &response.tool_calls)
                .await;
            ctx.trace.close_span(span);

            let all_errors =
                !outcomes.is_empty() && outcomes.iter().all(|o| o.status == ToolStatus::Error);
            prev_batch = Some((signature, all_errors));

            for outcome in outcomes {
                messages.push(Message::tool_result(
                    &outcome.call_id,
                    &outcome.tool_name,
                    outcome.output,
                ));
            }
        }

        warn!("[agent] Max iterations ({}) reached", MAX_ITERATIONS);
        Ok(AgentRunResult {
            text: format!(
                "I used up my {} working steps before I could wrap this up. The partial \
                 work is done — ask me to continue and I'll pick up from here.",
                MAX_ITERATIONS
            ),
            stop_reason: StopReason::MaxIterations,
            iterations: MAX_ITERATIONS,
        })
    }
}

/// Keep the system prompt plus the most recent non-system messages.
fn trim_context(messages: &mut Vec<Message>) {
    let non_system = messages.iter().filter(|m| m.role != Role::System).count();
    if non_system <= CONTEXT_KEEP_MESSAGES {
        return;
    }
    let mut to_drop = non_system - CONTEXT_KEEP_MESSAGES;
    messages.retain(|m| {
        if m.role != Role::System && to_drop > 0 {
            to_drop -= 1;
            false
        } else {
            true
        }
    });
}

/// Order-insensitive fingerprint of a tool-call batch.
fn batch_fingerprint(calls: &[crate::atoms::types::ParsedToolCall]) -> u64 {
    let mut parts: Vec<String> = calls
        .iter()
        .map(|c| canonical_signature(&c.name, &c.parameters))
        .collect();
    parts.sort();
    let mut hasher = DefaultHasher::new();
    for part in &parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ParsedToolCall, TokenUsage, ToolDefinition};
    use crate::engine::hitl::HitlRegistry;
    use crate::engine::http::BreakerRegistry;
    use crate::engine::providers::{ChatProvider, ProviderError, ProviderReply};
    use crate::engine::tools::{broker::BrokerClient, builtin::BuiltinTools, ToolSuite};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Scripted provider: pops one reply per call.
    struct ScriptedProvider {
        replies: Mutex<Vec<ProviderReply>>,
    }

    impl ScriptedProvider {
        fn new(mut replies: Vec<ProviderReply>) -> Self {
            replies.reverse();
            ScriptedProvider {
                replies: Mutex::new(replies),
            }
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
            self.replies
                .lock()
                .pop()
                .ok_or_else(|| ProviderError::Transport("script exhausted".into()))
        }
    }

    fn tool_reply(name: &str, args: &str) -> ProviderReply {
        ProviderReply {
            content: String::new(),
            tool_calls: vec![crate::atoms::types::ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                call_type: "function".into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: args.into(),
                },
            }],
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
                total_tokens: 110,
            }),
            model: "stub-model".into(),
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

    fn harness(replies: Vec<ProviderReply>) -> (AgentLoop, tempfile::TempDir, WorkspaceStore) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();

        let (cron_tx, _cron_rx) = tokio::sync::mpsc::unbounded_channel();
        let builtin = BuiltinTools::new(provider.clone(), None, cron_tx);
        let suite = Arc::new(ToolSuite::new(
            Arc::new(BrokerClient::new("https://broker.invalid", "")),
            None,
            builtin,
        ));
        let executor = Arc::new(ToolExecutor::new(
            suite,
            Arc::new(HitlRegistry::new()),
            Arc::new(BreakerRegistry::new()),
        ));
        let router = Arc::new(ModelRouter::new(
            provider,
            tmp.path().join("assets"),
            tmp.path().to_path_buf(),
        ));
        (AgentLoop::new(router, executor), tmp, ws)
    }

    #[tokio::test]
    async fn test_plain_reply_is_processed() {
        let (agent, _tmp, ws) = harness(vec![text_reply("Certainly! The meeting is at 3pm.")]);
        let mut ctx = RequestContext::new("T1");
        let result = agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                vec![Message::user("when is the meeting?")],
                ModelTier::Default,
                RouteOptions::default(),
                &mut ctx,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.text, "The meeting is at 3pm.");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_tool_then_reply() {
        let args = r#"{"fact": "MRR is $42k", "category": "company"}"#;
        let (agent, _tmp, ws) = harness(vec![
            tool_reply("lucy_remember", args),
            text_reply("Noted."),
        ]);
        let mut ctx = RequestContext::new("T1");
        let result = agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                vec![Message::user("remember our MRR is $42k")],
                ModelTier::Default,
                RouteOptions::default(),
                &mut ctx,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(ctx.trace.tool_calls_made, vec!["lucy_remember"]);
        // The fact actually landed in session memory.
        let facts = crate::engine::workspace::memory::read_session_memory(&ws).unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[tokio::test]
    async fn test_loop_guard_after_three_identical_batches() {
        let args = r#"{"fact": "same fact"}"#;
        let (agent, _tmp, ws) = harness(vec![
            tool_reply("lucy_remember", args),
            tool_reply("lucy_remember", args),
            tool_reply("lucy_remember", args),
            text_reply("should never be reached"),
        ]);
        let mut ctx = RequestContext::new("T1");
        let result = agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                vec![Message::user("go")],
                ModelTier::Default,
                RouteOptions::default(),
                &mut ctx,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::LoopDetected);
        assert!(result.text.contains("looping"));
        assert_eq!(ctx.trace.tool_calls_made.len(), 3);
        assert!(ctx.trace.tool_calls_made.iter().all(|n| n == "lucy_remember"));
    }

    #[tokio::test]
    async fn test_max_iterations_guard() {
        // Six distinct tool batches, never a text reply.
        let replies: Vec<ProviderReply> = (0..MAX_ITERATIONS)
            .map(|i| tool_reply("lucy_remember", &format!(r#"{{"fact": "fact {}"}}"#, i)))
            .collect();
        let (agent, _tmp, ws) = harness(replies);
        let mut ctx = RequestContext::new("T1");
        let result = agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                vec![Message::user("go")],
                ModelTier::Default,
                RouteOptions::default(),
                &mut ctx,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::MaxIterations);
        assert_eq!(result.iterations, MAX_ITERATIONS);
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let (agent, _tmp, ws) = harness(vec![text_reply("never")]);
        let flag = CancellationFlag::default();
        flag.cancel();
        let mut ctx = RequestContext::new("T1");
        let result = agent
            .run(
                &ws,
                &DestructivePolicy::default(),
                vec![Message::user("go")],
                ModelTier::Default,
                RouteOptions::default(),
                &mut ctx,
                Some(&flag),
            )
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_trim_context_keeps_system() {
        let mut messages = vec![Message::system("system prompt")];
        for i in 0..60 {
            messages.push(Message::user(format!("message {}", i)));
        }
        trim_context(&mut messages);
        assert_eq!(messages[0].role, Role::System);
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        assert_eq!(non_system, CONTEXT_KEEP_MESSAGES);
        // Most recent survive.
        assert_eq!(messages.last().unwrap().content, "message 59");
    }

    #[test]
    fn test_batch_fingerprint_order_insensitive() {
        let a = vec![
            ParsedToolCall {
                id: "1".into(),
                name: "A".into(),
                parameters: json!({"x": 1}),
                parse_error: None,
            },
            ParsedToolCall {
                id: "2".into(),
                name: "B".into(),
                parameters: json!({}),
                parse_error: None,
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(batch_fingerprint(&a), batch_fingerprint(&b));
    }
}
