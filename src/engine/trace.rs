// Lucy Engine — Request Tracing
//
// Every inbound event gets a Trace: spans with start/end offsets from the
// trace origin, plus request-level metadata (model, intent, tool calls,
// usage). The trace is an explicit value carried in the request context —
// never a process-wide global — and is written exactly once per request:
// a structured log line, plus an optional JSONL append to the workspace's
// per-thread log.

use crate::atoms::types::TokenUsage;
use log::{info, warn};
use serde_json::json;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Span {
    pub name: String,
    pub start_ms: f64,
    pub end_ms: f64,
    pub metadata: serde_json::Value,
}

impl Span {
    pub fn duration_ms(&self) -> f64 {
        if self.end_ms > 0.0 && self.start_ms >= 0.0 {
            ((self.end_ms - self.start_ms) * 10.0).round() / 10.0
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
pub struct Trace {
    pub trace_id: String,
    origin: Instant,
    start_epoch: f64,
    spans: Vec<Span>,

    pub model_used: String,
    pub intent: String,
    pub tool_calls_made: Vec<String>,
    pub user_message: String,
    pub response_text: String,
    pub usage: Option<TokenUsage>,
}

impl Trace {
    pub fn start(trace_id: Option<String>) -> Trace {
        let trace_id = trace_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());
        Trace {
            trace_id,
            origin: Instant::now(),
            start_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            spans: Vec::new(),
            model_used: String::new(),
            intent: String::new(),
            tool_calls_made: Vec::new(),
            user_message: String::new(),
            response_text: String::new(),
            usage: None,
        }
    }

    /// Open a span. Call `close_span` with the returned index when done.
    pub fn open_span(&mut self, name: &str, metadata: serde_json::Value) -> usize {
        let start_ms = self.elapsed_ms();
        self.spans.push(Span {
            name: name.to_string(),
            start_ms,
            end_ms: 0.0,
            metadata,
        });
        self.spans.len() - 1
    }

    pub fn close_span(&mut self, index: usize) {
        let end = self.elapsed_ms();
        if let Some(span) = self.spans.get_mut(index) {
            span.end_ms = end;
        }
    }

    /// Time a synchronous section.
    pub fn record_span(&mut self, name: &str, start_ms: f64, end_ms: f64) {
        self.spans.push(Span {
            name: name.to_string(),
            start_ms,
            end_ms,
            metadata: json!({}),
        });
    }

    pub fn elapsed_ms(&self) -> f64 {
        (self.origin.elapsed().as_secs_f64() * 10_000.0).round() / 10.0
    }

    pub fn total_ms(&self) -> f64 {
        self.elapsed_ms()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Emit the single structured log event for this request and return
    /// the full record.
    pub fn finish(&mut self, user_message: &str, response_text: &str) -> serde_json::Value {
        self.user_message = user_message.to_string();
        self.response_text = response_text.to_string();

        info!(
            "[trace] {} total_ms={:.1} model={} intent={} tools={} spans={}",
            self.trace_id,
            self.total_ms(),
            self.model_used,
            self.intent,
            self.tool_calls_made.len(),
            self.spans.len()
        );
        self.to_record()
    }

    fn to_record(&self) -> serde_json::Value {
        json!({
            "trace_id": self.trace_id,
            "timestamp": self.start_epoch,
            "total_ms": self.total_ms(),
            "model_used": self.model_used,
            "intent": self.intent,
            "tool_calls_made": self.tool_calls_made,
            "user_message": crate::atoms::types::truncate_utf8(&self.user_message, 500),
            "response_text": crate::atoms::types::truncate_utf8(&self.response_text, 500),
            "usage": self.usage.map(|u| json!({
                "prompt_tokens": u.prompt_tokens,
                "completion_tokens": u.completion_tokens,
                "total_tokens": u.total_tokens,
            })),
            "spans": self.spans.iter().map(|s| {
                let mut obj = json!({
                    "name": s.name,
                    "duration_ms": s.duration_ms(),
                });
                if let (Some(target), Some(extra)) = (obj.as_object_mut(), s.metadata.as_object()) {
                    for (k, v) in extra {
                        target.insert(k.clone(), v.clone());
                    }
                }
                obj
            }).collect::<Vec<_>>(),
        })
    }

    /// Append this trace as one JSON line to the workspace's thread log.
    pub fn write_to_thread_log(
        &self,
        workspace_root: &Path,
        workspace_id: &str,
        thread_ts: Option<&str>,
    ) {
        let Some(thread_ts) = thread_ts else {
            return;
        };
        let dir = workspace_root.join(workspace_id).join("logs").join("threads");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("[trace] Thread log dir create failed: {}", e);
            return;
        }
        let safe_ts = thread_ts.replace('.', "_");
        let path = dir.join(format!("{}.jsonl", safe_ts));

        use std::io::Write;
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", self.to_record());
            }
            Err(e) => warn!("[trace] Thread log write failed: {}", e),
        }
    }
}

/// Per-request context threaded through every component. Carries the trace
/// plus the identifiers a component needs to stay workspace-scoped.
#[derive(Debug)]
pub struct RequestContext {
    pub workspace_id: String,
    pub task_id: Option<String>,
    pub thread_ts: Option<String>,
    pub trace: Trace,
}

impl RequestContext {
    pub fn new(workspace_id: &str) -> Self {
        RequestContext {
            workspace_id: workspace_id.to_string(),
            task_id: None,
            thread_ts: None,
            trace: Trace::start(None),
        }
    }
}
