// Lucy Engine — Fast Path
//
// "Hi Lucy" must not pay for workspace setup, tool retrieval, prompt
// assembly, and a frontier model call. A lightweight matcher intercepts
// trivial messages BEFORE the agent loop and answers from the pre-warmed
// message pools in well under a second.
//
// What qualifies:
//   1. Pure greetings: "hi", "hello", "hey"
//   2. Status checks: "are you there?", "ping"
//   3. Help asks: "what can you do?"
//
// What does NOT qualify:
//   - Anything longer than 60 characters
//   - Anything inside a thread (needs conversation context)
//   - Anything with data keywords ("check my calendar")

use crate::atoms::constants::FAST_PATH_MAX_CHARS;
use crate::engine::humanize::MessagePools;
use log::info;
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq)]
pub struct FastPathResult {
    pub is_fast: bool,
    pub response: Option<String>,
    pub reason: &'static str,
}

impl FastPathResult {
    fn not_fast(reason: &'static str) -> Self {
        FastPathResult {
            is_fast: false,
            response: None,
            reason,
        }
    }
}

static GREETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:hi|hey|hello|yo|hiya|sup|what'?s up|howdy|good (?:morning|afternoon|evening))(?:\s+(?:lucy|there|everyone|team))?[!.\s]*$",
    )
    .expect("greeting regex")
});

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:are you (?:there|online|up|available|awake)\??|you (?:there|up|online|around)\??|ping|status|alive\??)[!.\s]*$",
    )
    .expect("status regex")
});

static HELP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:help|what can you do\??|what do you do\??|how do you work\??|what are you\??|who are you\??)[!.\s]*$",
    )
    .expect("help regex")
});

/// Evaluate whether a message can be answered without the agent loop.
/// An empty message gets the help reply — there is nothing to reason about.
pub fn evaluate(message: &str, thread_depth: usize, pools: &MessagePools) -> FastPathResult {
    let text = message.trim();

    if thread_depth > 0 {
        return FastPathResult::not_fast("in_thread");
    }
    if text.len() > FAST_PATH_MAX_CHARS {
        return FastPathResult::not_fast("too_long");
    }

    if text.is_empty() {
        return fast("help", pools);
    }
    if GREETING_RE.is_match(text) {
        return fast("greeting", pools);
    }
    if STATUS_RE.is_match(text) {
        return fast("status", pools);
    }
    if HELP_RE.is_match(text) {
        return fast("help", pools);
    }

    FastPathResult::not_fast("no_match")
}

fn fast(category: &'static str, pools: &MessagePools) -> FastPathResult {
    info!("[fast-path] Matched '{}'", category);
    FastPathResult {
        is_fast: true,
        response: Some(pools.pick(category)),
        reason: category,
    }
}
