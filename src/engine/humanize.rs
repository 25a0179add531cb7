// Lucy Engine — Message Pools
//
// Fast-path replies and degradation lines come from pre-warmed pools of
// LLM-generated variations so Lucy never sounds like a canned bot. Pools
// are filled once at startup by a fast-tier call; until they're ready,
// literal defaults keep every category answerable.

use crate::atoms::types::Message;
use crate::engine::providers::ChatProvider;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const WARM_MODEL: &str = "google/gemini-2.5-flash";
const VARIATIONS_PER_CATEGORY: usize = 6;

/// (category, default line, what the warmer should generate)
const CATEGORIES: [(&str, &str, &str); 8] = [
    ("greeting", "Hey! What can I do for you?", "a short friendly greeting reply"),
    ("status", "I'm here! What do you need?", "a short 'yes I'm online' reply"),
    (
        "help",
        "I can check your calendar, dig through email, file issues, run research, and automate recurring work. What do you need?",
        "a short summary of what an AI coworker can do, inviting a request",
    ),
    (
        "working",
        "On it — give me a moment.",
        "a short 'working on it' acknowledgment",
    ),
    (
        "error_rate_limit",
        "I'm getting rate limited right now. Give me a minute and try again?",
        "a warm apology that a service is rate limiting us, suggesting a brief wait",
    ),
    (
        "error_timeout",
        "That's taking longer than it should. Mind trying again in a bit?",
        "a warm apology that something timed out",
    ),
    (
        "error_connection",
        "One of my services is having a moment. I'll be back shortly.",
        "a warm apology that an external service seems down",
    ),
    (
        "error_generic",
        "Something went sideways on my end. Try that again?",
        "a warm generic apology that something went wrong",
    ),
];

pub struct MessagePools {
    pools: Mutex<HashMap<String, Vec<String>>>,
    cursor: AtomicUsize,
}

impl Default for MessagePools {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePools {
    pub fn new() -> Self {
        MessagePools {
            pools: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick a line for a category. Rotates through the warmed pool;
    /// falls back to the literal default when pools aren't ready.
    pub fn pick(&self, category: &str) -> String {
        let pools = self.pools.lock();
        if let Some(lines) = pools.get(category) {
            if !lines.is_empty() {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % lines.len();
                return lines[idx].clone();
            }
        }
        CATEGORIES
            .iter()
            .find(|(name, _, _)| *name == category)
            .map(|(_, default, _)| default.to_string())
            .unwrap_or_else(|| "Something went sideways on my end. Try that again?".to_string())
    }

    pub fn is_warmed(&self, category: &str) -> bool {
        self.pools
            .lock()
            .get(category)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Replace a category's pool (used by the warmer and by tests).
    pub fn set_pool(&self, category: &str, lines: Vec<String>) {
        self.pools.lock().insert(category.to_string(), lines);
    }

    /// Warm every category with LLM-generated variations. Runs in the
    /// background at startup; failures leave the defaults in place.
    pub async fn warm(&self, provider: Arc<dyn ChatProvider>) {
        for (category, _, instruction) in CATEGORIES {
            let prompt = format!(
                "Generate {} distinct variations of {}. Lucy is a direct, warm AI coworker in \
                 Slack — casual, no emoji spam, no exclamation overload. Reply with ONLY a JSON \
                 array of strings.",
                VARIATIONS_PER_CATEGORY, instruction
            );
            let messages = vec![Message::user(prompt)];
            match provider.chat(WARM_MODEL, &messages, &[], 1024, 0.9).await {
                Ok(reply) => {
                    if let Some(lines) = parse_variations(&reply.content) {
                        info!("[humanize] Warmed pool '{}' ({} lines)", category, lines.len());
                        self.set_pool(category, lines);
                    } else {
                        warn!("[humanize] Could not parse variations for '{}'", category);
                    }
                }
                Err(e) => {
                    warn!("[humanize] Pool warm failed for '{}': {}", category, e);
                }
            }
        }
    }
}

fn parse_variations(content: &str) -> Option<Vec<String>> {
    // Models sometimes wrap the array in a code fence.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let lines: Vec<String> = value
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!lines.is_empty()).then_some(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_before_warm() {
        let pools = MessagePools::new();
        assert!(!pools.is_warmed("greeting"));
        assert_eq!(pools.pick("greeting"), "Hey! What can I do for you?");
        assert!(!pools.pick("unknown-category").is_empty());
    }

    #[test]
    fn test_rotation_after_warm() {
        let pools = MessagePools::new();
        pools.set_pool("greeting", vec!["a".into(), "b".into()]);
        let first = pools.pick("greeting");
        let second = pools.pick("greeting");
        assert_ne!(first, second);
    }

    #[test]
    fn test_parse_variations_with_fence() {
        let content = "```json\n[\"hey there\", \"hi!\"]\n```";
        assert_eq!(parse_variations(content).unwrap().len(), 2);
        assert!(parse_variations("not json").is_none());
    }
}
