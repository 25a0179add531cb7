// Lucy Engine — Output Processing
//
// Two passes over the model's final text before it reaches Slack:
//
//   1. De-AI: strip the tells that make a reply read like a chatbot —
//      em dashes, opening hedges, chatbot closers, essay transitions.
//   2. Block Kit structuring: when the text carries structure signals
//      (headers, dividers, bullet runs) convert it into section/header/
//      divider blocks; otherwise leave it as plain text.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

// ── De-AI ──────────────────────────────────────────────────────────────────

static OPENING_HEDGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:certainly|sure thing|sure|of course|great question|absolutely|i'd be happy to help)[!.,]?\s+",
    )
    .expect("opening hedge regex")
});

static CHATBOT_CLOSERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*(?:hope (?:this|that) helps[!.]?|let me know if (?:you (?:need|have|want)|there'?s) [^.!\n]*[!.]?|feel free to [^.!\n]*[!.]?|is there anything else [^?\n]*\?)\s*$",
    )
    .expect("chatbot closer regex")
});

static TRANSITIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|\n)(?:furthermore|moreover|additionally|in conclusion|it(?:'s| is) worth noting that|it(?:'s| is) important to note that)[, ]\s*",
    )
    .expect("transition regex")
});

/// Categories of AI tells detected in a reply. Useful for diagnostics
/// and regression tests; removal happens in `process_output`.
pub fn detect_ai_tells(text: &str) -> Vec<(&'static str, String)> {
    let mut tells = Vec::new();
    if text.contains('—') {
        tells.push(("em_dash", "—".to_string()));
    }
    if let Some(m) = OPENING_HEDGES.find(text) {
        tells.push(("opening_hedge", m.as_str().trim().to_string()));
    }
    if let Some(m) = CHATBOT_CLOSERS.find(text) {
        tells.push(("chatbot_closer", m.as_str().trim().to_string()));
    }
    if let Some(m) = TRANSITIONS.find(text) {
        tells.push(("transition", m.as_str().trim().to_string()));
    }
    tells
}

/// Regex-driven de-AI pass. Order matters: closers are anchored at the
/// end, so strip them before whitespace cleanup.
pub fn process_output(text: &str) -> String {
    let mut result = text.to_string();

    // Em dash reads as generated prose; a comma keeps the cadence.
    result = result.replace(" — ", ", ").replace('—', ", ");

    result = OPENING_HEDGES.replace(&result, "").to_string();

    // Closers can stack ("Hope this helps! Let me know…") — run to fixpoint.
    loop {
        let stripped = CHATBOT_CLOSERS.replace(&result, "").to_string();
        if stripped == result {
            break;
        }
        result = stripped;
    }

    result = TRANSITIONS.replace_all(&result, "\n").to_string();

    result.trim().to_string()
}

// ── Block Kit structuring ──────────────────────────────────────────────────

/// Max characters per mrkdwn section (Slack's limit is 3000).
const SECTION_CHAR_LIMIT: usize = 3000;

/// Does the text justify structured blocks?
fn has_structure_signals(text: &str) -> bool {
    let mut bullet_run = 0;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("# ") || trimmed.starts_with("## ") || trimmed == "---" {
            return true;
        }
        if trimmed.starts_with("- ") || trimmed.starts_with("• ") || trimmed.starts_with("* ") {
            bullet_run += 1;
            if bullet_run >= 3 {
                return true;
            }
        } else if !trimmed.is_empty() {
            bullet_run = 0;
        }
    }
    false
}

/// Convert text into Slack Block Kit blocks when structure signals exist.
/// Returns None for plain conversational replies.
pub fn to_blocks(text: &str) -> Option<Value> {
    if !has_structure_signals(text) {
        return None;
    }

    let mut blocks: Vec<Value> = Vec::new();
    let mut section = String::new();

    let flush = |section: &mut String, blocks: &mut Vec<Value>| {
        let body = section.trim();
        if !body.is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": crate::atoms::types::truncate_utf8(body, SECTION_CHAR_LIMIT),
                }
            }));
        }
        section.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(header) = trimmed.strip_prefix("## ").or_else(|| trimmed.strip_prefix("# ")) {
            flush(&mut section, &mut blocks);
            blocks.push(json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": crate::atoms::types::truncate_utf8(header.trim(), 150),
                    "emoji": true,
                }
            }));
        } else if trimmed == "---" {
            flush(&mut section, &mut blocks);
            blocks.push(json!({ "type": "divider" }));
        } else {
            section.push_str(line);
            section.push('\n');
            if section.len() > SECTION_CHAR_LIMIT {
                flush(&mut section, &mut blocks);
            }
        }
    }
    flush(&mut section, &mut blocks);

    (!blocks.is_empty()).then(|| json!(blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_em_dash_removed() {
        let cleaned = process_output("Here is the data—as requested.");
        assert!(!cleaned.contains('—'));
        assert!(cleaned.contains("data, as requested"));
    }

    #[test]
    fn test_opening_hedge_stripped() {
        let cleaned = process_output("Certainly! The meeting is at 3pm.");
        assert_eq!(cleaned, "The meeting is at 3pm.");
    }

    #[test]
    fn test_closers_removed_to_fixpoint() {
        let text = "Here are the numbers:\n- 42 signups\n\nHope this helps! Let me know if you need anything else!";
        let cleaned = process_output(text);
        assert!(!cleaned.contains("Hope this helps"));
        assert!(!cleaned.contains("Let me know"));
        assert!(cleaned.contains("42 signups"));
    }

    #[test]
    fn test_transitions_trimmed() {
        let cleaned = process_output("Furthermore, it's crucial to look at churn.");
        assert!(!cleaned.contains("Furthermore"));
        assert!(cleaned.contains("it's crucial to look at churn."));
    }

    #[test]
    fn test_detect_tells() {
        let tells = detect_ai_tells("Sure! Here's data—done. Hope this helps!");
        let categories: Vec<&str> = tells.iter().map(|(c, _)| *c).collect();
        assert!(categories.contains(&"em_dash"));
        assert!(categories.contains(&"opening_hedge"));
        assert!(categories.contains(&"chatbot_closer"));
    }

    #[test]
    fn test_plain_text_no_blocks() {
        assert!(to_blocks("The meeting is at 3pm.").is_none());
    }

    #[test]
    fn test_headers_and_dividers_become_blocks() {
        let text = "# Weekly Digest\nAll good.\n---\n- one\n- two\n- three";
        let blocks = to_blocks(text).unwrap();
        let kinds: Vec<&str> = blocks
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds[0], "header");
        assert!(kinds.contains(&"divider"));
        assert!(kinds.contains(&"section"));
    }

    #[test]
    fn test_bullet_run_triggers_blocks() {
        let text = "- a\n- b\n- c\n- d";
        assert!(to_blocks(text).is_some());
    }
}
