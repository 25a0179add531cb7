// Lucy Engine — Session Memory
//
// Three memory tiers, from ephemeral to permanent:
//   1. Thread memory — Slack thread history, loaded from the platform.
//   2. Session memory — key facts persisted at data/session_memory.json,
//      bounded, deduplicated, survives across threads.
//   3. Knowledge memory — company/SKILL.md and team/SKILL.md, injected
//      into every prompt.
//
// Session memory bridges the first and third: facts land here during
// conversation and are promoted to knowledge only by an explicit
// consolidation pass, never mid-turn.

use super::skills::parse_frontmatter;
use super::WorkspaceStore;
use crate::atoms::constants::{SESSION_MEMORY_MAX_ITEMS, SESSION_MEMORY_PROMPT_ITEMS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::SessionFact;
use chrono::Utc;
use log::info;
use regex::Regex;
use std::sync::LazyLock;

pub const SESSION_MEMORY_PATH: &str = "data/session_memory.json";

// ── Extraction signals ─────────────────────────────────────────────────────

static REMEMBER_SIGNALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:remember|note that|keep in mind|fyi|for your reference|going forward|from now on|our (?:target|goal|kpi)|my (?:name|role|email|timezone|preference)|we use|we switched to|our stack|we're moving to|(?:new|updated?) (?:target|goal|deadline|process)|(?:my|our) (?:mrr|revenue|arr|budget|runway) is)\b",
    )
    .expect("remember signal regex")
});

static COMPANY_SIGNALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:our company|we(?:'re| are) (?:a|an)|our product|our service|our (?:mrr|arr|revenue|valuation|headcount|team size)|we use|our stack|we(?:'re| are) (?:based|located)|our (?:clients?|customers?)|(?:founded|started) in)\b",
    )
    .expect("company signal regex")
});

static TEAM_SIGNALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:i|my) (?:name|role|title|email|timezone|tz)|i(?:'m| am) (?:the|a|an|responsible)|(?:works?|working) on|reports? to|new (?:hire|team member|employee)|(?:joined|leaving|left) (?:the )?(?:team|company))\b",
    )
    .expect("team signal regex")
});

/// Quick check: does this message contain facts worth persisting?
pub fn should_persist_memory(message: &str) -> bool {
    REMEMBER_SIGNALS.is_match(message)
}

/// Classify where a fact belongs: "company", "team", or "general".
pub fn classify_memory_target(message: &str) -> &'static str {
    if COMPANY_SIGNALS.is_match(message) {
        "company"
    } else if TEAM_SIGNALS.is_match(message) {
        "team"
    } else {
        "general"
    }
}

// ── Session memory CRUD ────────────────────────────────────────────────────

pub fn read_session_memory(ws: &WorkspaceStore) -> EngineResult<Vec<SessionFact>> {
    match ws.read(SESSION_MEMORY_PATH)? {
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
        None => Ok(Vec::new()),
    }
}

/// Overwrite session memory, keeping only the most recent items.
pub fn write_session_memory(ws: &WorkspaceStore, items: &[SessionFact]) -> EngineResult<()> {
    let start = items.len().saturating_sub(SESSION_MEMORY_MAX_ITEMS);
    let trimmed = &items[start..];
    ws.write(SESSION_MEMORY_PATH, &serde_json::to_string_pretty(trimmed)?)?;
    Ok(())
}

/// Add a fact, deduplicating by case-insensitive content equality.
pub fn add_session_fact(
    ws: &WorkspaceStore,
    fact: &str,
    source: &str,
    category: &str,
) -> EngineResult<()> {
    let mut items = read_session_memory(ws)?;
    let normalized = fact.trim().to_lowercase();
    if items.iter().any(|i| i.fact.trim().to_lowercase() == normalized) {
        return Ok(());
    }

    items.push(SessionFact {
        fact: fact.to_string(),
        source: source.to_string(),
        category: category.to_string(),
        ts: Utc::now().to_rfc3339(),
    });
    write_session_memory(ws, &items)?;
    info!(
        "[workspace] Session fact added ({}, category={})",
        ws.workspace_id(),
        category
    );
    Ok(())
}

/// Format recent session facts for the system prompt.
pub fn session_context_for_prompt(ws: &WorkspaceStore) -> EngineResult<String> {
    let items = read_session_memory(ws)?;
    if items.is_empty() {
        return Ok(String::new());
    }
    let start = items.len().saturating_sub(SESSION_MEMORY_PROMPT_ITEMS);
    let lines: Vec<String> = items[start..]
        .iter()
        .map(|i| format!("• {}", i.fact))
        .collect();
    Ok(format!(
        "### Recent Context (from earlier conversations)\n{}",
        lines.join("\n")
    ))
}

// ── Knowledge promotion ────────────────────────────────────────────────────

const LEARNED_SECTION: &str = "## Learned Context";

fn default_knowledge_file(target: &str) -> String {
    match target {
        "company" => "---\nname: company\ndescription: Company overview, context, and key business information.\n---\n\n# Company Info\n\n(Not yet configured — will be enriched as Lucy learns.)\n".to_string(),
        _ => "---\nname: team\ndescription: Team members, roles, and preferences.\n---\n\n# Team Directory\n\n(Not yet configured — will be enriched as Lucy learns.)\n".to_string(),
    }
}

/// Append a fact to company/SKILL.md or team/SKILL.md under the learned
/// section. Skips facts that are already present verbatim.
pub fn append_to_knowledge(ws: &WorkspaceStore, target: &str, fact: &str) -> EngineResult<()> {
    let path = format!("{}/SKILL.md", target);
    let mut content = ws
        .read(&path)?
        .unwrap_or_else(|| default_knowledge_file(target));

    if content.contains(fact.trim()) {
        return Ok(());
    }

    let stamp = Utc::now().format("%Y-%m-%d");
    if content.contains(LEARNED_SECTION) {
        content.push_str(&format!("\n- {} ({})", fact, stamp));
    } else {
        content.push_str(&format!("\n\n{}\n\n- {} ({})", LEARNED_SECTION, fact, stamp));
    }
    ws.write(&path, &content)?;
    info!("[workspace] {} knowledge updated ({})", target, ws.workspace_id());
    Ok(())
}

/// Promote company/team session facts into permanent knowledge files.
/// Called only from an explicit periodic job, never during a chat turn.
/// Returns the number of facts promoted.
pub fn consolidate_session_to_knowledge(ws: &WorkspaceStore) -> EngineResult<usize> {
    let items = read_session_memory(ws)?;
    let mut promoted = 0;
    let mut remaining = Vec::new();

    for item in items {
        let fact = item.fact.trim();
        if fact.is_empty() {
            continue;
        }
        match item.category.as_str() {
            "company" | "team" => {
                append_to_knowledge(ws, &item.category, fact)?;
                promoted += 1;
            }
            _ => remaining.push(item),
        }
    }

    if promoted > 0 {
        write_session_memory(ws, &remaining)?;
        info!(
            "[workspace] Consolidated {} session facts into knowledge ({})",
            promoted,
            ws.workspace_id()
        );
    }
    Ok(promoted)
}

/// Validate team/company knowledge body (used by the prompt builder).
pub fn knowledge_body(ws: &WorkspaceStore, target: &str) -> EngineResult<String> {
    match ws.read(&format!("{}/SKILL.md", target))? {
        Some(content) => {
            let (_, body) = parse_frontmatter(&content);
            Ok(body)
        }
        None => Ok(String::new()),
    }
}
