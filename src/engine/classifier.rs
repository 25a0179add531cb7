// Lucy Engine — Tier Classifier
//
// Pure regex/keyword classifier that maps an inbound message to a model
// tier and an intent in under a millisecond. It never decides whether
// tools exist — tool availability comes from the capability index and the
// meta-broker at runtime.
//
// Each rule is a named predicate; rules are evaluated in fixed order and
// the table is exported so tests can enumerate it data-driven.

use crate::atoms::types::{Classification, Intent, ModelTier};
use regex::Regex;
use std::sync::LazyLock;

/// Everything a rule may look at. `prev_turn_tool_calls` distinguishes a
/// confirmation ("thanks, looks good") from a cold greeting.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub text: &'a str,
    pub thread_depth: usize,
    pub prev_turn_tool_calls: bool,
}

impl<'a> ClassifierInput<'a> {
    pub fn new(text: &'a str) -> Self {
        ClassifierInput {
            text,
            thread_depth: 0,
            prev_turn_tool_calls: false,
        }
    }
}

type Rule = fn(&ClassifierInput) -> Option<Classification>;

/// The ordered rule table: (name, predicate). First match wins.
pub fn rules() -> &'static [(&'static str, Rule)] {
    &[
        ("pure_greeting", rule_pure_greeting),
        ("short_deep_thread", rule_short_deep_thread),
        ("bulk_data_processing", rule_bulk_data_processing),
        ("workspace_command", rule_workspace_command),
        ("document_creation", rule_document_creation),
        ("research_signals", rule_research_signals),
        ("code_keywords", rule_code_keywords),
        ("external_data", rule_external_data),
        ("short_check", rule_short_check),
        ("short_simple_question", rule_short_simple_question),
    ]
}

/// Prompt-module names for an intent. The module bodies live in the
/// workspace skill store; these are just the names to look up.
pub fn prompt_modules(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Chat => &["chat"],
        Intent::Lookup => &["lookup"],
        Intent::Confirmation => &["confirmation"],
        Intent::Followup => &["followup"],
        Intent::ToolUse => &["tool_use"],
        Intent::Command => &["command", "integrations"],
        Intent::Code => &["code", "coding"],
        Intent::Reasoning => &["reasoning", "research"],
        Intent::Document => &["document"],
    }
}

/// Classify a message. Deterministic: same input, same output.
pub fn classify(input: &ClassifierInput) -> Classification {
    for (_, rule) in rules() {
        if let Some(result) = rule(input) {
            return result;
        }
    }
    Classification {
        tier: ModelTier::Default,
        intent: Intent::Chat,
    }
}

// ── Pattern sets ───────────────────────────────────────────────────────────

static GREETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:hi|hey|hello|yo|hiya|sup|what'?s up|howdy|good (?:morning|afternoon|evening))(?:\s+(?:lucy|there|everyone|team))?[!.\s]*$",
    )
    .expect("greeting regex")
});

static ACTION_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:create|make|send|post|draft|write|schedule|delete|remove|cancel|update|set up|deploy|generate|build)\b",
    )
    .expect("action verb regex")
});

static BULK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:bulk|batch|all (?:rows|records|entries|items)|every (?:row|record|entry)|dedupe|deduplicate|csv|process (?:the|this) data|across all)\b",
    )
    .expect("bulk regex")
});

static ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:cron|crons|reminder|skill|automation|background service|integration setup)\b")
        .expect("artifact regex")
});

static DOCUMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:document|doc|report|proposal|memo|pdf|slide|deck|presentation|spreadsheet|invoice)\b")
        .expect("document regex")
});

static RESEARCH_HEAVY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:deep dive|comprehensive|in-depth|thorough(?:ly)?|research|investigate|market analysis|competitive landscape)\b")
        .expect("research heavy regex")
});

static RESEARCH_LIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:compare|pros and cons|evaluate|options|versus|vs\.?|trade-?offs?|alternatives|strategy|analy[sz]e)\b")
        .expect("research light regex")
});

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:code|script|python|bash|typescript|javascript|rust|debug|refactor|function|class|import|docker|kubernetes|ci/cd|sql|html|css|regex|api endpoint|stack ?trace)\b",
    )
    .expect("code regex")
});

static EXTERNAL_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:calendar|meeting|event|email|inbox|gmail|drive|docs?|sheet|issue|ticket|github|linear|jira|notion|crm|deploy(?:ment)?|channel|pr|pull request)\b",
    )
    .expect("external data regex")
});

static CHECK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:check|verify|confirm|is |are |did |does |status of|any )").expect("check regex")
});

static QUESTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:what|who|when|where|why|how|which)\b").expect("question regex"));

// ── Rules, in order ────────────────────────────────────────────────────────

/// 1. Pure greeting → fast chat; after a tool-calling turn it reads as a
///    confirmation and stays on the default tier.
fn rule_pure_greeting(input: &ClassifierInput) -> Option<Classification> {
    if !GREETING_RE.is_match(input.text.trim()) {
        return None;
    }
    Some(if input.prev_turn_tool_calls {
        Classification { tier: ModelTier::Default, intent: Intent::Confirmation }
    } else {
        Classification { tier: ModelTier::Fast, intent: Intent::Chat }
    })
}

/// 2. Short message deep in a thread → fast follow-up, unless the previous
///    turn called tools or this one carries an action verb.
fn rule_short_deep_thread(input: &ClassifierInput) -> Option<Classification> {
    if input.text.len() >= 50 || input.thread_depth <= 5 {
        return None;
    }
    Some(
        if input.prev_turn_tool_calls || ACTION_VERB_RE.is_match(input.text) {
            Classification { tier: ModelTier::Default, intent: Intent::Followup }
        } else {
            Classification { tier: ModelTier::Fast, intent: Intent::Followup }
        },
    )
}

/// 3. Bulk/data-processing keywords → code intent on the default tier.
fn rule_bulk_data_processing(input: &ClassifierInput) -> Option<Classification> {
    BULK_RE.is_match(input.text).then_some(Classification {
        tier: ModelTier::Default,
        intent: Intent::Code,
    })
}

/// Action verb aimed at one of Lucy's own artifacts (crons, skills,
/// services, integrations) → a command against the workspace itself.
fn rule_workspace_command(input: &ClassifierInput) -> Option<Classification> {
    (ACTION_VERB_RE.is_match(input.text) && ARTIFACT_RE.is_match(input.text)).then_some(
        Classification {
            tier: ModelTier::Default,
            intent: Intent::Command,
        },
    )
}

/// 4. Document creation = document term + action verb.
fn rule_document_creation(input: &ClassifierInput) -> Option<Classification> {
    (DOCUMENT_RE.is_match(input.text) && ACTION_VERB_RE.is_match(input.text)).then_some(
        Classification {
            tier: ModelTier::Document,
            intent: Intent::Document,
        },
    )
}

/// 5. Heavy research signal, or three light ones, → research tier.
fn rule_research_signals(input: &ClassifierInput) -> Option<Classification> {
    let light_hits = RESEARCH_LIGHT_RE.find_iter(input.text).count();
    (RESEARCH_HEAVY_RE.is_match(input.text) || light_hits >= 3).then_some(Classification {
        tier: ModelTier::Research,
        intent: Intent::Reasoning,
    })
}

/// 6. Code keywords, unless it's a short check ("did the deploy script run?").
fn rule_code_keywords(input: &ClassifierInput) -> Option<Classification> {
    if !CODE_RE.is_match(input.text) {
        return None;
    }
    if input.text.len() < 80 && CHECK_RE.is_match(input.text.trim()) {
        return None;
    }
    Some(Classification {
        tier: ModelTier::Code,
        intent: Intent::Code,
    })
}

/// 7. External-data keywords → tool use on the default tier.
fn rule_external_data(input: &ClassifierInput) -> Option<Classification> {
    EXTERNAL_DATA_RE.is_match(input.text).then_some(Classification {
        tier: ModelTier::Default,
        intent: Intent::ToolUse,
    })
}

/// 8. Short check/verify phrasing → tool use on the default tier.
fn rule_short_check(input: &ClassifierInput) -> Option<Classification> {
    (input.text.len() < 80 && CHECK_RE.is_match(input.text.trim())).then_some(Classification {
        tier: ModelTier::Default,
        intent: Intent::ToolUse,
    })
}

/// 9. Very short simple question with no data-source term → fast lookup.
fn rule_short_simple_question(input: &ClassifierInput) -> Option<Classification> {
    let word_count = input.text.split_whitespace().count();
    (word_count <= 8
        && QUESTION_RE.is_match(input.text.trim())
        && !EXTERNAL_DATA_RE.is_match(input.text))
    .then_some(Classification {
        tier: ModelTier::Fast,
        intent: Intent::Lookup,
    })
}
