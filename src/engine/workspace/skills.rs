// Lucy Engine — Skill System
//
// Skills are markdown files with a frontmatter block:
//     ---
//     name: my-skill
//     description: Does X. Use when Y.
//     ---
//     Full instructions go here...
//
// They live at skills/{slug}/SKILL.md plus the two well-known files
// company/SKILL.md and team/SKILL.md. Read-through: nothing caches skill
// content between requests.

use super::WorkspaceStore;
use crate::atoms::constants::{
    MAX_INJECTED_SKILLS, MAX_SKILL_CONTENT_CHARS, MIN_REMAINING_FOR_TRUNCATION,
};
use crate::atoms::error::EngineResult;
use crate::atoms::types::SkillInfo;
use log::info;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const FRONTMATTER_DELIMITER: &str = "---";

/// Visible marker appended when injected skill content had to be cut.
pub const TRUNCATION_MARKER: &str = "\n\n[... truncated for brevity]";

// ── Frontmatter ────────────────────────────────────────────────────────────

/// Extract frontmatter key/values and the body from a SKILL.md file.
/// Only flat `key: value` pairs are recognized; anything else is ignored.
pub fn parse_frontmatter(content: &str) -> (HashMap<String, String>, String) {
    let stripped = content.trim_start();
    if !stripped.starts_with(FRONTMATTER_DELIMITER) {
        return (HashMap::new(), content.to_string());
    }

    let after_open = &stripped[FRONTMATTER_DELIMITER.len()..];
    let Some(close) = after_open.find("\n---") else {
        return (HashMap::new(), content.to_string());
    };

    let block = &after_open[..close];
    let body = after_open[close + 4..].trim().to_string();

    let mut metadata = HashMap::new();
    for line in block.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }
    (metadata, body)
}

// ── Discovery ──────────────────────────────────────────────────────────────

/// Discover all SKILL.md files in the workspace and parse their frontmatter.
/// Skills without a description are skipped — they can't be surfaced.
pub fn list_skills(ws: &WorkspaceStore) -> EngineResult<Vec<SkillInfo>> {
    let mut skills = Vec::new();

    for search_dir in ["skills", "company", "team"] {
        collect_skills(ws, search_dir, &mut skills)?;
    }
    Ok(skills)
}

fn collect_skills(ws: &WorkspaceStore, dir: &str, out: &mut Vec<SkillInfo>) -> EngineResult<()> {
    for entry in ws.list(dir)? {
        if entry.ends_with('/') {
            collect_skills(ws, entry.trim_end_matches('/'), out)?;
        } else if entry.ends_with("SKILL.md") {
            let Some(content) = ws.read(&entry)? else {
                continue;
            };
            let (meta, _) = parse_frontmatter(&content);
            let fallback = entry
                .rsplit('/')
                .nth(1)
                .unwrap_or("skill")
                .to_string();
            let name = meta.get("name").cloned().unwrap_or(fallback);
            let Some(description) = meta.get("description").cloned() else {
                continue;
            };
            out.push(SkillInfo {
                name,
                description,
                path: entry,
            });
        }
    }
    Ok(())
}

/// Create or update a skill file. Returns its relative path.
pub fn write_skill(
    ws: &WorkspaceStore,
    skill_name: &str,
    content: &str,
    subdirectory: &str,
) -> EngineResult<String> {
    let rel_path = format!("{}/{}/SKILL.md", subdirectory, skill_name);
    ws.write(&rel_path, content)?;
    info!(
        "[workspace] Skill written: {} ({})",
        skill_name,
        ws.workspace_id()
    );
    Ok(rel_path)
}

/// Format all skill names + descriptions for the {available_skills} slot.
pub fn skill_descriptions_for_prompt(ws: &WorkspaceStore) -> EngineResult<String> {
    let mut skills = list_skills(ws)?;
    if skills.is_empty() {
        return Ok("(No skills loaded yet)".to_string());
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills
        .iter()
        .map(|s| format!("- {}: {}", s.name, s.description))
        .collect::<Vec<_>>()
        .join("\n"))
}

// ── Trigger-based skill selection ──────────────────────────────────────────

static SKILL_TRIGGERS: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    let table: Vec<(&str, Vec<&str>)> = vec![
        (
            "pdf-creation",
            vec![r"(?i)\bpdf\b", r"(?i)\breport\b", r"(?i)\binvoice\b", r"(?i)\bdocument\b"],
        ),
        (
            "excel-editing",
            vec![r"(?i)\bexcel\b", r"(?i)\bxlsx?\b", r"(?i)\bspreadsheet\b", r"(?i)\bworkbook\b"],
        ),
        (
            "docx-editing",
            vec![r"(?i)\bdocx?\b", r"(?i)\bword\s*(?:doc|file)?\b", r"(?i)\bproposal\b", r"(?i)\bmemo\b"],
        ),
        (
            "pptx-editing",
            vec![r"(?i)\bpptx?\b", r"(?i)\bpowerpoint\b", r"(?i)\bslide\b", r"(?i)\bdeck\b", r"(?i)\bpresentation\b"],
        ),
        (
            "browser",
            vec![r"(?i)\bbrowse\b", r"(?i)\bscrape\b", r"(?i)\bwebsite\b", r"(?i)\bweb\s*page\b", r"(?i)\bnavigate\b"],
        ),
        (
            "codebase-engineering",
            vec![
                r"(?i)\bgit(?:hub)?\b",
                r"(?i)\bpull\s*request\b",
                r"(?i)\bcommit\b",
                r"(?i)\brepo(?:sitory)?\b",
                r"(?i)\bmerge\b",
                r"(?i)\bdeploy\b",
            ],
        ),
        (
            "scheduled-crons",
            vec![
                r"(?i)\bschedule\b",
                r"(?i)\bcron\b",
                r"(?i)\brecurring\b",
                r"(?i)\bautomate\b",
                r"(?i)\bevery\s*(?:day|week|hour|morning)\b",
            ],
        ),
        (
            "integrations",
            vec![
                r"(?i)\bintegrat(?:e|ion)s?\b",
                r"(?i)\bconnect(?:ed|ions?)?\b",
                r"(?i)\btools?\b",
                r"(?i)\bservices?\b",
                r"(?i)\bwhat.+(?:have|connected|available)\b",
            ],
        ),
        (
            "slack-admin",
            vec![r"(?i)\bchannel\b", r"(?i)\binvite\b", r"(?i)\bworkspace\b"],
        ),
        (
            "company",
            vec![
                r"(?i)\b(?:our|the)\s+(?:company|team|product|business)\b",
                r"(?i)\bwho\s+(?:are\s+we|is)\b",
                r"(?i)\bwhat\s+do\s+(?:we|you)\s+(?:do|know)\b",
            ],
        ),
    ];
    table
        .into_iter()
        .map(|(name, patterns)| {
            (
                name,
                patterns
                    .into_iter()
                    .map(|p| Regex::new(p).expect("skill trigger regex"))
                    .collect(),
            )
        })
        .collect()
});

/// Detect which skills are relevant to a message, ranked by match count.
/// Returns up to MAX_INJECTED_SKILLS names.
pub fn detect_relevant_skills(message: &str) -> Vec<String> {
    let mut scores: Vec<(&str, usize)> = SKILL_TRIGGERS
        .iter()
        .filter_map(|(name, patterns)| {
            let count = patterns.iter().filter(|p| p.is_match(message)).count();
            (count > 0).then_some((*name, count))
        })
        .collect();
    scores.sort_by(|a, b| b.1.cmp(&a.1));
    scores
        .into_iter()
        .take(MAX_INJECTED_SKILLS)
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Load full bodies of skills relevant to the message, capped at
/// MAX_SKILL_CONTENT_CHARS with a visible truncation marker.
pub fn load_relevant_skill_content(ws: &WorkspaceStore, message: &str) -> EngineResult<String> {
    let names = detect_relevant_skills(message);
    if names.is_empty() {
        return Ok(String::new());
    }

    let all = list_skills(ws)?;
    let by_name: HashMap<&str, &SkillInfo> =
        all.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut sections = Vec::new();
    let mut total = 0usize;

    for name in &names {
        let Some(skill) = by_name.get(name.as_str()) else {
            continue;
        };
        let Some(content) = ws.read(&skill.path)? else {
            continue;
        };
        let (_, body) = parse_frontmatter(&content);
        if body.trim().is_empty() {
            continue;
        }

        let body = if total + body.len() > MAX_SKILL_CONTENT_CHARS {
            let remaining = MAX_SKILL_CONTENT_CHARS.saturating_sub(total);
            if remaining < MIN_REMAINING_FOR_TRUNCATION {
                break;
            }
            format!(
                "{}{}",
                crate::atoms::types::truncate_utf8(&body, remaining),
                TRUNCATION_MARKER
            )
        } else {
            body
        };

        total += body.len();
        sections.push(format!("### Skill: {}\n{}", name, body.trim()));
    }

    Ok(sections.join("\n\n"))
}

/// Load the bodies of named skills (used for intent → prompt-module
/// injection). Missing names are silently skipped: a workspace that
/// hasn't customized a module just gets nothing.
pub fn load_named_skill_content(ws: &WorkspaceStore, names: &[&str]) -> EngineResult<String> {
    if names.is_empty() {
        return Ok(String::new());
    }
    let all = list_skills(ws)?;
    let mut sections = Vec::new();
    let mut total = 0usize;

    for name in names {
        let Some(skill) = all.iter().find(|s| s.name == *name) else {
            continue;
        };
        let Some(content) = ws.read(&skill.path)? else {
            continue;
        };
        let (_, body) = parse_frontmatter(&content);
        if body.trim().is_empty() || total + body.len() > MAX_SKILL_CONTENT_CHARS {
            continue;
        }
        total += body.len();
        sections.push(format!("### Skill: {}\n{}", name, body.trim()));
    }
    Ok(sections.join("\n\n"))
}

/// Load the team and company bodies for direct prompt injection — small,
/// frequently-needed files the model should always see without tool calls.
pub fn key_skill_content(ws: &WorkspaceStore) -> EngineResult<String> {
    let mut sections = Vec::new();
    for (subdir, label) in [("team", "Team Directory"), ("company", "Company Info")] {
        if let Some(content) = ws.read(&format!("{}/SKILL.md", subdir))? {
            let (_, body) = parse_frontmatter(&content);
            if !body.trim().is_empty() {
                sections.push(format!("### {}\n{}", label, body.trim()));
            }
        }
    }
    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "---\nname: browser\ndescription: Drives a web browser.\n---\n\n# Browser\nUse the gateway web_fetch tool.";

    #[test]
    fn test_parse_frontmatter() {
        let (meta, body) = parse_frontmatter(SAMPLE);
        assert_eq!(meta.get("name").unwrap(), "browser");
        assert_eq!(meta.get("description").unwrap(), "Drives a web browser.");
        assert!(body.starts_with("# Browser"));
    }

    #[test]
    fn test_parse_frontmatter_absent() {
        let (meta, body) = parse_frontmatter("just a plain file");
        assert!(meta.is_empty());
        assert_eq!(body, "just a plain file");
    }

    #[test]
    fn test_parse_frontmatter_unterminated() {
        let (meta, _) = parse_frontmatter("---\nname: x\nno closer");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_detect_relevant_skills_ranked() {
        let detected = detect_relevant_skills("open a pull request and merge the repo changes");
        assert_eq!(detected.first().map(String::as_str), Some("codebase-engineering"));
    }

    #[test]
    fn test_detect_relevant_skills_cap() {
        let msg = "make a pdf report spreadsheet slide deck on github and schedule a cron";
        assert!(detect_relevant_skills(msg).len() <= MAX_INJECTED_SKILLS);
    }

    #[test]
    fn test_list_and_inject() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();
        ws.write("skills/browser/SKILL.md", SAMPLE).unwrap();
        ws.write(
            "team/SKILL.md",
            "---\nname: team\ndescription: Team members and roles.\n---\n| Name |",
        )
        .unwrap();

        let skills = list_skills(&ws).unwrap();
        assert_eq!(skills.len(), 2);

        let descriptions = skill_descriptions_for_prompt(&ws).unwrap();
        assert!(descriptions.contains("- browser: Drives a web browser."));

        let injected = load_relevant_skill_content(&ws, "please browse that website").unwrap();
        assert!(injected.contains("### Skill: browser"));
    }

    #[test]
    fn test_injection_truncates_with_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();
        let huge_body = "x".repeat(MAX_SKILL_CONTENT_CHARS + 5_000);
        ws.write(
            "skills/browser/SKILL.md",
            &format!("---\nname: browser\ndescription: d\n---\n{}", huge_body),
        )
        .unwrap();

        let injected = load_relevant_skill_content(&ws, "browse the website").unwrap();
        assert!(injected.ends_with(TRUNCATION_MARKER));
        assert!(injected.len() <= MAX_SKILL_CONTENT_CHARS + TRUNCATION_MARKER.len() + 64);
    }
}
