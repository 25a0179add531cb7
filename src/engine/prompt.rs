// Lucy Engine — System Prompt Builder
//
// Pure composition over explicit sections: persona, instructions, skill
// descriptions, relevant skill bodies, knowledge, session memory,
// environment, custom integrations. Each section is independently
// testable; nothing mutates a shared buffer out of band.
//
// The persona and template files are re-read on every call so edits take
// effect without a restart. Nothing from one workspace ever reaches the
// prompt of another: every dynamic section comes off the passed-in store.

use crate::atoms::error::EngineResult;
use crate::engine::workspace::{memory, skills, WorkspaceStore};
use log::debug;
use std::path::{Path, PathBuf};

/// A custom integration the workspace built via the wrapper path.
#[derive(Debug, Clone)]
pub struct CustomIntegration {
    pub service_name: String,
    pub slug: String,
    pub total_tools: usize,
    pub sample_tools: Vec<String>,
    pub ready: bool,
}

pub struct PromptBuilder {
    assets_dir: PathBuf,
}

impl PromptBuilder {
    pub fn new(assets_dir: &Path) -> Self {
        PromptBuilder {
            assets_dir: assets_dir.to_path_buf(),
        }
    }

    /// Build the complete system prompt for one workspace request.
    pub fn build(
        &self,
        ws: &WorkspaceStore,
        connected_services: Option<&[String]>,
        custom_integrations: &[CustomIntegration],
        user_message: Option<&str>,
    ) -> EngineResult<String> {
        let persona = self.load_persona();
        let template = self.load_template();

        let skill_descriptions = skills::skill_descriptions_for_prompt(ws)?;
        let instructions = template.replace("{available_skills}", &skill_descriptions);

        let mut prompt = format!("{}\n\n---\n\n{}", persona, instructions);

        if let Some(message) = user_message {
            let relevant = skills::load_relevant_skill_content(ws, message)?;
            if !relevant.is_empty() {
                prompt.push_str(&format!(
                    "\n\n<relevant_skill_details>\n\
                     The following skill details are relevant to the current request. \
                     Use these implementation details, code patterns, and best practices \
                     to deliver high-quality output.\n\n{}\n</relevant_skill_details>",
                    relevant
                ));
            }
        }

        let knowledge = skills::key_skill_content(ws)?;
        if !knowledge.is_empty() {
            prompt.push_str(&format!("\n\n<knowledge>\n{}\n</knowledge>", knowledge));
        }

        let session = memory::session_context_for_prompt(ws)?;
        if !session.is_empty() {
            prompt.push_str(&format!("\n\n<session_memory>\n{}\n</session_memory>", session));
        }

        if let Some(services) = connected_services {
            if !services.is_empty() {
                prompt.push_str(&environment_section(services));
            }
        }

        if !custom_integrations.is_empty() {
            prompt.push_str(&custom_integrations_section(custom_integrations));
        }

        debug!(
            "[prompt] Built for {} ({} chars)",
            ws.workspace_id(),
            prompt.len()
        );
        Ok(prompt)
    }

    fn load_persona(&self) -> String {
        std::fs::read_to_string(self.assets_dir.join("SOUL.md")).unwrap_or_else(|_| {
            "You are Lucy, an AI coworker. Direct, helpful, gets things done. \
             Lives in Slack with access to tools and integrations."
                .to_string()
        })
    }

    fn load_template(&self) -> String {
        std::fs::read_to_string(self.assets_dir.join("SYSTEM_PROMPT.md")).unwrap_or_else(|_| {
            "You are Lucy, an AI coworker in Slack.\n\n\
             <available_skills>\n{available_skills}\n</available_skills>"
                .to_string()
        })
    }
}

fn environment_section(services: &[String]) -> String {
    format!(
        "\n\n<current_environment>\n\
         You are communicating via: Slack (already connected and authenticated)\n\
         Connected integrations: {}\n\
         DO NOT ask users to connect any of these — they are already active.\n\
         You are ON Slack — never suggest 'connecting to Slack'.\n\
         When a user asks what integrations are available, list ONLY these.\n\
         </current_environment>",
        services.join(", ")
    )
}

fn custom_integrations_section(integrations: &[CustomIntegration]) -> String {
    let mut lines = vec![
        "\n\n<custom_integrations>".to_string(),
        "IMPORTANT: You have built the following custom integrations. \
         Their tools are in your tool list prefixed with lucy_custom_. \
         When a user asks about one of these services, call the lucy_custom_* \
         tools directly — the meta-broker does not know about them."
            .to_string(),
    ];
    for integration in integrations {
        let mut tool_list = integration.sample_tools.join(", ");
        if integration.total_tools > integration.sample_tools.len() {
            tool_list.push_str(&format!(", ... ({} total)", integration.total_tools));
        }
        let status = if integration.ready { "READY" } else { "needs API key" };
        lines.push(format!(
            "- {} [{}]: use lucy_custom_{}_* tools ({})",
            integration.service_name, status, integration.slug, tool_list
        ));
    }
    lines.push("</custom_integrations>".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T1", tmp.path());
        ws.ensure_structure().unwrap();
        (tmp, ws)
    }

    fn builder() -> (tempfile::TempDir, PromptBuilder) {
        let assets = tempfile::tempdir().unwrap();
        let builder = PromptBuilder::new(assets.path());
        (assets, builder)
    }

    #[test]
    fn test_available_skills_substituted() {
        let (_t, ws) = workspace();
        ws.write(
            "skills/browser/SKILL.md",
            "---\nname: browser\ndescription: Drives the browser.\n---\nbody",
        )
        .unwrap();
        let (_a, builder) = builder();
        let prompt = builder.build(&ws, None, &[], None).unwrap();
        assert!(prompt.contains("- browser: Drives the browser."));
        assert!(!prompt.contains("{available_skills}"));
    }

    #[test]
    fn test_environment_block_lists_only_connected() {
        let (_t, ws) = workspace();
        let (_a, builder) = builder();
        let services = vec!["googlecalendar".to_string(), "github".to_string()];
        let prompt = builder.build(&ws, Some(&services), &[], None).unwrap();
        assert!(prompt.contains("Connected integrations: googlecalendar, github"));
        assert!(prompt.contains("never suggest 'connecting to Slack'"));
    }

    #[test]
    fn test_no_environment_block_when_unknown() {
        let (_t, ws) = workspace();
        let (_a, builder) = builder();
        let prompt = builder.build(&ws, None, &[], None).unwrap();
        assert!(!prompt.contains("<current_environment>"));
    }

    #[test]
    fn test_relevant_skill_bodies_injected() {
        let (_t, ws) = workspace();
        ws.write(
            "skills/browser/SKILL.md",
            "---\nname: browser\ndescription: Drives the browser.\n---\nUse web_fetch for pages.",
        )
        .unwrap();
        let (_a, builder) = builder();
        let prompt = builder
            .build(&ws, None, &[], Some("scrape that website for me"))
            .unwrap();
        assert!(prompt.contains("<relevant_skill_details>"));
        assert!(prompt.contains("Use web_fetch for pages."));
    }

    #[test]
    fn test_session_memory_block() {
        let (_t, ws) = workspace();
        memory::add_session_fact(&ws, "MRR is $42k", "chat", "company").unwrap();
        let (_a, builder) = builder();
        let prompt = builder.build(&ws, None, &[], None).unwrap();
        assert!(prompt.contains("<session_memory>"));
        assert!(prompt.contains("MRR is $42k"));
    }

    #[test]
    fn test_custom_integrations_readiness() {
        let (_t, ws) = workspace();
        let (_a, builder) = builder();
        let integrations = vec![CustomIntegration {
            service_name: "Polar".into(),
            slug: "polar".into(),
            total_tools: 12,
            sample_tools: vec!["lucy_custom_polar_orders".into()],
            ready: false,
        }];
        let prompt = builder.build(&ws, None, &integrations, None).unwrap();
        assert!(prompt.contains("Polar [needs API key]"));
        assert!(prompt.contains("(12 total)"));
    }

    #[test]
    fn test_persona_reread_each_call() {
        let (_t, ws) = workspace();
        let assets = tempfile::tempdir().unwrap();
        let builder = PromptBuilder::new(assets.path());

        std::fs::write(assets.path().join("SOUL.md"), "First persona.").unwrap();
        assert!(builder.build(&ws, None, &[], None).unwrap().contains("First persona."));

        std::fs::write(assets.path().join("SOUL.md"), "Second persona.").unwrap();
        assert!(builder.build(&ws, None, &[], None).unwrap().contains("Second persona."));
    }
}
